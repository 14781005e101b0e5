// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The recursive page-table engine: installs, removes, remaps and
//! re-protects mappings across the 4-level x86-64 page-table hierarchy.
//!
//! This crate owns no memory of its own. Every method on
//! [`PageTableEngine`] walks nodes reached through a [`TableSource`],
//! which is how the crate stays testable: production code backs it with
//! the huge-backed table-page heap (see `tablealloc`), while this
//! crate's own tests back it with an in-memory mock (see the `mock`
//! module, test-only).
//!
//! Every structural mutation takes the page-table lock for its whole
//! duration, then drops it and synchronously drains the [`flush::FlushEntry`]
//! it accumulated, per the locking discipline described alongside
//! `tablealloc` and `backedheap`.

#![no_std]

extern crate alloc;

mod entry;
mod engine;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use entry::{intersects_huge_backed, protection_mask, PageFlags, PAGE_SIZE};
pub use engine::{level_size, MapError, PageTableEngine, TableSource};

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::MockTableSource;
    use alloc::{vec, vec::Vec};
    use x86_64::{PhysAddr, VirtAddr};

    fn engine(source: &MockTableSource) -> PageTableEngine<'_> {
        PageTableEngine::new(source, source.root(), None)
    }

    const KERNEL_BASE: u64 = 0xffff_8000_0000_0000;

    #[test]
    fn round_trip_two_pages() {
        let source = MockTableSource::new();
        let e = engine(&source);
        let v = VirtAddr::new(KERNEL_BASE + 0x4000_0000);
        let p = PhysAddr::new(0x1000);

        e.map(v, p, 0x2000, PageFlags::kernel_data()).expect("map should succeed");
        assert!(e.validate_virtual(v, 0x2000));

        let mut seen = Vec::new();
        e.traverse_ptes(v, 0x2000, |level, va, pte| {
            if level == 3 {
                seen.push((va.as_u64(), pte.addr().as_u64()));
            }
            true
        });
        assert_eq!(seen, vec![(v.as_u64(), 0x1000), (v.as_u64() + 0x1000, 0x2000)]);

        e.unmap(v, 0x2000);
        assert!(!e.validate_virtual(v, 0x2000));
    }

    #[test]
    fn promotion_to_block_without_minpage() {
        let source = MockTableSource::new();
        let e = engine(&source);
        let two_mib = 0x20_0000u64;
        let v = VirtAddr::new(KERNEL_BASE + 0x4000_0000);
        let p = PhysAddr::new(two_mib);

        e.map(v, p, two_mib, PageFlags::kernel_data()).expect("map should succeed");

        let mut leaves = Vec::new();
        e.traverse_ptes(v, two_mib, |level, va, _pte| {
            if level == 2 || level == 3 {
                leaves.push((level, va.as_u64()));
            }
            true
        });
        assert_eq!(leaves, vec![(2, v.as_u64())]);
    }

    #[test]
    fn minpage_required_forces_leaves() {
        let source = MockTableSource::new();
        let e = engine(&source);
        let two_mib = 0x20_0000u64;
        let v = VirtAddr::new(KERNEL_BASE + 0x4000_0000);
        let p = PhysAddr::new(two_mib);
        let flags = PageFlags::kernel_data().minpage_required(true);

        e.map(v, p, two_mib, flags).expect("map should succeed");

        let mut leaf_count = 0;
        e.traverse_ptes(v, two_mib, |level, _va, _pte| {
            if level == 3 {
                leaf_count += 1;
            }
            true
        });
        assert_eq!(leaf_count, (two_mib / PAGE_SIZE) as usize);
    }

    #[test]
    fn no_overwrite_leaves_existing_mapping_unchanged() {
        let source = MockTableSource::new();
        let e = engine(&source);
        let v = VirtAddr::new(KERNEL_BASE + 0x4000_0000);

        e.map(v, PhysAddr::new(0x1000), PAGE_SIZE, PageFlags::kernel_data())
            .expect("first map should succeed");
        let result = e.map(v, PhysAddr::new(0x9000), PAGE_SIZE, PageFlags::kernel_data());
        assert_eq!(result, Err(MapError::AlreadyMapped));

        let mut frame = None;
        e.traverse_ptes(v, PAGE_SIZE, |_level, _va, pte| {
            frame = Some(pte.addr().as_u64());
            true
        });
        assert_eq!(frame, Some(0x1000));
    }

    #[test]
    fn update_map_flags_preserves_frame() {
        let source = MockTableSource::new();
        let e = engine(&source);
        let v = VirtAddr::new(KERNEL_BASE + 0x4000_0000);

        e.map(v, PhysAddr::new(0x1000), PAGE_SIZE, PageFlags::kernel_data())
            .expect("map should succeed");
        e.update_map_flags(v, PAGE_SIZE, PageFlags::new().no_execute(true));

        let mut frame = None;
        let mut writable = true;
        e.traverse_ptes(v, PAGE_SIZE, |_level, _va, pte| {
            frame = Some(pte.addr().as_u64());
            writable = pte.flags().contains(x86_64::structures::paging::PageTableFlags::WRITABLE);
            true
        });
        assert_eq!(frame, Some(0x1000));
        assert!(!writable);
    }

    #[test]
    #[should_panic]
    fn update_map_flags_on_huge_backed_is_fatal() {
        let source = MockTableSource::new();
        let e = engine(&source);
        let huge_backed = memlayout::tagged_addr(memlayout::Tag::HugeBackedTables, 0);
        e.update_map_flags(huge_backed, PAGE_SIZE, PageFlags::new());
    }

    #[test]
    fn remap_moves_frames_and_clears_source() {
        let source = MockTableSource::new();
        let e = engine(&source);
        let old = VirtAddr::new(KERNEL_BASE + 0x4000_0000);
        let new = VirtAddr::new(KERNEL_BASE + 0x5000_0000);

        e.map(old, PhysAddr::new(0x1000), 0x2000, PageFlags::kernel_data())
            .expect("map should succeed");
        e.remap_pages(new, old, 0x2000);

        assert!(!e.validate_virtual(old, 0x2000));
        assert!(e.validate_virtual(new, 0x2000));

        let mut frames = Vec::new();
        e.traverse_ptes(new, 0x2000, |level, _va, pte| {
            if level == 3 {
                frames.push(pte.addr().as_u64());
            }
            true
        });
        assert_eq!(frames, vec![0x1000, 0x2000]);
    }

    #[test]
    fn unmap_reports_coalesced_range_once() {
        let source = MockTableSource::new();
        let e = engine(&source);
        let v = VirtAddr::new(KERNEL_BASE + 0x4000_0000);

        e.map(v, PhysAddr::new(0x1000), 0x2000, PageFlags::kernel_data())
            .expect("map should succeed");

        let mut reported = Vec::new();
        e.unmap_pages_with_handler(v, 0x2000, Some(&mut |start: PhysAddr, end: PhysAddr| {
            reported.push((start.as_u64(), end.as_u64()));
        }));
        assert_eq!(reported, vec![(0x1000, 0x3000)]);
    }
}

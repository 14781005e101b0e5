// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Composes a virtual-address allocator, a physical-frame allocator, and
//! the page-table engine into a single allocate/deallocate interface
//! that yields mapped virtual memory.

use spin::Mutex;
use x86_64::instructions::interrupts::without_interrupts;
use x86_64::{PhysAddr, VirtAddr};

use pagetable::{PageFlags, PageTableEngine};

use crate::range_alloc::{RangeAllocator, INVALID};

/// A composite allocator tying a virtual-address allocator, a physical-
/// frame allocator, and a [`PageTableEngine`] into one `alloc_map` /
/// `dealloc_unmap` interface.
///
/// When constructed with `locking = true`, every entry point takes an
/// IRQ-disabling spinlock around the allocator-state mutations. This
/// serializes the heap's own bookkeeping; it is independent of (and
/// always taken before) the page-table lock the engine acquires inside
/// `map`/`unmap`, per the locking order kernel lock -> heap lock ->
/// `pt_lock`.
pub struct BackedHeap<'a> {
    virt: &'a dyn RangeAllocator,
    phys: &'a dyn RangeAllocator,
    engine: &'a PageTableEngine<'a>,
    pagesize: u64,
    guard: Option<Mutex<()>>,
}

impl<'a> BackedHeap<'a> {
    /// Creates a physically-backed heap over `virt` and `phys`, mapping
    /// through `engine`. `pagesize` is the granularity every request is
    /// rounded up to; it would normally match both sub-allocators'
    /// `pagesize()`.
    pub fn new(
        virt: &'a dyn RangeAllocator,
        phys: &'a dyn RangeAllocator,
        engine: &'a PageTableEngine<'a>,
        pagesize: u64,
        locking: bool,
    ) -> Self {
        BackedHeap {
            virt,
            phys,
            engine,
            pagesize,
            guard: if locking { Some(Mutex::new(())) } else { None },
        }
    }

    fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.guard {
            None => f(),
            Some(lock) => without_interrupts(|| {
                let _guard = lock.lock();
                f()
            }),
        }
    }

    /// The granularity every allocation is rounded up to.
    pub fn pagesize(&self) -> u64 {
        self.pagesize
    }

    /// Allocates `len` bytes (rounded up to [`Self::pagesize`]), backs
    /// them with physical frames, and maps them writable. Returns the
    /// mapped virtual address and the physical address backing it, or
    /// [`INVALID`] (with no physical address) on failure.
    ///
    /// Failure rolls back whichever partial reservation it made: if the
    /// virtual reservation fails after the physical one succeeded, the
    /// physical range is released before returning.
    pub fn alloc_map(&self, len: u64) -> (u64, Option<PhysAddr>) {
        let len = align_up(len, self.pagesize);

        self.with_lock(|| {
            let phys = self.phys.alloc(len);
            if phys == INVALID {
                return (INVALID, None);
            }

            let virt = self.virt.alloc(len);
            if virt == INVALID {
                self.phys.dealloc(phys, len);
                return (INVALID, None);
            }

            let flags = PageFlags::kernel_data();
            self.engine
                .map(VirtAddr::new(virt), PhysAddr::new(phys), len, flags)
                .expect("backed-heap mapping should never collide with an existing one");

            (virt, Some(PhysAddr::new(phys)))
        })
    }

    /// Unmaps `[virt, virt+len)` and returns both the virtual range and
    /// the frames backing it (`phys`, if given, or else looked up by
    /// walking the page table) to their respective allocators.
    ///
    /// # Panics
    ///
    /// Panics (rather than silently corrupting allocator state) if
    /// `virt` is not `pagesize`-aligned, or if `phys` was not given and
    /// the range is not actually mapped.
    pub fn dealloc_unmap(&self, virt: u64, phys: Option<PhysAddr>, len: u64) {
        let len = align_up(len, self.pagesize);
        if virt % self.pagesize != 0 {
            serial::println!(
                "backedheap: dealloc_unmap called with misaligned address {:#x}; leaking to avoid corrupting allocator state",
                virt
            );
            return;
        }

        self.with_lock(|| {
            let phys = match phys {
                Some(p) => p,
                None => self
                    .physical_from_virtual(virt)
                    .expect("dealloc_unmap: virtual range is not mapped and no physical address was given"),
            };

            self.engine.unmap(VirtAddr::new(virt), len);
            self.phys.dealloc(phys.as_u64(), len);
            self.virt.dealloc(virt, len);
        });
    }

    /// Unmaps `[virt, virt+len)` and returns only the virtual range to
    /// its allocator. Used when the physical frames backing the range
    /// are owned elsewhere and must not be freed here.
    pub fn dealloc_virtual(&self, virt: u64, len: u64) {
        let len = align_up(len, self.pagesize);
        if virt % self.pagesize != 0 {
            serial::println!(
                "backedheap: dealloc_virtual called with misaligned address {:#x}; leaking to avoid corrupting allocator state",
                virt
            );
            return;
        }

        self.with_lock(|| {
            self.engine.unmap(VirtAddr::new(virt), len);
            self.virt.dealloc(virt, len);
        });
    }

    /// Looks up the physical address currently backing `virt`, by
    /// reading the first present PTE in range.
    fn physical_from_virtual(&self, virt: u64) -> Option<PhysAddr> {
        let mut found = None;
        self.engine.traverse_ptes(VirtAddr::new(virt), self.pagesize, |_level, _va, pte| {
            found = Some(pte.addr());
            false
        });
        found
    }
}

fn align_up(len: u64, pagesize: u64) -> u64 {
    align::align_up_u64(len.max(1), pagesize)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::range_alloc::BitmapRangeAllocator;
    use pagetable::PageTableEngine;

    const KERNEL_BASE: u64 = 0xffff_8000_0000_0000;

    #[test]
    fn alloc_map_rolls_back_virtual_on_success_path() {
        let source = pagetable_mock();
        let engine = PageTableEngine::new(&source, source.root(), None);
        let phys = BitmapRangeAllocator::new(0x1000, 0x1000, 4);
        let virt = BitmapRangeAllocator::new(KERNEL_BASE + 0x4000_0000, 0x1000, 4);
        let heap = BackedHeap::new(&virt, &phys, &engine, 0x1000, false);

        let (v, p) = heap.alloc_map(0x2000);
        assert_ne!(v, INVALID);
        assert!(p.is_some());
        assert_eq!(phys.free_pages(), 2);
        assert_eq!(virt.free_pages(), 2);

        heap.dealloc_unmap(v, p, 0x2000);
        assert_eq!(phys.free_pages(), 4);
        assert_eq!(virt.free_pages(), 4);
    }

    #[test]
    fn alloc_map_rolls_back_physical_on_virtual_exhaustion() {
        let source = pagetable_mock();
        let engine = PageTableEngine::new(&source, source.root(), None);
        let phys = BitmapRangeAllocator::new(0x1000, 0x1000, 4);
        let virt = BitmapRangeAllocator::new(KERNEL_BASE + 0x4000_0000, 0x1000, 0);
        let heap = BackedHeap::new(&virt, &phys, &engine, 0x1000, false);

        let before = phys.free_pages();
        let (v, p) = heap.alloc_map(0x1000);
        assert_eq!(v, INVALID);
        assert!(p.is_none());
        assert_eq!(phys.free_pages(), before);
    }

    #[test]
    fn dealloc_unmap_looks_up_physical_when_not_given() {
        let source = pagetable_mock();
        let engine = PageTableEngine::new(&source, source.root(), None);
        let phys = BitmapRangeAllocator::new(0x1000, 0x1000, 4);
        let virt = BitmapRangeAllocator::new(KERNEL_BASE + 0x4000_0000, 0x1000, 4);
        let heap = BackedHeap::new(&virt, &phys, &engine, 0x1000, false);

        let (v, _) = heap.alloc_map(0x1000);
        heap.dealloc_unmap(v, None, 0x1000);
        assert_eq!(phys.free_pages(), 4);
    }

    #[test]
    fn dealloc_virtual_preserves_physical_allocation() {
        let source = pagetable_mock();
        let engine = PageTableEngine::new(&source, source.root(), None);
        let phys = BitmapRangeAllocator::new(0x1000, 0x1000, 4);
        let virt = BitmapRangeAllocator::new(KERNEL_BASE + 0x4000_0000, 0x1000, 4);
        let heap = BackedHeap::new(&virt, &phys, &engine, 0x1000, false);

        let (v, _) = heap.alloc_map(0x1000);
        heap.dealloc_virtual(v, 0x1000);
        assert_eq!(virt.free_pages(), 4);
        assert_eq!(phys.free_pages(), 3);
    }

    fn pagetable_mock() -> pagetable::mock::MockTableSource {
        pagetable::mock::MockTableSource::new()
    }
}

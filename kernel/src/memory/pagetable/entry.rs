// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The software-visible page flags this crate accepts, and the hardware
//! [`PageTableFlags`] they compile down to.

use memlayout::{Tag, TAG_WINDOW_SIZE};
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

/// The size in bytes of a leaf page (the smallest unit this engine maps).
pub const PAGE_SIZE: u64 = 4096;

/// An opaque bag of page protection bits, plus the one software-only bit
/// that controls large-page promotion.
///
/// `minpage_required` never reaches hardware: it is consulted only by
/// [`crate::PageTableEngine::map`] to decide whether a range may be
/// installed as a block mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageFlags {
    writable: bool,
    user_accessible: bool,
    no_execute: bool,
    write_through: bool,
    no_cache: bool,
    global: bool,
    pub minpage_required: bool,
}

impl PageFlags {
    /// Read-only, supervisor-only, cacheable, executable, 4 KiB-granular.
    pub const fn new() -> Self {
        PageFlags {
            writable: false,
            user_accessible: false,
            no_execute: false,
            write_through: false,
            no_cache: false,
            global: false,
            minpage_required: false,
        }
    }

    pub const fn writable(mut self, yes: bool) -> Self {
        self.writable = yes;
        self
    }

    pub const fn user_accessible(mut self, yes: bool) -> Self {
        self.user_accessible = yes;
        self
    }

    pub const fn no_execute(mut self, yes: bool) -> Self {
        self.no_execute = yes;
        self
    }

    pub const fn write_through(mut self, yes: bool) -> Self {
        self.write_through = yes;
        self
    }

    pub const fn no_cache(mut self, yes: bool) -> Self {
        self.no_cache = yes;
        self
    }

    pub const fn global(mut self, yes: bool) -> Self {
        self.global = yes;
        self
    }

    pub const fn minpage_required(mut self, yes: bool) -> Self {
        self.minpage_required = yes;
        self
    }

    /// Convenience constructor for ordinary kernel read/write data.
    pub const fn kernel_data() -> Self {
        Self::new().writable(true).no_execute(true)
    }

    /// Convenience constructor for user-accessible read/write data.
    pub const fn user_data() -> Self {
        Self::new().writable(true).user_accessible(true).no_execute(true)
    }

    /// The hardware flags implied by this bag. Always includes `PRESENT`;
    /// does not set `HUGE_PAGE`, which the engine adds itself when
    /// installing a block mapping.
    pub fn hw(&self) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT;
        if self.writable {
            flags |= PageTableFlags::WRITABLE;
        }
        if self.user_accessible {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        if self.no_execute {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        if self.write_through {
            flags |= PageTableFlags::WRITE_THROUGH;
        }
        if self.no_cache {
            flags |= PageTableFlags::NO_CACHE;
        }
        if self.global {
            flags |= PageTableFlags::GLOBAL;
        }
        flags
    }
}

/// The protection bits `update_map_flags` is allowed to overwrite.
///
/// The source this kernel is modelled on cleared the whole flags word and
/// ORed in the caller's bits verbatim, which would happily scribble over
/// `ACCESSED`, `DIRTY` and `HUGE_PAGE`. We restrict the overwrite to the
/// bits that are actually "protection": presence, writability, privilege
/// level, caching mode and no-execute. The frame number, `ACCESSED`,
/// `DIRTY` and `HUGE_PAGE` are always preserved from the existing entry.
pub fn protection_mask() -> PageTableFlags {
    PageTableFlags::PRESENT
        | PageTableFlags::WRITABLE
        | PageTableFlags::USER_ACCESSIBLE
        | PageTableFlags::WRITE_THROUGH
        | PageTableFlags::NO_CACHE
        | PageTableFlags::GLOBAL
        | PageTableFlags::NO_EXECUTE
}

/// Whether `[v, v+length)` intersects the huge-backed translation window.
///
/// `update_map_flags` must never be applied there: huge-backed mappings
/// are a single global translation shared by every table-page allocation,
/// not a per-caller mapping whose protection can be changed in isolation.
pub fn intersects_huge_backed(v: VirtAddr, length: u64) -> bool {
    let window_start = memlayout::tagged_addr(Tag::HugeBackedTables, 0).as_u64();
    let window_end = window_start + TAG_WINDOW_SIZE;
    let start = v.as_u64();
    let end = start + length;
    start < window_end && window_start < end
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hw_always_present() {
        assert!(PageFlags::new().hw().contains(PageTableFlags::PRESENT));
    }

    #[test]
    fn builders_set_expected_bits() {
        let flags = PageFlags::new().writable(true).user_accessible(true);
        let hw = flags.hw();
        assert!(hw.contains(PageTableFlags::WRITABLE));
        assert!(hw.contains(PageTableFlags::USER_ACCESSIBLE));
        assert!(!hw.contains(PageTableFlags::NO_EXECUTE));
    }

    #[test]
    fn huge_backed_window_self_intersects() {
        let start = memlayout::tagged_addr(Tag::HugeBackedTables, 0);
        assert!(intersects_huge_backed(start, PAGE_SIZE));
    }

    #[test]
    fn ordinary_range_does_not_intersect() {
        assert!(!intersects_huge_backed(VirtAddr::new(0xffff_8100_0000_0000), PAGE_SIZE));
    }
}

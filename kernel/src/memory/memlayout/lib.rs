// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Describes the layout of the virtual and physical address spaces.
//!
//! This crate has no behaviour of its own: it is the set of constants and
//! small range types that every other memory crate agrees on, so that
//! "the kernel half" or "frame 3" mean the same thing everywhere.
//!
//! ## Canonical halves
//!
//! x86-64 addresses are 48 bits wide, sign-extended through bit 63. That
//! splits the address space into a user half (`[0, 2^47)`) and a kernel
//! half (`[0xffff_8000_0000_0000, 2^64)`). [`KERNEL_HALF_START`] is the
//! first canonical kernel address.
//!
//! ## Tagged regions
//!
//! Within the kernel half, bits `[VA_TAG_OFFSET, VA_TAG_OFFSET+VA_TAG_WIDTH)`
//! encode an 8-bit tag identifying the subsystem that owns a particular
//! `2^38`-byte window. [`tagged_addr`] builds an address in a tag's window;
//! [`Tag`] enumerates the tags in use by this kernel.

#![no_std]

use core::fmt;
use x86_64::{PhysAddr, VirtAddr};

/// The first canonical virtual address in the kernel half.
pub const KERNEL_HALF_START: u64 = 0xffff_8000_0000_0000;

/// One past the last canonical virtual address in the user half.
pub const USER_HALF_END: u64 = 0x0000_8000_0000_0000;

/// The bit offset of the tag field within a kernel-half address.
pub const VA_TAG_OFFSET: u64 = 38;

/// The width in bits of the tag field.
pub const VA_TAG_WIDTH: u64 = 8;

/// The number of bytes in a single tag's window.
pub const TAG_WINDOW_SIZE: u64 = 1 << VA_TAG_OFFSET;

/// Identifies the kernel subsystem that owns a tagged virtual-address
/// window. Each variant owns a distinct `2^38`-byte range within the
/// kernel half.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    /// The window used to translate table-page physical addresses back
    /// to virtual addresses once the table-page allocator is backed by
    /// a huge-page heap (see `tablealloc`).
    HugeBackedTables = 0,
    /// The kernel's general-purpose heap.
    KernelHeap = 1,
    /// Memory handed out by a physically-backed heap instance.
    BackedHeap = 2,
    /// Per-CPU data regions (see `cpu::local`).
    CpuLocal = 3,
    /// Per-CPU kernel context stacks.
    KernelStacks = 4,
}

/// Builds the virtual address for `value` within `tag`'s window.
///
/// # Panics
///
/// Panics if `value` does not fit within a single tag window
/// (`value >= TAG_WINDOW_SIZE`).
pub fn tagged_addr(tag: Tag, value: u64) -> VirtAddr {
    assert!(
        value < TAG_WINDOW_SIZE,
        "value {:#x} does not fit within a single tagged window",
        value
    );

    let tag = (tag as u64) << VA_TAG_OFFSET;
    VirtAddr::new(KERNEL_HALF_START | tag | value)
}

/// Returns whether `addr` lies in the canonical kernel half.
#[inline]
pub fn is_kernel_addr(addr: VirtAddr) -> bool {
    addr.as_u64() >= KERNEL_HALF_START
}

/// Returns whether `addr` lies in the canonical user half.
#[inline]
pub fn is_user_addr(addr: VirtAddr) -> bool {
    addr.as_u64() < USER_HALF_END
}

/// A half-open `[start, end)` range of virtual addresses. May be empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtAddrRange {
    start: VirtAddr,
    end: VirtAddr,
}

impl VirtAddrRange {
    /// Creates a new range.
    ///
    /// # Panics
    ///
    /// Panics if `end` is before `start`.
    pub fn new(start: VirtAddr, end: VirtAddr) -> Self {
        assert!(start <= end, "range end before start");
        VirtAddrRange { start, end }
    }

    pub const fn start(&self) -> VirtAddr {
        self.start
    }

    pub const fn end(&self) -> VirtAddr {
        self.end
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Returns whether `self` and `other` share any address.
    pub fn overlaps(&self, other: &VirtAddrRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for VirtAddrRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:p}..{:p}", self.start, self.end)
    }
}

/// A half-open `[start, end)` range of physical addresses. May be empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysAddrRange {
    start: PhysAddr,
    end: PhysAddr,
}

impl PhysAddrRange {
    /// Creates a new range.
    ///
    /// # Panics
    ///
    /// Panics if `end` is before `start`.
    pub fn new(start: PhysAddr, end: PhysAddr) -> Self {
        assert!(start <= end, "range end before start");
        PhysAddrRange { start, end }
    }

    pub const fn start(&self) -> PhysAddr {
        self.start
    }

    pub const fn end(&self) -> PhysAddr {
        self.end
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, addr: PhysAddr) -> bool {
        self.start <= addr && addr < self.end
    }
}

impl fmt::Display for PhysAddrRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:p}..{:p}", self.start, self.end)
    }
}

/// The kernel's general-purpose heap, used for `Box`, `Vec`, and friends.
///
/// Kept modest in size: this kernel's heap is backed by the physically-
/// backed heap in `backedheap`, not by a dedicated bootstrap mapping.
pub const KERNEL_HEAP_SIZE: u64 = 1024 * 1024; // 1 MiB

/// The maximum number of logical CPUs this kernel supports.
///
/// Bounded at 64 so that per-CPU bitmasks (the idle mask, in particular)
/// fit in a single `u64`.
pub const MAX_CPUS: usize = 64;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tagged_windows_are_disjoint() {
        let a = tagged_addr(Tag::KernelHeap, 0);
        let b = tagged_addr(Tag::BackedHeap, 0);
        assert_ne!(a, b);
        assert!(a.as_u64() < b.as_u64());
        assert_eq!(b.as_u64() - a.as_u64(), TAG_WINDOW_SIZE);
    }

    #[test]
    #[should_panic]
    fn tagged_addr_rejects_oversized_value() {
        tagged_addr(Tag::KernelHeap, TAG_WINDOW_SIZE);
    }

    #[test]
    fn halves() {
        assert!(is_kernel_addr(VirtAddr::new(KERNEL_HALF_START)));
        assert!(!is_kernel_addr(VirtAddr::new(KERNEL_HALF_START - 1)));
        assert!(is_user_addr(VirtAddr::new(0)));
        assert!(!is_user_addr(VirtAddr::new(USER_HALF_END)));
    }

    #[test]
    fn range_overlap() {
        let a = VirtAddrRange::new(VirtAddr::new(0x1000), VirtAddr::new(0x3000));
        let b = VirtAddrRange::new(VirtAddr::new(0x2000), VirtAddr::new(0x4000));
        let c = VirtAddrRange::new(VirtAddr::new(0x3000), VirtAddr::new(0x4000));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}

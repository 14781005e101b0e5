// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Supplies zeroed 4 KiB pages for page-table nodes.
//!
//! Has two modes, selected by which constructor brings the allocator up:
//!
//! - [`TablePageAllocator::bootstrap`]: hands out pages from a small
//!   contiguous physical region that is already identity-mapped (boot
//!   code has no page tables of its own yet to walk).
//! - [`TablePageAllocator::switch_to_runtime`]: once the huge-backed
//!   window has been block-mapped 1:1 over a chosen physical range,
//!   table pages are sub-allocated from that range instead, translated
//!   to a virtual address by OR-ing in the window's base rather than by
//!   a fixed offset.
//!
//! Either way, the allocator itself is [`pagetable::TableSource`]: the
//! page-table engine never needs to know which mode is active.

#![no_std]

use memlayout::{tagged_addr, PhysAddrRange, Tag};
use pagetable::TableSource;
use spin::{Mutex, Once};
use x86_64::structures::paging::PageTable;
use x86_64::{PhysAddr, VirtAddr};

/// The granularity this allocator hands pages out at.
pub const TABLE_PAGE_SIZE: u64 = 4096;

/// The granularity runtime mode asks [`TableHeap`] for when its cursor
/// runs dry: one 2 MiB slab at a time, matching the huge-backed
/// window's natural mapping unit.
pub const TABLE_HEAP_ALLOC_SIZE: u64 = 0x20_0000;

/// The refill seam runtime mode draws fresh table-page extents from
/// once its cursor is exhausted. A narrow stand-in for whatever general
/// heap backs the huge-backed window in production; this allocator
/// only ever asks for `len`-byte physical extents and never owns, nor
/// needs to know anything else about, what hands them out.
pub trait TableHeap: Sync {
    /// Returns the physical base of a fresh `len`-byte extent, or
    /// `None` if the heap itself is exhausted.
    fn alloc(&self, len: u64) -> Option<PhysAddr>;
}

#[derive(Clone, Copy)]
enum Translation {
    /// `pte_addr_to_ptr(pa) = pa + offset`.
    Identity { offset: u64 },
    /// `pte_addr_to_ptr(pa) = HUGE_BASE | pa`. Valid only for physical
    /// addresses that fit inside a single tagged window, which a 2 MiB
    /// slab-sized huge-backed region always does.
    HugeBacked { base: u64 },
}

impl Translation {
    fn to_ptr(self, pa: PhysAddr) -> *mut PageTable {
        let va = match self {
            Translation::Identity { offset } => pa.as_u64().wrapping_add(offset),
            Translation::HugeBacked { base } => base | pa.as_u64(),
        };
        va as *mut PageTable
    }
}

struct Cursor {
    next: u64,
    end: u64,
}

/// Supplies zeroed 4 KiB table-page nodes, bootstrap or runtime mode.
pub struct TablePageAllocator {
    translation: Mutex<Translation>,
    cursor: Mutex<Cursor>,
    heap: Once<&'static dyn TableHeap>,
}

impl TablePageAllocator {
    /// Bootstrap mode: pages come from `[initial_physbase,
    /// initial_physbase+extent)`, a region already identity-mapped at
    /// `initial_map`. Single-threaded by construction (called once,
    /// before other CPUs are brought up), but still routed through the
    /// same locks as runtime mode for a uniform implementation.
    pub fn bootstrap(initial_physbase: PhysAddr, extent: u64, initial_map: VirtAddr) -> Self {
        let offset = initial_map.as_u64().wrapping_sub(initial_physbase.as_u64());
        TablePageAllocator {
            translation: Mutex::new(Translation::Identity { offset }),
            cursor: Mutex::new(Cursor {
                next: initial_physbase.as_u64(),
                end: initial_physbase.as_u64() + extent,
            }),
            heap: Once::new(),
        }
    }

    /// Switches to runtime mode. `mapped` must already be block-mapped,
    /// 1:1, into the huge-backed window (see [`memlayout::Tag::HugeBackedTables`]):
    /// this allocator never installs that mapping itself, only consumes
    /// it. Table pages handed out before this call remain valid and are
    /// never reclaimed, per the "table pages are never freed" design
    /// note; only the cursor moves to the new region.
    ///
    /// `heap` is where the cursor refills from once `mapped` itself runs
    /// out; every later exhaustion draws a fresh [`TABLE_HEAP_ALLOC_SIZE`]
    /// extent from it, the same way the original kernel's `pageheap`
    /// backs its `current_phys` cursor.
    pub fn switch_to_runtime(&self, mapped: PhysAddrRange, heap: &'static dyn TableHeap) {
        let base = tagged_addr(Tag::HugeBackedTables, 0).as_u64();
        *self.translation.lock() = Translation::HugeBacked { base };
        *self.cursor.lock() = Cursor {
            next: mapped.start().as_u64(),
            end: mapped.end().as_u64(),
        };
        self.heap.call_once(|| heap);
    }
}

impl TableSource for TablePageAllocator {
    fn node_at(&self, pa: PhysAddr) -> *mut PageTable {
        self.translation.lock().to_ptr(pa)
    }

    fn allocate_table(&self) -> Option<PhysAddr> {
        let pa = {
            let mut cursor = self.cursor.lock();
            if cursor.next + TABLE_PAGE_SIZE > cursor.end {
                // Exhausted: refill from the heap if one is installed.
                // Bootstrap mode never installs one and simply runs
                // out, matching the original kernel's boot-time path.
                let heap = *self.heap.get()?;
                let refill = heap.alloc(TABLE_HEAP_ALLOC_SIZE)?;
                *cursor = Cursor {
                    next: refill.as_u64(),
                    end: refill.as_u64() + TABLE_HEAP_ALLOC_SIZE,
                };
            }
            let pa = cursor.next;
            cursor.next += TABLE_PAGE_SIZE;
            pa
        };

        zero_table_page(self.translation.lock().to_ptr(PhysAddr::new(pa)));
        Some(PhysAddr::new(pa))
    }
}

#[cfg(not(test))]
fn zero_table_page(ptr: *mut PageTable) {
    unsafe {
        core::ptr::write_bytes(ptr as *mut u8, 0, TABLE_PAGE_SIZE as usize);
    }
}

/// The translated pointer in a unit test names host memory that was
/// never mapped; the production path above is the one that actually
/// zeroes the page.
#[cfg(test)]
fn zero_table_page(_ptr: *mut PageTable) {}

static PAGEMEM: Once<TablePageAllocator> = Once::new();

/// Brings up the global table-page allocator in bootstrap mode. Called
/// once, early, before any CPU other than the boot CPU is running.
pub fn init_bootstrap(initial_physbase: PhysAddr, extent: u64, initial_map: VirtAddr) {
    PAGEMEM.call_once(|| TablePageAllocator::bootstrap(initial_physbase, extent, initial_map));
}

/// The global table-page allocator, brought up once by [`init_bootstrap`].
///
/// # Panics
///
/// Panics if called before [`init_bootstrap`].
pub fn pagemem() -> &'static TablePageAllocator {
    PAGEMEM.get().expect("tablealloc::init_bootstrap was never called")
}

#[cfg(test)]
mod test {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn bootstrap_translation_is_fixed_offset() {
        let alloc = TablePageAllocator::bootstrap(PhysAddr::new(0x10_0000), 0x10000, VirtAddr::new(0xffff_8000_0010_0000));
        let ptr = alloc.node_at(PhysAddr::new(0x10_1000));
        assert_eq!(ptr as u64, 0xffff_8000_0010_1000);
    }

    #[test]
    fn bootstrap_cursor_advances_and_exhausts() {
        let alloc = TablePageAllocator::bootstrap(PhysAddr::new(0x10_0000), TABLE_PAGE_SIZE * 2, VirtAddr::new(0xffff_8000_0010_0000));
        let a = alloc.allocate_table().expect("first page should succeed");
        let b = alloc.allocate_table().expect("second page should succeed");
        assert_eq!(a.as_u64(), 0x10_0000);
        assert_eq!(b.as_u64(), 0x10_0000 + TABLE_PAGE_SIZE);
        assert!(alloc.allocate_table().is_none());
    }

    #[test]
    fn switch_to_runtime_uses_huge_backed_translation() {
        let alloc = TablePageAllocator::bootstrap(PhysAddr::new(0x10_0000), TABLE_PAGE_SIZE, VirtAddr::new(0xffff_8000_0010_0000));
        let mapped = PhysAddrRange::new(PhysAddr::new(0x20_0000), PhysAddr::new(0x40_0000));
        alloc.switch_to_runtime(mapped, &NO_REFILL);

        let expected_base = tagged_addr(Tag::HugeBackedTables, 0).as_u64();
        let ptr = alloc.node_at(PhysAddr::new(0x20_1000));
        assert_eq!(ptr as u64, expected_base | 0x20_1000);

        let a = alloc.allocate_table().expect("runtime allocation should succeed");
        assert_eq!(a.as_u64(), 0x20_0000);
    }

    #[test]
    fn runtime_mode_refills_cursor_from_heap_on_exhaustion() {
        let alloc = TablePageAllocator::bootstrap(PhysAddr::new(0x10_0000), TABLE_PAGE_SIZE, VirtAddr::new(0xffff_8000_0010_0000));
        let mapped = PhysAddrRange::new(PhysAddr::new(0x20_0000), PhysAddr::new(0x20_0000) + TABLE_PAGE_SIZE);
        STUB.calls.store(0, Ordering::SeqCst);
        alloc.switch_to_runtime(mapped, &STUB);

        let a = alloc.allocate_table().expect("first page comes from the initial range");
        assert_eq!(a.as_u64(), 0x20_0000);

        let b = alloc.allocate_table().expect("cursor exhaustion should refill from the heap");
        assert_eq!(b.as_u64(), 0x30_0000);
        assert_eq!(STUB.calls.load(Ordering::SeqCst), 1);

        let c = alloc.allocate_table().expect("second page of the refilled extent");
        assert_eq!(c.as_u64(), 0x30_0000 + TABLE_PAGE_SIZE);
        assert_eq!(STUB.calls.load(Ordering::SeqCst), 1, "still inside the extent handed out by the one refill");
    }

    #[test]
    fn allocate_table_returns_none_when_heap_itself_is_exhausted() {
        let alloc = TablePageAllocator::bootstrap(PhysAddr::new(0x10_0000), TABLE_PAGE_SIZE, VirtAddr::new(0xffff_8000_0010_0000));
        let mapped = PhysAddrRange::new(PhysAddr::new(0x20_0000), PhysAddr::new(0x20_0000) + TABLE_PAGE_SIZE);
        alloc.switch_to_runtime(mapped, &NO_REFILL);

        alloc.allocate_table().expect("single page in range should succeed");
        assert!(alloc.allocate_table().is_none());
    }

    struct NoRefillHeap;

    impl TableHeap for NoRefillHeap {
        fn alloc(&self, _len: u64) -> Option<PhysAddr> {
            None
        }
    }

    static NO_REFILL: NoRefillHeap = NoRefillHeap;

    struct StubHeap {
        calls: AtomicUsize,
    }

    impl TableHeap for StubHeap {
        fn alloc(&self, _len: u64) -> Option<PhysAddr> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(PhysAddr::new(0x30_0000))
        }
    }

    static STUB: StubHeap = StubHeap { calls: AtomicUsize::new(0) };
}

// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The recursive 4-level page-table walker, and the handful of
//! operations (`map`, `unmap`, `update_map_flags`, `remap_pages`,
//! `validate_virtual`, `zero_mapped_pages`, `traverse_ptes`) built over
//! it.
//!
//! Every structural mutation is a `map_level` or a pass over [`traverse`];
//! both honor the same index-range math, so there is exactly one place
//! that knows how a virtual address splits into the four 9-bit indices of
//! a PML4/PDPT/PD/PT walk.

use alloc::vec::Vec;
use core::cmp;

use memlayout::VirtAddrRange;
use spin::Mutex;
use x86_64::structures::paging::{PageTable, PageTableEntry, PageTableFlags};
use x86_64::{PhysAddr, VirtAddr};

use crate::entry::{intersects_huge_backed, protection_mask, PageFlags, PAGE_SIZE};

/// The level of the final, leaf-only table (the PT, indexed by bits
/// `20..12`). Levels count down from the root: 0 = PML4, 1 = PDPT,
/// 2 = PD, 3 = PT.
const LEAF_LEVEL: u8 = 3;
const ROOT_LEVEL: u8 = 0;

/// The byte shift of the index field a virtual address carries at
/// `level`. Matches the x86-64 4-level layout: PML4 at bit 39, PDPT at
/// bit 30, PD at bit 21, PT at bit 12.
const fn level_shift(level: u8) -> u32 {
    12 + 9 * (LEAF_LEVEL - level) as u32
}

/// The span of one entry at `level`, if it were installed as a leaf: the
/// page size backing that level (4 KiB, 2 MiB, 1 GiB, ...).
pub const fn level_size(level: u8) -> u64 {
    1u64 << level_shift(level)
}

/// The span covered by an entire table at `level` (512 entries wide).
const fn level_span(level: u8) -> u64 {
    level_size(level) << 9
}

/// Whether `level` may host a block (large-page) mapping. Only PDPT
/// (1 GiB) and PD (2 MiB) entries carry the `PS` bit on this hardware;
/// PML4 entries cannot be huge, and PT entries are always 4 KiB leaves.
const fn is_block_level(level: u8) -> bool {
    level > ROOT_LEVEL && level < LEAF_LEVEL
}

fn level_index(addr: u64, level: u8) -> usize {
    ((addr >> level_shift(level)) & 0x1ff) as usize
}

/// The `[first, last]` inclusive index range `[v_start, v_end)` occupies
/// at `level`.
fn index_range(v_start: u64, v_end: u64, level: u8) -> (usize, usize) {
    let first = level_index(v_start, level);
    let last = level_index(v_end - 1, level);
    (first, last)
}

/// The sub-range of `[v_start, v_end)` that falls within slot `index` of
/// the table being walked at `level`.
fn slot_range(v_start: u64, v_end: u64, level: u8, index: usize) -> (u64, u64) {
    let span = level_span(level);
    let size = level_size(level);
    let table_base = v_start & !(span - 1);
    let slot_base = table_base | ((index as u64) << level_shift(level));
    let lo = cmp::max(v_start, slot_base);
    let hi = cmp::min(v_end, slot_base + size);
    (lo, hi)
}

/// Failure modes for a structural page-table mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// The range (or part of it) is already mapped; no overwrite.
    AlreadyMapped,
    /// A fresh table page could not be allocated.
    TableAllocationFailed,
}

/// The seam between the recursive walker and whatever actually backs a
/// page-table node's physical address with a dereferenceable pointer.
///
/// Production code implements this over the huge-backed table-page heap
/// (see `tablealloc`); tests implement it over an in-memory map of
/// [`PageTable`]s so the walker's logic can be exercised without real
/// hardware.
pub trait TableSource: Send + Sync {
    /// Returns a pointer to the already-allocated 4 KiB node at `pa`.
    ///
    /// # Safety-adjacent contract
    ///
    /// `pa` must name a node previously returned by `allocate_table` (or
    /// the engine's configured root). The returned pointer is valid for
    /// as long as the source itself lives.
    fn node_at(&self, pa: PhysAddr) -> *mut PageTable;

    /// Allocates and zeroes a fresh table-page node, returning its
    /// physical address, or `None` if the allocator is exhausted.
    fn allocate_table(&self) -> Option<PhysAddr>;
}

/// Generic walk over every *present* PTE in `[v_start, v_end)`, starting
/// at `table_ptr`/`level`. `handler` is invoked for every present entry,
/// leaf/block or descriptor alike; if it returns `false` the walk stops
/// immediately (including any remaining siblings). Descriptors are
/// descended into only when the handler accepted them; block and leaf
/// mappings are never descended.
fn traverse<F>(
    source: &dyn TableSource,
    table_ptr: *mut PageTable,
    level: u8,
    v_start: u64,
    v_end: u64,
    handler: &mut F,
) -> bool
where
    F: FnMut(u8, VirtAddr, &mut PageTableEntry) -> bool,
{
    let table = unsafe { &mut *table_ptr };
    let (first, last) = index_range(v_start, v_end, level);
    for index in first..=last {
        let (lo, hi) = slot_range(v_start, v_end, level, index);
        if lo >= hi {
            continue;
        }
        let entry = &mut table[index];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            continue;
        }
        if !handler(level, VirtAddr::new(lo), entry) {
            return false;
        }
        let is_leaf_or_block = level == LEAF_LEVEL || entry.flags().contains(PageTableFlags::HUGE_PAGE);
        if !is_leaf_or_block {
            let child_pa = entry.addr();
            let child_ptr = source.node_at(child_pa);
            if !traverse(source, child_ptr, level + 1, lo, hi, handler) {
                return false;
            }
        }
    }
    true
}

/// Like [`traverse`], but short-circuits to `false` the moment any index
/// in range is absent, rather than invoking a handler. Used by
/// `validate_virtual`, which has no per-PTE side effect to perform.
fn range_present(source: &dyn TableSource, table_ptr: *mut PageTable, level: u8, v_start: u64, v_end: u64) -> bool {
    let table = unsafe { &mut *table_ptr };
    let (first, last) = index_range(v_start, v_end, level);
    for index in first..=last {
        let (lo, hi) = slot_range(v_start, v_end, level, index);
        if lo >= hi {
            continue;
        }
        let entry = &table[index];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return false;
        }
        let is_leaf_or_block = level == LEAF_LEVEL || entry.flags().contains(PageTableFlags::HUGE_PAGE);
        if !is_leaf_or_block {
            let child_pa = entry.addr();
            let child_ptr = source.node_at(child_pa);
            if !range_present(source, child_ptr, level + 1, lo, hi) {
                return false;
            }
        }
    }
    true
}

fn can_promote(level: u8, flags: &PageFlags, lo: u64, hi: u64, phys: u64) -> bool {
    if flags.minpage_required || !is_block_level(level) {
        return false;
    }
    let size = level_size(level);
    lo % size == 0 && phys % size == 0 && (hi - lo) >= size
}

/// Installs PTEs for `[v_start, v_end)`, advancing `*phys` by whatever
/// granularity each slot ends up mapped at. See `4.4.1` in the design
/// notes this module is built from: absent entries are either mapped
/// directly (leaf level), promoted to a block, or given a fresh child
/// table; present entries recurse if they are descriptors and fail the
/// whole walk if they are already a mapping.
fn map_level(
    source: &dyn TableSource,
    table_ptr: *mut PageTable,
    level: u8,
    v_start: u64,
    v_end: u64,
    phys: &mut u64,
    flags: PageFlags,
    fe: &mut flush::FlushEntry,
) -> Result<(), MapError> {
    let table = unsafe { &mut *table_ptr };
    let (first, last) = index_range(v_start, v_end, level);
    for index in first..=last {
        let (lo, hi) = slot_range(v_start, v_end, level, index);
        if lo >= hi {
            continue;
        }
        let entry = &mut table[index];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            if level == LEAF_LEVEL {
                entry.set_addr(PhysAddr::new(*phys), flags.hw());
                flush::page_invalidate(fe, VirtAddr::new(lo));
                *phys += PAGE_SIZE;
            } else if can_promote(level, &flags, lo, hi, *phys) {
                entry.set_addr(PhysAddr::new(*phys), flags.hw() | PageTableFlags::HUGE_PAGE);
                flush::page_invalidate(fe, VirtAddr::new(lo));
                *phys += level_size(level);
            } else {
                let child_pa = source.allocate_table().ok_or(MapError::TableAllocationFailed)?;
                entry.set_addr(
                    child_pa,
                    PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
                );
                let child_ptr = source.node_at(child_pa);
                map_level(source, child_ptr, level + 1, lo, hi, phys, flags, fe)?;
            }
        } else if level == LEAF_LEVEL || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Err(MapError::AlreadyMapped);
        } else {
            let child_pa = entry.addr();
            let child_ptr = source.node_at(child_pa);
            map_level(source, child_ptr, level + 1, lo, hi, phys, flags, fe)?;
        }
    }
    Ok(())
}

/// Installs a single mapping of known `target_level` granularity at `v`,
/// allocating intermediate tables as needed. Used by `remap_pages` to
/// reinstall a mapping at its new address with the exact frame and
/// granularity it had at the old one, rather than re-deriving promotion
/// eligibility against the destination's alignment.
fn install_single(
    source: &dyn TableSource,
    table_ptr: *mut PageTable,
    level: u8,
    target_level: u8,
    v: u64,
    frame: u64,
    raw_flags: PageTableFlags,
) -> Result<(), MapError> {
    let table = unsafe { &mut *table_ptr };
    let index = level_index(v, level);
    let entry = &mut table[index];
    if level == target_level {
        if entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(MapError::AlreadyMapped);
        }
        entry.set_addr(PhysAddr::new(frame), raw_flags);
        return Ok(());
    }
    if !entry.flags().contains(PageTableFlags::PRESENT) {
        let child_pa = source.allocate_table().ok_or(MapError::TableAllocationFailed)?;
        entry.set_addr(
            child_pa,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
        );
    }
    let child_pa = entry.addr();
    let child_ptr = source.node_at(child_pa);
    install_single(source, child_ptr, level + 1, target_level, v, frame, raw_flags)
}

#[cfg(not(test))]
fn zero_memory(v: VirtAddr, len: u64) {
    unsafe {
        core::ptr::write_bytes(v.as_u64() as *mut u8, 0, len as usize);
    }
}

/// Writing through a mock mapping's VA would touch unrelated host memory,
/// so the unit-test build only records that it was asked to.
#[cfg(test)]
fn zero_memory(_v: VirtAddr, _len: u64) {}

/// Owns the page-table lock and the kernel/user root physical addresses,
/// and exposes the structural operations over them. Every method
/// acquires [`Self`]'s `pt_lock` for the duration of its mutation, drops
/// it, and only then synchronously drains the flush-set it built up.
pub struct PageTableEngine<'a> {
    source: &'a dyn TableSource,
    pt_lock: Mutex<()>,
    kernel_root: PhysAddr,
    user_root: Option<PhysAddr>,
}

impl<'a> PageTableEngine<'a> {
    pub fn new(source: &'a dyn TableSource, kernel_root: PhysAddr, user_root: Option<PhysAddr>) -> Self {
        PageTableEngine {
            source,
            pt_lock: Mutex::new(()),
            kernel_root,
            user_root,
        }
    }

    fn root_for(&self, v: VirtAddr) -> PhysAddr {
        if memlayout::is_kernel_addr(v) {
            self.kernel_root
        } else {
            self.user_root.expect("no user page-table root installed")
        }
    }

    /// Installs `[v, v+length)` mapped to `[p, p+length)` with `flags`.
    /// `v` and `p` must already be page-aligned; `length` is rounded up
    /// to [`PAGE_SIZE`]. Fails without touching anything if any page in
    /// range is already mapped.
    ///
    /// # Panics
    ///
    /// A table-page allocation failure partway through installing the
    /// range is treated as unrecoverable, not a reportable error: by the
    /// time it happens the walk has already committed some of the
    /// range's structure, so this prints a diagnostic and panics rather
    /// than returning control to the caller with a half-installed
    /// mapping.
    pub fn map(&self, v: VirtAddr, p: PhysAddr, length: u64, flags: PageFlags) -> Result<(), MapError> {
        assert!(
            align::is_aligned_u64(v.as_u64(), PAGE_SIZE) && align::is_aligned_u64(p.as_u64(), PAGE_SIZE),
            "map requires page-aligned v and p"
        );
        let length = align::align_up_u64(length, PAGE_SIZE);

        let mut fe = flush::get_page_flush_entry();
        let result = {
            let _guard = self.pt_lock.lock();
            let root = self.root_for(v);
            let mut phys = p.as_u64();
            map_level(
                self.source,
                self.source.node_at(root),
                ROOT_LEVEL,
                v.as_u64(),
                v.as_u64() + length,
                &mut phys,
                flags,
                &mut fe,
            )
        };
        match result {
            Ok(()) => {
                flush::page_invalidate_sync(&mut fe, || {});
                Ok(())
            }
            Err(MapError::AlreadyMapped) => Err(MapError::AlreadyMapped),
            Err(MapError::TableAllocationFailed) => {
                serial::println!(
                    "pagetable: out of table pages while mapping {:#x}..{:#x}; halting",
                    v.as_u64(),
                    v.as_u64() + length
                );
                panic!("pagetable: table-page allocator exhausted mid-map");
            }
        }
    }

    /// Unmaps `[v, v+length)`. Equivalent to
    /// `unmap_pages_with_handler(v, length, None)`.
    pub fn unmap(&self, v: VirtAddr, length: u64) {
        self.unmap_pages_with_handler(v, length, None);
    }

    /// Clears every present leaf/block PTE in `[v, v+length)`, recording
    /// an invalidate for each, and reports the freed physical ranges to
    /// `range_handler` (coalescing runs of physically-contiguous frames
    /// into a single call) if one is given.
    pub fn unmap_pages_with_handler(
        &self,
        v: VirtAddr,
        length: u64,
        mut range_handler: Option<&mut dyn FnMut(PhysAddr, PhysAddr)>,
    ) {
        let mut fe = flush::get_page_flush_entry();
        let mut pending: Option<(u64, u64)> = None;
        {
            let _guard = self.pt_lock.lock();
            let root = self.root_for(v);
            traverse(
                self.source,
                self.source.node_at(root),
                ROOT_LEVEL,
                v.as_u64(),
                v.as_u64() + length,
                &mut |level, va, entry| {
                    let is_leaf_or_block = level == LEAF_LEVEL || entry.flags().contains(PageTableFlags::HUGE_PAGE);
                    if is_leaf_or_block {
                        let frame = entry.addr().as_u64();
                        let size = level_size(level);
                        entry.set_unused();
                        flush::page_invalidate(&mut fe, va);
                        pending = Some(match pending.take() {
                            Some((s, e)) if e == frame => (s, frame + size),
                            Some((s, e)) => {
                                if let Some(ref mut rh) = range_handler {
                                    rh(PhysAddr::new(s), PhysAddr::new(e));
                                }
                                (frame, frame + size)
                            }
                            None => (frame, frame + size),
                        });
                    }
                    true
                },
            );
            if let Some((s, e)) = pending.take() {
                if let Some(ref mut rh) = range_handler {
                    rh(PhysAddr::new(s), PhysAddr::new(e));
                }
            }
        }
        flush::page_invalidate_sync(&mut fe, || {});
    }

    /// Returns whether every page in `[v, v+length)` is currently mapped.
    pub fn validate_virtual(&self, v: VirtAddr, length: u64) -> bool {
        let _guard = self.pt_lock.lock();
        let root = self.root_for(v);
        range_present(self.source, self.source.node_at(root), ROOT_LEVEL, v.as_u64(), v.as_u64() + length)
    }

    /// Replaces the protection-bit subset (see [`protection_mask`]) of
    /// every present leaf/block PTE in `[v, v+length)` with `flags`,
    /// recording one invalidate per changed PTE. Frame numbers, the
    /// accessed/dirty bits, and `HUGE_PAGE` are preserved untouched.
    ///
    /// # Panics
    ///
    /// Panics if the range intersects the huge-backed translation
    /// window: those mappings are a single global translation shared
    /// across all table-page allocations and cannot have their
    /// protection changed in isolation.
    pub fn update_map_flags(&self, v: VirtAddr, length: u64, flags: PageFlags) {
        assert!(
            !intersects_huge_backed(v, length),
            "update_map_flags on the huge-backed region is forbidden"
        );

        let mut fe = flush::get_page_flush_entry();
        {
            let _guard = self.pt_lock.lock();
            let root = self.root_for(v);
            traverse(
                self.source,
                self.source.node_at(root),
                ROOT_LEVEL,
                v.as_u64(),
                v.as_u64() + length,
                &mut |level, va, entry| {
                    let is_leaf_or_block = level == LEAF_LEVEL || entry.flags().contains(PageTableFlags::HUGE_PAGE);
                    if is_leaf_or_block {
                        let frame = entry.addr();
                        let preserved = entry.flags() & !protection_mask();
                        let updated = preserved | (flags.hw() & protection_mask());
                        entry.set_addr(frame, updated);
                        flush::page_invalidate(&mut fe, va);
                    }
                    true
                },
            );
        }
        flush::page_invalidate_sync(&mut fe, || {});
    }

    /// Zeroes the memory backing every present mapping in
    /// `[v, v+length)`, writing through each page's current VA.
    pub fn zero_mapped_pages(&self, v: VirtAddr, length: u64) {
        let _guard = self.pt_lock.lock();
        let root = self.root_for(v);
        traverse(
            self.source,
            self.source.node_at(root),
            ROOT_LEVEL,
            v.as_u64(),
            v.as_u64() + length,
            &mut |level, va, entry| {
                let is_leaf_or_block = level == LEAF_LEVEL || entry.flags().contains(PageTableFlags::HUGE_PAGE);
                if is_leaf_or_block {
                    zero_memory(va, level_size(level));
                }
                true
            },
        );
    }

    /// Moves every present mapping in `[old, old+length)` to
    /// `[new, new+length)`, preserving frame and flags, then clears the
    /// source PTEs. `new` and `old` ranges must be disjoint: this is a
    /// forward walk and does not handle overlap.
    ///
    /// # Panics
    ///
    /// Panics if `[new, new+length)` and `[old, old+length)` overlap, or
    /// if a destination slot turns out to already be mapped.
    pub fn remap_pages(&self, new: VirtAddr, old: VirtAddr, length: u64) {
        let old_range = VirtAddrRange::new(old, VirtAddr::new(old.as_u64() + length));
        let new_range = VirtAddrRange::new(new, VirtAddr::new(new.as_u64() + length));
        assert!(
            !old_range.overlaps(&new_range),
            "remap_pages requires disjoint source and destination ranges"
        );

        let mut fe = flush::get_page_flush_entry();
        let mut collected: Vec<(u64, u64, PageTableFlags, u8)> = Vec::new();
        {
            let _guard = self.pt_lock.lock();
            let old_root = self.root_for(old);
            traverse(
                self.source,
                self.source.node_at(old_root),
                ROOT_LEVEL,
                old.as_u64(),
                old.as_u64() + length,
                &mut |level, va, entry| {
                    let is_leaf_or_block = level == LEAF_LEVEL || entry.flags().contains(PageTableFlags::HUGE_PAGE);
                    if is_leaf_or_block {
                        collected.push((va.as_u64() - old.as_u64(), entry.addr().as_u64(), entry.flags(), level));
                        entry.set_unused();
                        flush::page_invalidate(&mut fe, va);
                    }
                    true
                },
            );

            let new_root = self.root_for(new);
            for (offset, frame, raw_flags, level) in collected {
                let target_va = new.as_u64() + offset;
                install_single(self.source, self.source.node_at(new_root), ROOT_LEVEL, level, target_va, frame, raw_flags)
                    .expect("remap destination must be unmapped");
                flush::page_invalidate(&mut fe, VirtAddr::new(target_va));
            }
        }
        flush::page_invalidate_sync(&mut fe, || {});
    }

    /// Generic walk over every present PTE in `[v, v+length)`. `handler`
    /// may mutate the entry it is given but must not allocate or free
    /// table-structure nodes; returning `false` aborts the remainder of
    /// the walk.
    pub fn traverse_ptes<F>(&self, v: VirtAddr, length: u64, mut handler: F)
    where
        F: FnMut(u8, VirtAddr, &mut PageTableEntry) -> bool,
    {
        let _guard = self.pt_lock.lock();
        let root = self.root_for(v);
        traverse(
            self.source,
            self.source.node_at(root),
            ROOT_LEVEL,
            v.as_u64(),
            v.as_u64() + length,
            &mut handler,
        );
    }
}

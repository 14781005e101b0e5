// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! kernel ties together the virtual-memory and page-table management
//! core: the subsystem that owns the hardware page tables, allocates
//! table pages, composes virtual/physical allocators into a
//! physically-backed heap, and dispatches the faults and interrupts
//! that core depends on.
//!
//! [`init_bootstrap`] and [`init_runtime`] bring the subsystems up in
//! two phases, matching the table-page allocator's own bootstrap/
//! runtime split (see [`tablealloc`]): early boot has only an identity-
//! mapped region to allocate table pages from, and switches to the
//! huge-backed window once that window itself has been mapped.
//!
//! This crate does not install [`flush::set_broadcaster`],
//! [`cpu::set_frame_return`], [`interrupts::set_interrupt_controller`],
//! or [`interrupts::set_current_cpu`]: those bind this core to a
//! specific APIC, vector-return trampoline, and per-CPU addressing
//! scheme, which are the boot/platform layer's job, not this one's.
//!
//! # Kernel subsystems
//!
//! Several parts of this core are provided in separate crates. These
//! are:
//!
//! - [memory/memlayout](::memlayout)
//! - [memory/tablealloc](::tablealloc)
//! - [memory/pagetable](::pagetable)
//! - [memory/flush](::flush)
//! - [memory/backedheap](::backedheap)
//! - [cpu](::cpu)
//! - [segmentation](::segmentation)
//! - [interrupts](::interrupts)
//! - [utils/align](::align)
//! - [utils/bitmap_index](::bitmap_index)
//! - [drivers/serial](::serial)

#![no_std]
#![allow(unused_crate_dependencies)] // This is to allow the doc references above.

extern crate alloc;

use spin::{Mutex, Once};
use x86_64::{PhysAddr, VirtAddr};

use memlayout::PhysAddrRange;
use pagetable::PageTableEngine;

static KERNEL_ROOT: Once<PhysAddr> = Once::new();
static USER_ROOT: Mutex<Option<PhysAddr>> = Mutex::new(None);

/// Phase one of kernel start: brings up the table-page allocator in
/// bootstrap mode, the per-CPU/segmentation state for the boot CPU, and
/// the fault dispatcher, then enables interrupts. No huge-backed window
/// exists yet, so every table page handed out so far comes from
/// `[initial_physbase, initial_physbase+extent)`.
///
/// `kernel_root` is the physical address of the already-built bootstrap
/// page-table root (installed by boot code, outside this crate's
/// scope); `user_root` is `None` until the first user address space is
/// created.
pub fn init_bootstrap(initial_physbase: PhysAddr, extent: u64, initial_map: VirtAddr, kernel_root: PhysAddr) {
    tablealloc::init_bootstrap(initial_physbase, extent, initial_map);

    segmentation::bootstrap();
    cpu::init_cpu(0);
    segmentation::per_cpu_init(0);

    KERNEL_ROOT.call_once(|| kernel_root);

    interrupts::init();
}

/// Phase two: once `mapped` — a range inside the huge-backed window —
/// has been block-mapped 1:1 by the caller using [`pagetables`] in
/// bootstrap mode, switches the table-page allocator to runtime mode.
/// Table pages allocated during bootstrap remain reachable: their
/// physical addresses fall within `mapped`'s window by construction
/// (see `tablealloc`'s translation invariant).
///
/// `heap` is where the allocator's cursor refills from once `mapped`
/// itself is exhausted; installing it is this crate's job, since only
/// the caller knows what backs the rest of the huge-backed window.
pub fn init_runtime(mapped: PhysAddrRange, heap: &'static dyn tablealloc::TableHeap) {
    tablealloc::pagemem().switch_to_runtime(mapped, heap);
}

/// Builds a fresh [`PageTableEngine`] over the live table-page allocator
/// and the kernel (and, once created, user) page-table roots.
///
/// Cheap to call repeatedly: the engine itself holds no state beyond
/// these references, so nothing is lost by not caching it.
///
/// # Panics
///
/// Panics if called before [`init_bootstrap`].
pub fn pagetables() -> PageTableEngine<'static> {
    let kernel_root = *KERNEL_ROOT.get().expect("kernel::init_bootstrap was never called");
    PageTableEngine::new(tablealloc::pagemem(), kernel_root, *USER_ROOT.lock())
}

/// Records `user_root` as the page-table root used for user-space
/// mappings from now on, superseding any previous value.
pub fn set_user_root(user_root: PhysAddr) {
    *USER_ROOT.lock() = Some(user_root);
}

/// Spins forever. Used by panic handlers in binaries built on this
/// crate once there is nothing safe left to do.
pub fn halt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

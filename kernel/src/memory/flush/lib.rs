// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Batches the virtual addresses a page-table mutation invalidates and
//! issues a single TLB shootdown for them.
//!
//! A [`FlushEntry`] is a small fixed-capacity accumulator: [`page_invalidate`]
//! records an address in it, and [`page_invalidate_sync`] performs the
//! shootdown itself (a local `invlpg` for every recorded address, or a full
//! reload if the set grew too large to be worth invalidating page by page)
//! and broadcasts the same operation to every other running CPU.
//!
//! This crate never speaks to the APIC or sends an IPI directly: that is
//! the job of whatever implements [`ShootdownBroadcaster`] and is installed
//! with [`set_broadcaster`]. Kernel startup installs the real one; tests
//! install a recording mock.

#![no_std]

use spin::Once;
use x86_64::VirtAddr;

/// Above this many recorded addresses, invalidating each one individually
/// is no longer worth it and a full TLB reload is issued instead.
pub const FLUSH_SET_CAPACITY: usize = 32;

/// An accumulator of virtual addresses awaiting a TLB shootdown.
///
/// Obtained from [`get_page_flush_entry`], filled by [`page_invalidate`],
/// and drained by [`page_invalidate_sync`]. Addresses beyond
/// [`FLUSH_SET_CAPACITY`] are not tracked individually: the entry instead
/// remembers that a full reload is owed.
pub struct FlushEntry {
    addrs: [VirtAddr; FLUSH_SET_CAPACITY],
    len: usize,
}

impl FlushEntry {
    fn new() -> Self {
        FlushEntry {
            addrs: [VirtAddr::zero(); FLUSH_SET_CAPACITY],
            len: 0,
        }
    }

    /// The addresses recorded so far.
    pub fn addrs(&self) -> &[VirtAddr] {
        &self.addrs[..self.len]
    }

    fn clear(&mut self) {
        self.len = 0;
    }
}

/// Obtains a fresh, empty flush entry.
pub fn get_page_flush_entry() -> FlushEntry {
    FlushEntry::new()
}

/// Records `vaddr` as needing invalidation once `fe` is drained.
///
/// If `fe` is already at [`FLUSH_SET_CAPACITY`], it is synchronously
/// drained first (invalidating everything recorded so far, as a full
/// reload since the batch has hit the threshold) so the entry never
/// silently drops an address.
pub fn page_invalidate(fe: &mut FlushEntry, vaddr: VirtAddr) {
    if fe.len == FLUSH_SET_CAPACITY {
        page_invalidate_sync(fe, || {});
    }
    fe.addrs[fe.len] = vaddr;
    fe.len += 1;
}

/// Drains `fe`, invalidating every recorded address locally and
/// broadcasting the same invalidation to every other running CPU.
/// `done_cb` runs once every CPU has acknowledged the shootdown.
pub fn page_invalidate_sync(fe: &mut FlushEntry, done_cb: impl FnOnce()) {
    let full_reload = fe.len >= FLUSH_SET_CAPACITY;

    if full_reload {
        local_flush_all();
    } else {
        for &addr in fe.addrs() {
            local_flush(addr);
        }
    }

    if let Some(broadcaster) = broadcaster() {
        broadcaster.broadcast(fe.addrs(), full_reload);
    }

    fe.clear();
    done_cb();
}

/// Abstracts over the mechanism that asks every other running CPU to
/// invalidate the same addresses (an IPI broadcast in the real kernel).
///
/// Implemented and installed once by the CPU/interrupt-dispatch layer;
/// this crate only ever calls through the trait object.
pub trait ShootdownBroadcaster: Sync {
    /// Invalidates `pages` on every other running CPU, or performs a full
    /// reload on each of them if `full_reload` is set. Returns only once
    /// every CPU has acknowledged.
    fn broadcast(&self, pages: &[VirtAddr], full_reload: bool);
}

static BROADCASTER: Once<&'static dyn ShootdownBroadcaster> = Once::new();

/// Installs the broadcaster used by every subsequent
/// [`page_invalidate_sync`] call. Expected to be called once, during
/// kernel startup, before other CPUs are brought up; later calls are
/// ignored, matching the one-shot semantics of [`spin::Once`].
pub fn set_broadcaster(broadcaster: &'static dyn ShootdownBroadcaster) {
    BROADCASTER.call_once(|| broadcaster);
}

fn broadcaster() -> Option<&'static dyn ShootdownBroadcaster> {
    BROADCASTER.get().copied()
}

/// Invalidates a single local TLB entry.
///
/// `invlpg` is a privileged instruction and cannot run under the host
/// test harness, so unit tests compile in a no-op instead; correctness
/// there is checked through the [`ShootdownBroadcaster`] mock, not by
/// observing the hardware TLB.
#[cfg(not(test))]
fn local_flush(addr: VirtAddr) {
    x86_64::instructions::tlb::flush(addr);
}

#[cfg(test)]
fn local_flush(_addr: VirtAddr) {}

#[cfg(not(test))]
fn local_flush_all() {
    x86_64::instructions::tlb::flush_all();
}

#[cfg(test)]
fn local_flush_all() {}

#[cfg(test)]
mod test {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBroadcaster {
        calls: AtomicUsize,
        last_full_reload: core::sync::atomic::AtomicBool,
    }

    impl ShootdownBroadcaster for CountingBroadcaster {
        fn broadcast(&self, _pages: &[VirtAddr], full_reload: bool) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_full_reload.store(full_reload, Ordering::SeqCst);
        }
    }

    static MOCK: CountingBroadcaster = CountingBroadcaster {
        calls: AtomicUsize::new(0),
        last_full_reload: core::sync::atomic::AtomicBool::new(false),
    };

    #[test]
    fn records_and_drains() {
        set_broadcaster(&MOCK);
        let before = MOCK.calls.load(Ordering::SeqCst);

        let mut fe = get_page_flush_entry();
        page_invalidate(&mut fe, VirtAddr::new(0x1000));
        page_invalidate(&mut fe, VirtAddr::new(0x2000));
        assert_eq!(fe.addrs().len(), 2);

        let mut done = false;
        page_invalidate_sync(&mut fe, || done = true);
        assert!(done);
        assert_eq!(fe.addrs().len(), 0);
        assert_eq!(MOCK.calls.load(Ordering::SeqCst), before + 1);
        assert!(!MOCK.last_full_reload.load(Ordering::SeqCst));
    }

    #[test]
    fn overflow_triggers_full_reload() {
        set_broadcaster(&MOCK);
        let mut fe = get_page_flush_entry();
        for i in 0..FLUSH_SET_CAPACITY {
            page_invalidate(&mut fe, VirtAddr::new(0x1000 * (i as u64 + 1)));
        }
        assert_eq!(fe.addrs().len(), FLUSH_SET_CAPACITY);

        // The entry is already at capacity: recording one more address
        // forces an automatic drain of the full batch, reported as a
        // full reload rather than FLUSH_SET_CAPACITY individual
        // invalidations.
        page_invalidate(&mut fe, VirtAddr::new(0xdead_000));
        assert!(MOCK.last_full_reload.load(Ordering::SeqCst));
        assert_eq!(fe.addrs().len(), 1);
    }
}

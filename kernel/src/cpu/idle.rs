// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The idle-CPU bitmask: one bit per CPU, bit-atomically set and
//! cleared, so any CPU can check whether another is idle without
//! locking.

use core::sync::atomic::{AtomicU64, Ordering};

static IDLE_MASK: AtomicU64 = AtomicU64::new(0);

/// Marks CPU `id` idle.
///
/// # Panics
///
/// Panics if `id >= memlayout::MAX_CPUS` (the mask has one bit per CPU
/// and `MAX_CPUS` is bounded to 64, the word's width).
pub fn set_idle(id: usize) {
    assert!(id < memlayout::MAX_CPUS, "cpu: idle id {} out of range", id);
    IDLE_MASK.fetch_or(1 << id, Ordering::SeqCst);
}

/// Clears CPU `id`'s idle bit. The common handler does this first thing
/// on every entry, since receiving any interrupt means the CPU is no
/// longer idle.
pub fn clear_idle(id: usize) {
    assert!(id < memlayout::MAX_CPUS, "cpu: idle id {} out of range", id);
    IDLE_MASK.fetch_and(!(1 << id), Ordering::SeqCst);
}

pub fn is_idle(id: usize) -> bool {
    assert!(id < memlayout::MAX_CPUS, "cpu: idle id {} out of range", id);
    IDLE_MASK.load(Ordering::SeqCst) & (1 << id) != 0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_then_clear_round_trips() {
        // A fixed id avoids collisions with whichever other test in this
        // module's shared global `IDLE_MASK` happens to run concurrently.
        let id = 40;
        set_idle(id);
        assert!(is_idle(id));
        clear_idle(id);
        assert!(!is_idle(id));
    }

    #[test]
    #[should_panic]
    fn out_of_range_id_is_fatal() {
        set_idle(memlayout::MAX_CPUS);
    }
}

// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The single kernel lock that serializes kernel-mode execution across
//! every CPU, held across everything between vector entry and the
//! scheduler's run loop. First in the locking order: `kernel lock` ->
//! `backed-heap lock` -> `pt_lock`.

use spin::{Mutex, MutexGuard};

use crate::percpu::PerCpu;

pub struct KernelLock {
    inner: Mutex<()>,
}

impl KernelLock {
    pub const fn new() -> Self {
        KernelLock { inner: Mutex::new(()) }
    }

    /// Blocks until the lock is free, then marks `percpu` as holding it.
    /// The returned guard clears that flag again on drop.
    pub fn acquire<'a>(&'a self, percpu: &'a PerCpu) -> KernelLockGuard<'a> {
        let guard = self.inner.lock();
        percpu.set_have_kernel_lock(true);
        KernelLockGuard { _guard: guard, percpu }
    }
}

pub struct KernelLockGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    percpu: &'a PerCpu,
}

impl Drop for KernelLockGuard<'_> {
    fn drop(&mut self) {
        self.percpu.set_have_kernel_lock(false);
    }
}

/// The one kernel lock, shared by every CPU.
pub static KERNEL_LOCK: KernelLock = KernelLock::new();

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn acquiring_sets_flag_and_dropping_clears_it() {
        let lock = KernelLock::new();
        let percpu = PerCpu::new(0);
        assert!(!percpu.have_kernel_lock());

        {
            let _guard = lock.acquire(&percpu);
            assert!(percpu.have_kernel_lock());
        }
        assert!(!percpu.have_kernel_lock());
    }
}

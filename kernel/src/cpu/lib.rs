// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Per-CPU state and the kernel context every CPU runs in by default.
//!
//! This crate owns the pieces the page-table engine's kernel lock and
//! the fault dispatcher both need: the [`Frame`] layout a vector stub
//! saves registers into, the [`KernelContext`] (frame + stack) kernel
//! code runs on, the [`PerCpu`] record tracking scheduling state and
//! machine-specific stacks, the single spare context that lets one
//! kernel execution suspend inside a page fault, the idle-CPU bitmask,
//! and the kernel lock that serializes kernel-mode execution across
//! every CPU.
//!
//! Nothing here speaks to the IDT, the APIC, or a scheduler: those are
//! the `interrupts` and `segmentation` crates' concerns. This crate
//! only holds the state they operate on.

#![no_std]

extern crate alloc;

mod context;
mod frame;
mod idle;
mod kernel_lock;
mod percpu;

pub use context::{frame_return, init_spare_context, resume_kernel_context, suspend_kernel_context, FrameReturn, KernelContext, KERNEL_STACK_SIZE};
pub use frame::{FaultHandlerFn, Frame, FRAME_MAX};
pub use idle::{clear_idle, is_idle, set_idle};
pub use kernel_lock::{KernelLock, KernelLockGuard, KERNEL_LOCK};
pub use percpu::{count, for_each, init_cpu, CpuState, PerCpu, ThreadId, THREAD_QUEUE_CAPACITY};

pub use context::set_frame_return;

/// Writes `handler` into every booted CPU's kernel-context frame, in
/// its [`Frame::set_fault_handler`] slot. The common handler (see the
/// `interrupts` crate) falls back to this when no per-vector handler is
/// registered for the faulting vector.
pub fn install_fallback_fault_handler(handler: FaultHandlerFn) {
    percpu::for_each(|cpu| {
        cpu.modify_kernel_context_frame(|frame| frame.set_fault_handler(handler));
    });
}

#[cfg(test)]
mod test {
    use super::*;

    fn noop_handler(_f: &mut Frame) -> Option<&'static mut Frame> {
        None
    }

    #[test]
    fn install_fallback_fault_handler_reaches_every_booted_cpu() {
        // `init_cpu` enforces boot order against a process-wide
        // registry shared by every test in this crate, so this test
        // only asserts that *some* CPU picked up the handler rather
        // than asserting on a specific id.
        if percpu::count() == 0 {
            percpu::init_cpu(0);
        }
        install_fallback_fault_handler(noop_handler);

        let mut saw_handler = false;
        percpu::for_each(|cpu| {
            if cpu.kernel_context_frame().fault_handler().is_some() {
                saw_handler = true;
            }
        });
        assert!(saw_handler);
    }
}

// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Per-CPU state: one record per booted CPU, holding the kernel context
//! it runs in by default, its machine-specific stacks, and the bits the
//! fault dispatcher and scheduler consult on every entry.
//!
//! [`memlayout::MAX_CPUS`] bounds the registry the same way it bounds
//! [`idle`]'s bitmask: both assume no more than 64 CPUs are ever booted.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use spin::Mutex;

use crate::context::KernelContext;
use crate::frame::Frame;

/// Bounds every per-CPU thread queue. A CPU that has run more threads
/// than this without the scheduler catching up is considered a
/// misconfiguration, not something to grow without limit.
pub const THREAD_QUEUE_CAPACITY: usize = 256;

/// A CPU's scheduling state, consulted by the common fault/interrupt
/// handler (see `crate::dispatch` in the `interrupts` crate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    /// Not yet brought up.
    NotPresent,
    /// Running kernel code in its default kernel context.
    Kernel,
    /// Running user code.
    User,
    /// Inside the common handler, between `FULL` being set and cleared.
    Interrupt,
    /// Idle loop; its idle-mask bit is set.
    Idle,
}

impl CpuState {
    fn encode(self) -> u8 {
        match self {
            CpuState::NotPresent => 0,
            CpuState::Kernel => 1,
            CpuState::User => 2,
            CpuState::Interrupt => 3,
            CpuState::Idle => 4,
        }
    }

    fn decode(v: u8) -> Self {
        match v {
            0 => CpuState::NotPresent,
            1 => CpuState::Kernel,
            2 => CpuState::User,
            3 => CpuState::Interrupt,
            4 => CpuState::Idle,
            _ => unreachable!("invalid encoded CpuState"),
        }
    }
}

/// Opaque handle identifying a thread on a per-CPU run queue. The
/// scheduler that assigns and interprets these lives outside this
/// crate; here it is only a value CPUs pass around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadId(pub u64);

/// One CPU's record: its kernel context, machine-specific stacks, and
/// the scheduling fields the dispatcher touches on every entry.
pub struct PerCpu {
    pub id: usize,
    state: AtomicU8,
    kernel_context: Mutex<Box<KernelContext>>,
    /// The frame currently being dispatched, if any: set by the vector
    /// stub on entry and cleared when the common handler re-enters the
    /// scheduler loop. Distinct from `kernel_context`'s own frame, which
    /// is only "current" while the CPU is actually running its default
    /// kernel context rather than a suspended or interrupted one.
    current_frame: Mutex<Option<Frame>>,
    /// The thread presently running in user mode on this CPU, if any.
    /// Set by the scheduler (out of scope here); consulted by the
    /// common handler to re-enqueue a preempted user thread.
    current_thread: Mutex<Option<ThreadId>>,
    thread_queue: Mutex<VecDeque<ThreadId>>,
    have_kernel_lock: AtomicBool,
    /// Machine-specific: a pointer-sized handle the CPU uses to find
    /// its own `PerCpu` record (a GS-base value in the real kernel).
    pub self_handle: u64,
    pub exception_stack: u64,
    pub int_stack: u64,
}

impl PerCpu {
    pub fn new(id: usize) -> Self {
        PerCpu {
            id,
            state: AtomicU8::new(CpuState::NotPresent.encode()),
            kernel_context: Mutex::new(Box::new(KernelContext::fresh())),
            current_frame: Mutex::new(None),
            current_thread: Mutex::new(None),
            thread_queue: Mutex::new(VecDeque::new()),
            have_kernel_lock: AtomicBool::new(false),
            self_handle: 0,
            exception_stack: 0,
            int_stack: 0,
        }
    }

    pub fn state(&self) -> CpuState {
        CpuState::decode(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: CpuState) {
        self.state.store(state.encode(), Ordering::SeqCst);
    }

    /// Replaces the active kernel context with `new`, returning the one
    /// that was active. Used by [`crate::suspend_kernel_context`] and
    /// [`crate::resume_kernel_context`] to perform the single-spare
    /// swap.
    pub fn swap_kernel_context(&self, new: Box<KernelContext>) -> Box<KernelContext> {
        core::mem::replace(&mut *self.kernel_context.lock(), new)
    }

    /// A snapshot of the active kernel context's frame.
    pub fn kernel_context_frame(&self) -> Frame {
        self.kernel_context.lock().frame
    }

    /// Mutates the active kernel context's frame in place.
    pub fn modify_kernel_context_frame(&self, f: impl FnOnce(&mut Frame)) {
        f(&mut self.kernel_context.lock().frame);
    }

    pub fn current_frame(&self) -> Option<Frame> {
        *self.current_frame.lock()
    }

    pub fn set_current_frame(&self, frame: Option<Frame>) {
        *self.current_frame.lock() = frame;
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        *self.current_thread.lock()
    }

    pub fn set_current_thread(&self, thread: Option<ThreadId>) {
        *self.current_thread.lock() = thread;
    }

    /// Whether `frame` is physically the active kernel context's own
    /// frame, as opposed to a separately saved user or nested frame.
    pub fn is_kernel_context_frame(&self, frame: &Frame) -> bool {
        core::ptr::eq(frame, &self.kernel_context.lock().frame)
    }

    /// Raw pointer to the active kernel context's frame, for dispatch
    /// code that needs to operate on it directly rather than holding
    /// the context lock for the call's whole duration (mirroring how a
    /// real vector stub addresses the frame it just saved registers
    /// into).
    ///
    /// # Safety
    ///
    /// Valid only until the next [`Self::swap_kernel_context`] call on
    /// this CPU.
    pub fn kernel_context_frame_ptr(&self) -> *mut Frame {
        &mut self.kernel_context.lock().frame as *mut Frame
    }

    /// Appends `thread` to the run queue. Returns `false` (and drops
    /// nothing) if the queue is already at [`THREAD_QUEUE_CAPACITY`].
    pub fn enqueue_thread(&self, thread: ThreadId) -> bool {
        let mut q = self.thread_queue.lock();
        if q.len() >= THREAD_QUEUE_CAPACITY {
            return false;
        }
        q.push_back(thread);
        true
    }

    pub fn dequeue_thread(&self) -> Option<ThreadId> {
        self.thread_queue.lock().pop_front()
    }

    pub fn have_kernel_lock(&self) -> bool {
        self.have_kernel_lock.load(Ordering::SeqCst)
    }

    pub fn set_have_kernel_lock(&self, have: bool) {
        self.have_kernel_lock.store(have, Ordering::SeqCst);
    }
}

static REGISTRY: Mutex<Vec<Box<PerCpu>>> = Mutex::new(Vec::new());

/// Brings up CPU `id`'s record and adds it to the registry. Called once
/// per CPU, in boot order, so `id` is expected to equal the registry's
/// length at call time.
///
/// # Panics
///
/// Panics if `id` exceeds [`memlayout::MAX_CPUS`], or does not match
/// the next slot in boot order.
pub fn init_cpu(id: usize) {
    assert!(id < memlayout::MAX_CPUS, "cpu: id {} exceeds MAX_CPUS", id);
    let mut registry = REGISTRY.lock();
    assert_eq!(registry.len(), id, "cpu: CPUs must be brought up in id order");
    let mut percpu = PerCpu::new(id);
    percpu.set_state(CpuState::Kernel);
    registry.push(Box::new(percpu));
}

/// Runs `f` over every booted CPU's record, in id order.
pub fn for_each<R>(mut f: impl FnMut(&PerCpu) -> R) {
    let registry = REGISTRY.lock();
    for percpu in registry.iter() {
        f(percpu);
    }
}

/// The number of CPUs brought up so far.
pub fn count() -> usize {
    REGISTRY.lock().len()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_percpu_starts_not_present_state_default() {
        let percpu = PerCpu::new(3);
        assert_eq!(percpu.id, 3);
        assert_eq!(percpu.state(), CpuState::NotPresent);
        assert!(!percpu.have_kernel_lock());
    }

    #[test]
    fn thread_queue_respects_capacity() {
        let percpu = PerCpu::new(0);
        for i in 0..THREAD_QUEUE_CAPACITY {
            assert!(percpu.enqueue_thread(ThreadId(i as u64)));
        }
        assert!(!percpu.enqueue_thread(ThreadId(9999)));
        assert_eq!(percpu.dequeue_thread(), Some(ThreadId(0)));
    }

    #[test]
    fn kernel_context_frame_mutation_is_visible() {
        let percpu = PerCpu::new(0);
        percpu.modify_kernel_context_frame(|f| f.set_vector(5));
        assert_eq!(percpu.kernel_context_frame().vector(), 5);
    }
}

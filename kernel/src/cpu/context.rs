// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel context (frame + stack) kernel code runs in by default,
//! and the single-spare-context suspension protocol that lets exactly
//! one of them block inside a page-fault handler while holding the
//! kernel lock.
//!
//! The actual resumption — popping a [`Frame`] back onto the CPU — is
//! architecture-specific assembly this crate does not contain. Like
//! `flush`'s `ShootdownBroadcaster`, it is abstracted behind
//! [`FrameReturn`] and installed once at startup; unit tests install a
//! recording mock instead, so the swap policy below is exercised without
//! ever actually jumping.

use alloc::boxed::Box;
use spin::{Mutex, Once};

use crate::frame::Frame;
use crate::percpu::PerCpu;

/// Size of the stack carried inside every [`KernelContext`].
pub const KERNEL_STACK_SIZE: usize = 128 * 1024;

/// A saved frame plus the kernel stack it runs on, allocated together as
/// one heap blob so a context can be handed around by a single pointer.
#[repr(C)]
pub struct KernelContext {
    pub frame: Frame,
    pub stack: [u8; KERNEL_STACK_SIZE],
}

impl KernelContext {
    pub(crate) fn fresh() -> KernelContext {
        KernelContext {
            frame: Frame::zeroed(),
            stack: [0; KERNEL_STACK_SIZE],
        }
    }
}

/// Abstracts over the assembly that resumes a saved [`Frame`], never
/// returning. Production startup installs the real stub; tests install
/// a mock that records the attempt and then itself diverges (by
/// panicking), matching the `!` return type.
pub trait FrameReturn: Sync {
    fn frame_return(&self, frame: &Frame) -> !;
}

static FRAME_RETURN: Once<&'static dyn FrameReturn> = Once::new();

/// Installs the backend used by every subsequent [`resume_kernel_context`].
/// Expected to be called once during kernel startup; later calls are
/// ignored, matching [`spin::Once`]'s one-shot semantics.
pub fn set_frame_return(backend: &'static dyn FrameReturn) {
    FRAME_RETURN.call_once(|| backend);
}

/// Resumes execution at `frame`, never returning. Used directly by the
/// fault dispatcher when a handler hands back a different frame to jump
/// to, and internally by [`resume_kernel_context`] for the suspend
/// protocol's own resumption.
///
/// # Panics
///
/// Panics if no [`FrameReturn`] backend has been installed.
pub fn frame_return(frame: &Frame) -> ! {
    let backend = FRAME_RETURN.get().expect("cpu: no frame_return backend installed");
    backend.frame_return(frame)
}

/// The one spare kernel context, at rest when `Some`. [`suspend_kernel_context`]
/// consumes it; [`resume_kernel_context`] restores it. Protected only by
/// the discipline that both are called with the kernel lock held (see
/// `crate::kernel_lock`), per the concurrency model's single-spare
/// invariant.
static SPARE: Mutex<Option<Box<KernelContext>>> = Mutex::new(None);

/// Brings the spare context up. Called once during kernel bring-up,
/// before any CPU can suspend.
pub fn init_spare_context() {
    let mut spare = SPARE.lock();
    assert!(spare.is_none(), "cpu: spare kernel context already initialized");
    *spare = Some(Box::new(KernelContext::fresh()));
}

/// Atomically swaps `percpu`'s active kernel context out for the spare,
/// returning the context that was active (the caller stashes it and
/// calls [`resume_kernel_context`] once whatever it was waiting on
/// completes).
///
/// # Panics
///
/// Panics if the spare slot is already empty: per the single-spare
/// invariant, at most one kernel context may be mid-suspend at a time,
/// and a second suspend without an intervening resume is a misuse of
/// the protocol, not a recoverable condition.
pub fn suspend_kernel_context(percpu: &PerCpu) -> Box<KernelContext> {
    let spare = {
        let mut slot = SPARE.lock();
        slot.take()
            .expect("cpu: suspend_kernel_context called with no spare context available (double suspend?)")
    };
    percpu.swap_kernel_context(spare)
}

/// Reverse of [`suspend_kernel_context`]: installs `percpu`'s current
/// context back as the spare and `frame_return`s into `saved`'s frame.
/// Never returns.
///
/// # Panics
///
/// Panics if the spare slot is unexpectedly already occupied, or if no
/// [`FrameReturn`] backend has been installed.
pub fn resume_kernel_context(percpu: &PerCpu, saved: Box<KernelContext>) -> ! {
    let frame = {
        let now_spare = percpu.swap_kernel_context(saved);
        let mut slot = SPARE.lock();
        assert!(slot.is_none(), "cpu: resume_kernel_context found the spare slot already occupied");
        *slot = Some(now_spare);
        // SAFETY: `percpu`'s active context was just replaced by `saved`
        // above; reading its frame back out is just a plain field read.
        percpu.kernel_context_frame()
    };

    frame_return(&frame)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::percpu::PerCpu;
    use core::sync::atomic::{AtomicU64, Ordering};

    struct RecordingFrameReturn {
        last_vector: AtomicU64,
    }

    impl FrameReturn for RecordingFrameReturn {
        fn frame_return(&self, frame: &Frame) -> ! {
            self.last_vector.store(frame.vector(), Ordering::SeqCst);
            panic!("frame_return reached");
        }
    }

    static MOCK: RecordingFrameReturn = RecordingFrameReturn {
        last_vector: AtomicU64::new(0),
    };

    fn fresh_percpu() -> PerCpu {
        PerCpu::new(0)
    }

    #[test]
    fn suspend_swaps_active_context_for_spare() {
        // Each test gets its own spare slot state relative to whatever
        // ran before it, so establish it explicitly rather than relying
        // on `init_spare_context`'s once-only semantics.
        *SPARE.lock() = Some(Box::new(KernelContext::fresh()));

        let percpu = fresh_percpu();
        percpu.modify_kernel_context_frame(|f| f.set_vector(7));

        let saved = suspend_kernel_context(&percpu);
        assert_eq!(saved.frame.vector(), 7);
        // The CPU is now running on what used to be the spare: a fresh,
        // zeroed context.
        assert_eq!(percpu.kernel_context_frame().vector(), 0);
    }

    #[test]
    #[should_panic(expected = "double suspend")]
    fn second_suspend_without_resume_is_fatal() {
        *SPARE.lock() = Some(Box::new(KernelContext::fresh()));
        let percpu = fresh_percpu();
        let _first = suspend_kernel_context(&percpu);
        let _second = suspend_kernel_context(&percpu);
    }

    #[test]
    #[should_panic(expected = "frame_return reached")]
    fn resume_installs_spare_then_frame_returns() {
        set_frame_return(&MOCK);
        *SPARE.lock() = Some(Box::new(KernelContext::fresh()));

        let percpu = fresh_percpu();
        let mut saved = Box::new(KernelContext::fresh());
        saved.frame.set_vector(14);

        let _ = suspend_kernel_context(&percpu);
        resume_kernel_context(&percpu, saved);
    }
}

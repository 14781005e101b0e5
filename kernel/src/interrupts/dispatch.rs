// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The table-driven fault/interrupt dispatcher: vector allocation,
//! handler registration, shared-IRQ chaining, and the policy every
//! vector's entry runs through before returning control to whatever it
//! interrupted.
//!
//! This module never touches the IDT or the APIC directly; see the
//! `idt` module for the hardware glue that calls [`common_handler`] from
//! real `extern "x86-interrupt"` trampolines. Keeping the policy here
//! pure Rust is what makes it testable without a CPU.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use spin::{Mutex, Once};

use bitmap_index::Bitmap;
use cpu::{CpuState, Frame, PerCpu};

/// Size of the dispatch table; matches the IDT's 256 entries.
pub const N_VECTORS: usize = 256;
/// Entries below this are architectural exceptions, never handed out by
/// [`allocate_interrupt`].
pub const FIRST_ALLOCATABLE_VECTOR: u8 = 32;
/// Conventional spurious-interrupt vector: no EOI is owed for it.
pub const SPURIOUS_INT_VECTOR: u8 = 0xFF;

/// A registered vector handler. Receives the vector it was registered
/// for (useful for handlers shared across more than one vector) and the
/// frame the CPU was executing when the interrupt arrived.
pub type InterruptThunk = fn(vector: u8, frame: &mut Frame);

#[derive(Clone, Copy)]
struct Registration {
    thunk: InterruptThunk,
    name: &'static str,
}

static HANDLERS: Mutex<[Option<Registration>; N_VECTORS]> = Mutex::new([None; N_VECTORS]);
static VECTOR_IDS: Once<Mutex<Bitmap>> = Once::new();

fn vector_ids() -> &'static Mutex<Bitmap> {
    VECTOR_IDS.call_once(|| Mutex::new(Bitmap::new_set(N_VECTORS - FIRST_ALLOCATABLE_VECTOR as usize)))
}

/// Hands out an unused vector in `[FIRST_ALLOCATABLE_VECTOR, N_VECTORS)`,
/// or `None` if every vector is already allocated.
pub fn allocate_interrupt() -> Option<u8> {
    let mut ids = vector_ids().lock();
    let i = ids.next_set()?;
    ids.unset(i);
    Some(FIRST_ALLOCATABLE_VECTOR + i as u8)
}

/// Returns `vector` to the pool, so a later [`allocate_interrupt`] can
/// hand it out again. Used when a driver that owned a vector is torn
/// down.
pub fn free_interrupt(vector: u8) {
    assert!(vector >= FIRST_ALLOCATABLE_VECTOR, "interrupts: vector {} is not allocatable", vector);
    let i = (vector - FIRST_ALLOCATABLE_VECTOR) as usize;
    vector_ids().lock().set(i);
    *HANDLERS.lock().get_mut(vector as usize).expect("vector in range") = None;
}

/// Registers `thunk` for `vector`.
///
/// # Panics
///
/// Panics if `vector` already has a handler registered, naming the
/// existing registrant — overwriting a handler silently is exactly the
/// kind of misconfiguration this is meant to catch early.
pub fn register_interrupt(vector: u8, thunk: InterruptThunk, name: &'static str) {
    let mut handlers = HANDLERS.lock();
    let slot = &mut handlers[vector as usize];
    if let Some(existing) = slot {
        panic!("interrupts: vector {} already registered to {:?}", vector, existing.name);
    }
    *slot = Some(Registration { thunk, name });
}

/// A shared-IRQ dispatcher: several named handlers chained on one
/// vector, all invoked in registration order whenever it fires.
pub struct Shirq {
    vector: u8,
}

static SHIRQ_CHAINS: Mutex<BTreeMap<u8, Vec<(&'static str, InterruptThunk)>>> = Mutex::new(BTreeMap::new());

impl Shirq {
    pub fn vector(&self) -> u8 {
        self.vector
    }

    /// Appends `thunk` to this shirq's chain.
    pub fn add(&self, name: &'static str, thunk: InterruptThunk) {
        SHIRQ_CHAINS.lock().entry(self.vector).or_insert_with(Vec::new).push((name, thunk));
    }
}

fn shirq_dispatch(vector: u8, frame: &mut Frame) {
    if let Some(chain) = SHIRQ_CHAINS.lock().get(&vector) {
        for (_, thunk) in chain.iter() {
            thunk(vector, frame);
        }
    }
}

/// Allocates a fresh vector and registers it as a shared-IRQ dispatcher.
/// Handlers are added to the returned [`Shirq`] with [`Shirq::add`].
///
/// # Panics
///
/// Panics if no vector is available.
pub fn allocate_shirq() -> Shirq {
    let vector = allocate_interrupt().expect("interrupts: no vectors left for allocate_shirq");
    register_interrupt(vector, shirq_dispatch, "shirq");
    Shirq { vector }
}

/// Abstracts over acknowledging an external interrupt with whatever
/// controller is in use (PIC, APIC, ...). Installed once at startup;
/// tests leave it unset, in which case the EOI step is silently
/// skipped rather than treated as an error, matching `flush`'s
/// `ShootdownBroadcaster` precedent.
pub trait InterruptController: Sync {
    fn end_of_interrupt(&self, vector: u8);
}

static CONTROLLER: Once<&'static dyn InterruptController> = Once::new();

pub fn set_interrupt_controller(controller: &'static dyn InterruptController) {
    CONTROLLER.call_once(|| controller);
}

/// What the calling trampoline should do once [`common_handler`] returns.
/// In every case it returns normally, the hardware's own `iretq` (for
/// `extern "x86-interrupt"` functions) resumes `frame`; the one case
/// that needs to resume a *different* frame diverges inside
/// `common_handler` itself via [`cpu::frame_return`] and never returns
/// here at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Resumed,
}

/// Runs the common entry policy for `vector` on `percpu`, dispatching to
/// whatever is registered (or the frame's fallback fault handler) before
/// returning so the trampoline can resume `frame`.
///
/// # Panics
///
/// Panics (the "fatal" outcomes in the policy) on: an out-of-range
/// vector, reentrant dispatch while the CPU was already in `Interrupt`
/// state, a frame whose `FULL` bit is already set, or an unhandled
/// vector with neither a registered handler nor a fallback.
pub fn common_handler(vector: u32, percpu: &PerCpu, frame: &mut Frame) -> Outcome {
    assert!(vector < N_VECTORS as u32, "interrupts: vector {} out of range", vector);

    cpu::clear_idle(percpu.id);

    let was_user = percpu.state() == CpuState::User;
    if was_user && vector >= FIRST_ALLOCATABLE_VECTOR as u32 {
        if let Some(thread) = percpu.current_thread() {
            percpu.enqueue_thread(thread);
        }
    }

    if vector == SPURIOUS_INT_VECTOR as u32 {
        return Outcome::Resumed;
    }

    assert!(
        percpu.state() != CpuState::Interrupt,
        "interrupts: reentrant dispatch on cpu {} (vector {})",
        percpu.id,
        vector
    );
    assert!(!frame.is_full(), "interrupts: frame already full (double save) on cpu {} (vector {})", percpu.id, vector);

    frame.set_full();
    let previous_state = percpu.state();
    percpu.set_state(CpuState::Interrupt);

    let registered = HANDLERS.lock()[vector as usize];
    match registered {
        Some(reg) => {
            (reg.thunk)(vector as u8, frame);
            if vector >= FIRST_ALLOCATABLE_VECTOR as u32 {
                if let Some(controller) = CONTROLLER.get() {
                    controller.end_of_interrupt(vector as u8);
                }
            }
        }
        None => match frame.fault_handler() {
            Some(handler) => {
                if let Some(other) = handler(frame) {
                    cpu::frame_return(other);
                }
            }
            None => {
                serial::println!("interrupts: unhandled vector {} on cpu {}; halting", vector, percpu.id);
                panic!("interrupts: unhandled vector {} with no registered or fallback handler", vector);
            }
        },
    }

    if percpu.is_kernel_context_frame(frame) {
        frame.clear_full();
        percpu.set_state(previous_state);
    }

    Outcome::Resumed
}

#[cfg(test)]
mod test {
    use super::*;

    fn noop_thunk(_vector: u8, _frame: &mut Frame) {}

    #[test]
    fn allocate_and_free_round_trip() {
        let v = allocate_interrupt().expect("vector should be available");
        assert!(v >= FIRST_ALLOCATABLE_VECTOR);
        register_interrupt(v, noop_thunk, "test");
        free_interrupt(v);

        // The vector is usable again, and no handler is left registered.
        let v2 = allocate_interrupt().expect("freed vector should be reusable");
        register_interrupt(v2, noop_thunk, "test-again");
        free_interrupt(v2);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn register_interrupt_forbids_overwrite() {
        let v = allocate_interrupt().expect("vector should be available");
        register_interrupt(v, noop_thunk, "first");
        register_interrupt(v, noop_thunk, "second");
    }

    #[test]
    fn shirq_chains_multiple_handlers() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn handler_a(_v: u8, _f: &mut Frame) {
            CALLS.fetch_add(1, Ordering::SeqCst);
        }
        fn handler_b(_v: u8, _f: &mut Frame) {
            CALLS.fetch_add(10, Ordering::SeqCst);
        }

        let shirq = allocate_shirq();
        shirq.add("a", handler_a);
        shirq.add("b", handler_b);

        let mut frame = Frame::zeroed();
        let before = CALLS.load(Ordering::SeqCst);
        shirq_dispatch(shirq.vector(), &mut frame);
        assert_eq!(CALLS.load(Ordering::SeqCst), before + 11);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_vector_is_fatal() {
        let percpu = PerCpu::new(0);
        let mut frame = Frame::zeroed();
        common_handler(N_VECTORS as u32 + 1, &percpu, &mut frame);
    }

    #[test]
    fn spurious_vector_short_circuits_without_touching_full() {
        let percpu = PerCpu::new(1);
        let mut frame = Frame::zeroed();
        let outcome = common_handler(SPURIOUS_INT_VECTOR as u32, &percpu, &mut frame);
        assert_eq!(outcome, Outcome::Resumed);
        assert!(!frame.is_full());
    }

    #[test]
    #[should_panic(expected = "reentrant dispatch")]
    fn reentrant_dispatch_is_fatal() {
        let percpu = PerCpu::new(2);
        percpu.set_state(CpuState::Interrupt);
        let mut frame = Frame::zeroed();
        common_handler(40, &percpu, &mut frame);
    }

    #[test]
    #[should_panic(expected = "already full")]
    fn double_save_is_fatal() {
        let percpu = PerCpu::new(3);
        percpu.set_state(CpuState::Kernel);
        let mut frame = Frame::zeroed();
        frame.set_full();
        common_handler(41, &percpu, &mut frame);
    }

    #[test]
    fn registered_handler_runs_and_clears_full_on_kernel_context_frame() {
        use core::sync::atomic::{AtomicBool, Ordering};
        static RAN: AtomicBool = AtomicBool::new(false);
        fn handler(_v: u8, _f: &mut Frame) {
            RAN.store(true, Ordering::SeqCst);
        }

        let percpu = PerCpu::new(4);
        percpu.set_state(CpuState::Kernel);
        let v = allocate_interrupt().expect("vector should be available");
        register_interrupt(v, handler, "test-handler");

        percpu.modify_kernel_context_frame(|f| f.set_vector(v as u64));

        // Dispatch against the CPU's own kernel-context frame so
        // `common_handler`'s "is this the kernel context" check (an
        // address comparison) recognizes it.
        let frame_ptr = percpu.kernel_context_frame_ptr();
        let outcome = common_handler(v as u32, &percpu, unsafe { &mut *frame_ptr });

        assert!(RAN.load(Ordering::SeqCst));
        assert_eq!(outcome, Outcome::Resumed);
        assert!(!percpu.kernel_context_frame().is_full());
    }
}

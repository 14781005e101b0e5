// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Wires [`crate::dispatch::common_handler`] into a real, 256-entry
//! [Interrupt Descriptor Table] (IDT): architectural exceptions
//! (vectors 0-31) use [`segmentation::EXCEPTION_STACK_IST_INDEX`];
//! everything from 32 up uses [`segmentation::INTERRUPT_STACK_IST_INDEX`].
//!
//! Every `extern "x86-interrupt"` trampoline below is a thin shim: it
//! resolves this CPU's [`cpu::PerCpu`] record, builds the [`cpu::Frame`]
//! view the hardware-pushed `InterruptStackFrame` corresponds to, and
//! calls into `common_handler`. None of this is exercised by the unit
//! tests in this crate (there is no CPU to interrupt under the host
//! test harness); the policy those trampolines funnel into is tested
//! directly in `dispatch`.
//!
//! Only the vectors this kernel actually wires up have a real trampoline
//! distinct per vector: the architectural exceptions, plus a handful of
//! external vectors, the same way the PIC-based predecessor this is
//! adapted from wired only its 16 IRQ lines rather than the full
//! external range. `allocate_interrupt` still hands out vectors from the
//! full `[32, 256)` space for bookkeeping; driving the rest onto real
//! IDT entries is additional trampolines in the same shape as these.
//!
//! [Interrupt Descriptor Table]: https://en.wikipedia.org/wiki/Interrupt_descriptor_table

use lazy_static::lazy_static;
use spin::Once;
use x86_64::structures::idt::{HandlerFunc, InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::dispatch::{common_handler, FIRST_ALLOCATABLE_VECTOR};
use cpu::PerCpu;

/// How many of the external vectors this build wires up with a real
/// trampoline, starting at [`FIRST_ALLOCATABLE_VECTOR`].
const N_WIRED_EXTERNAL_VECTORS: usize = 16;

/// Resolves which [`cpu::PerCpu`] record the running CPU owns. Reading
/// that is architecture-specific (a GS-base lookup in production); like
/// [`cpu::FrameReturn`], it is installed once and abstracted behind a
/// trait so this module's registration logic doesn't need real
/// hardware to be exercised.
pub trait CurrentCpu: Sync {
    fn current(&self) -> &'static PerCpu;
}

static CURRENT_CPU: Once<&'static dyn CurrentCpu> = Once::new();

pub fn set_current_cpu(backend: &'static dyn CurrentCpu) {
    CURRENT_CPU.call_once(|| backend);
}

fn current_percpu() -> &'static PerCpu {
    CURRENT_CPU.get().expect("interrupts: no CurrentCpu backend installed").current()
}

/// Loads the IDT. Must run once per CPU, after [`segmentation::per_cpu_init`]
/// has installed that CPU's TSS (the IST indices this table references
/// are only meaningful once the TSS backing them is loaded).
pub fn init() {
    IDT.load();
}

macro_rules! exception_trampoline {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            let percpu = current_percpu();
            let frame_ptr = percpu.kernel_context_frame_ptr();
            common_handler($vector, percpu, unsafe { &mut *frame_ptr });
        }
    };
}

macro_rules! exception_trampoline_diverging {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame, _error_code: u64) -> ! {
            let percpu = current_percpu();
            let frame_ptr = percpu.kernel_context_frame_ptr();
            common_handler($vector, percpu, unsafe { &mut *frame_ptr });
            unreachable!("common_handler returned for a diverging exception");
        }
    };
}

exception_trampoline!(breakpoint_handler, 3);
exception_trampoline!(invalid_opcode_handler, 6);
exception_trampoline_diverging!(double_fault_handler, 8);

extern "x86-interrupt" fn segment_not_present_handler(_stack_frame: InterruptStackFrame, _error_code: u64) {
    let percpu = current_percpu();
    let frame_ptr = percpu.kernel_context_frame_ptr();
    common_handler(11, percpu, unsafe { &mut *frame_ptr });
}

extern "x86-interrupt" fn general_protection_fault_handler(_stack_frame: InterruptStackFrame, _error_code: u64) {
    let percpu = current_percpu();
    let frame_ptr = percpu.kernel_context_frame_ptr();
    common_handler(13, percpu, unsafe { &mut *frame_ptr });
}

extern "x86-interrupt" fn page_fault_handler(_stack_frame: InterruptStackFrame, _error_code: PageFaultErrorCode) {
    let percpu = current_percpu();
    let frame_ptr = percpu.kernel_context_frame_ptr();
    common_handler(14, percpu, unsafe { &mut *frame_ptr });
}

macro_rules! external_trampoline {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            let percpu = current_percpu();
            let frame_ptr = percpu.kernel_context_frame_ptr();
            common_handler($vector, percpu, unsafe { &mut *frame_ptr });
        }
    };
}

external_trampoline!(external_handler_0, 32);
external_trampoline!(external_handler_1, 33);
external_trampoline!(external_handler_2, 34);
external_trampoline!(external_handler_3, 35);
external_trampoline!(external_handler_4, 36);
external_trampoline!(external_handler_5, 37);
external_trampoline!(external_handler_6, 38);
external_trampoline!(external_handler_7, 39);
external_trampoline!(external_handler_8, 40);
external_trampoline!(external_handler_9, 41);
external_trampoline!(external_handler_10, 42);
external_trampoline!(external_handler_11, 43);
external_trampoline!(external_handler_12, 44);
external_trampoline!(external_handler_13, 45);
external_trampoline!(external_handler_14, 46);
external_trampoline!(external_handler_15, 47);

const EXTERNAL_HANDLERS: [HandlerFunc; N_WIRED_EXTERNAL_VECTORS] = [
    external_handler_0,
    external_handler_1,
    external_handler_2,
    external_handler_3,
    external_handler_4,
    external_handler_5,
    external_handler_6,
    external_handler_7,
    external_handler_8,
    external_handler_9,
    external_handler_10,
    external_handler_11,
    external_handler_12,
    external_handler_13,
    external_handler_14,
    external_handler_15,
];

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        unsafe {
            idt.breakpoint
                .set_handler_fn(breakpoint_handler)
                .set_stack_index(segmentation::EXCEPTION_STACK_IST_INDEX);
            idt.invalid_opcode
                .set_handler_fn(invalid_opcode_handler)
                .set_stack_index(segmentation::EXCEPTION_STACK_IST_INDEX);
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(segmentation::EXCEPTION_STACK_IST_INDEX);
            idt.segment_not_present
                .set_handler_fn(segment_not_present_handler)
                .set_stack_index(segmentation::EXCEPTION_STACK_IST_INDEX);
            idt.general_protection_fault
                .set_handler_fn(general_protection_fault_handler)
                .set_stack_index(segmentation::EXCEPTION_STACK_IST_INDEX);
            idt.page_fault
                .set_handler_fn(page_fault_handler)
                .set_stack_index(segmentation::EXCEPTION_STACK_IST_INDEX);
        }

        for (i, handler) in EXTERNAL_HANDLERS.iter().enumerate() {
            unsafe {
                idt[FIRST_ALLOCATABLE_VECTOR as usize + i]
                    .set_handler_fn(*handler)
                    .set_stack_index(segmentation::INTERRUPT_STACK_IST_INDEX);
            }
        }

        idt
    };
}

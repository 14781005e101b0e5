// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Manages segmentation for the kernel: the [Global Descriptor Table]
//! (GDT) and the Task State Segment (TSS) that selects which stack an
//! exception or interrupt runs on.
//!
//! Every CPU gets two dedicated alternate stacks, selected through the
//! TSS's interrupt-stack table (IST) by IDT entries that name them:
//!
//! - **IST 1, the exception stack**: used by IDT entries 0-31
//!   (architectural exceptions — page fault, GP, double fault, ...).
//!   A misbehaving exception handler that overflows the thread's own
//!   stack still has a known-good stack to run on.
//! - **IST 2, the interrupt stack**: used by IDT entries 32-255
//!   (external interrupts). Keeps interrupt handling off whatever stack
//!   happened to be running, kernel or user.
//!
//! [Global Descriptor Table]: https://en.wikipedia.org/wiki/Global_Descriptor_Table

#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::pin::Pin;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::segmentation::{Segment, CS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// IST index IDT entries 0-31 (architectural exceptions) load.
pub const EXCEPTION_STACK_IST_INDEX: u16 = 0;
/// IST index IDT entries 32-255 (external interrupts) load.
pub const INTERRUPT_STACK_IST_INDEX: u16 = 1;

const EXCEPTION_STACK_SIZE: usize = 4096 * 5; // 20 KiB.
const INTERRUPT_STACK_SIZE: usize = 4096 * 5; // 20 KiB.

/// Bootstrap segment data, used until the per-CPU set is brought up by
/// [`per_cpu_init`]. Safe in practice: it is initialized once, then
/// used once, by the boot CPU alone, which [`bootstrap`] enforces with
/// the same panic-on-reentry checks every [`SegmentData`] carries.
static mut BOOTSTRAP_SEGMENT_DATA: SegmentData = SegmentData::new_uninitialised();

/// Brings up the bootstrap segment data and activates it. Used before
/// the heap (and therefore [`per_cpu_init`]'s per-CPU allocations) is
/// available.
pub fn bootstrap() {
    let mut pinned = unsafe { Pin::new(&mut BOOTSTRAP_SEGMENT_DATA) };
    pinned.init();
    pinned.activate();
}

lazy_static! {
    /// The segment data for each CPU, indexed by CPU id.
    static ref PER_CPU: Mutex<Vec<Pin<&'static mut SegmentData>>> = Mutex::new(Vec::new());
}

/// Brings up `cpu_id`'s per-CPU segment data and swaps it in for the
/// bootstrap data. Must run once per CPU, on that CPU, after the heap
/// is available.
pub fn per_cpu_init(cpu_id: usize) {
    let mut per_cpu = PER_CPU.lock();
    while per_cpu.len() <= cpu_id {
        let segment_data = Box::new(SegmentData::new_uninitialised());
        let segment_data = Box::leak(segment_data);
        let mut segment_data = Pin::new(segment_data);
        segment_data.init();
        per_cpu.push(segment_data);
    }

    unsafe { per_cpu[cpu_id].swap(Pin::new(&mut BOOTSTRAP_SEGMENT_DATA)) };
}

/// Invokes `f` with `cpu_id`'s segment data.
///
/// # Panics
///
/// Panics if `cpu_id` has not been brought up by [`per_cpu_init`].
pub fn with_segment_data<F: FnOnce(&mut Pin<&mut SegmentData>)>(cpu_id: usize, f: F) {
    let mut per_cpu = PER_CPU.lock();
    match per_cpu.get_mut(cpu_id) {
        Some(segment_data) => f(segment_data),
        None => panic!("segmentation::with_segment_data() called before cpu {} was initialised", cpu_id),
    }
}

/// Contains the GDT and TSS for one CPU; loading it into the CPU
/// activates both structures.
pub struct SegmentData {
    gdt: GlobalDescriptorTable,
    tss: TaskStateSegment,

    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    task_state: SegmentSelector,
    user_code: SegmentSelector,
    user_data: SegmentSelector,

    is_initialised: bool,
    is_active: bool,

    // Placed last to minimise padding, same as the stacks' role in the
    // upstream layout this is adapted from.
    #[allow(dead_code)]
    exception_stack: [u8; EXCEPTION_STACK_SIZE],
    #[allow(dead_code)]
    interrupt_stack: [u8; INTERRUPT_STACK_SIZE],
}

impl SegmentData {
    const fn new_uninitialised() -> Self {
        SegmentData {
            gdt: GlobalDescriptorTable::new(),
            tss: TaskStateSegment::new(),

            kernel_code: SegmentSelector(0),
            kernel_data: SegmentSelector(0),
            task_state: SegmentSelector(0),
            user_code: SegmentSelector(0),
            user_data: SegmentSelector(0),

            is_initialised: false,
            is_active: false,

            exception_stack: [0u8; EXCEPTION_STACK_SIZE],
            interrupt_stack: [0u8; INTERRUPT_STACK_SIZE],
        }
    }

    /// A static reference to the TSS, required by [`Descriptor::tss_segment`].
    ///
    /// Safe in the same sense `Drop` makes the borrow sound: the
    /// reference cannot outlive the struct without that struct first
    /// panicking on drop while still active.
    fn tss_ref(self: &Pin<&mut Self>) -> &'static TaskStateSegment {
        let ptr = (&self.tss) as *const TaskStateSegment;
        unsafe { &*ptr }
    }

    /// # Panics
    ///
    /// Panics if called a second time on the same instance.
    fn init(self: &mut Pin<&mut Self>) {
        if self.is_initialised {
            panic!("SegmentData is being initialised a second time");
        }

        let exception_bottom = VirtAddr::from_ptr(&self.exception_stack);
        self.tss.interrupt_stack_table[EXCEPTION_STACK_IST_INDEX as usize] = exception_bottom + self.exception_stack.len();
        let interrupt_bottom = VirtAddr::from_ptr(&self.interrupt_stack);
        self.tss.interrupt_stack_table[INTERRUPT_STACK_IST_INDEX as usize] = interrupt_bottom + self.interrupt_stack.len();

        let tss_ref = self.tss_ref();
        self.kernel_code = self.gdt.add_entry(Descriptor::kernel_code_segment());
        self.kernel_data = self.gdt.add_entry(Descriptor::kernel_data_segment());
        self.task_state = self.gdt.add_entry(Descriptor::tss_segment(tss_ref));
        self.user_data = self.gdt.add_entry(Descriptor::user_data_segment());
        self.user_code = self.gdt.add_entry(Descriptor::user_code_segment());

        self.is_initialised = true;
    }

    /// # Panics
    ///
    /// Panics if already active, or not yet initialised.
    fn activate(self: &mut Pin<&mut Self>) {
        if !self.is_initialised {
            panic!("SegmentData is being activated before being initialised");
        }
        if self.is_active {
            panic!("SegmentData is being activated a second time");
        }

        unsafe {
            self.gdt.load_unsafe();
            CS::set_reg(self.kernel_code);
            SS::set_reg(self.kernel_data);
            load_tss(self.task_state);
        }

        self.is_active = true;
    }

    /// Activates this segment data in place of `previous`.
    ///
    /// # Panics
    ///
    /// Panics if `previous` is not currently active.
    fn swap(self: &mut Pin<&mut Self>, mut previous: Pin<&mut Self>) {
        if !previous.is_active {
            panic!("previous SegmentData is not currently active");
        }
        self.activate();
        previous.is_active = false;
    }

    pub fn kernel_selectors(self: &Pin<&mut Self>) -> (SegmentSelector, SegmentSelector) {
        (self.kernel_code, self.kernel_data)
    }

    pub fn user_selectors(self: &Pin<&mut Self>) -> (SegmentSelector, SegmentSelector) {
        (self.user_code, self.user_data)
    }
}

impl Drop for SegmentData {
    fn drop(&mut self) {
        if self.is_active {
            panic!("SegmentData was dropped while still active in the CPU");
        }
    }
}

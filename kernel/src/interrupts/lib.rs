// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Fault and interrupt dispatch: a table-driven policy layer in
//! [`dispatch`], and the real IDT wiring in [`idt`] that funnels
//! hardware vectors into it.
//!
//! Drivers that need a vector call [`allocate_interrupt`] and
//! [`register_interrupt`] (or [`allocate_shirq`] to share one vector
//! across several handlers); nothing else in this crate needs to be
//! touched to add a new device.

#![no_std]

extern crate alloc;

mod dispatch;
mod idt;

pub use dispatch::{
    allocate_interrupt, allocate_shirq, common_handler, free_interrupt, register_interrupt, set_interrupt_controller, InterruptController,
    InterruptThunk, Outcome, Shirq, FIRST_ALLOCATABLE_VECTOR, N_VECTORS, SPURIOUS_INT_VECTOR,
};
pub use idt::{init, set_current_cpu, CurrentCpu};

// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Handles interactions with the first serial port.
//!
//! This is used for early kernel logging: diagnostics printed while
//! tearing down or inspecting page tables run long before any display
//! driver is available, so [`println!`] going out over COM1 is the only
//! channel that is guaranteed to work.

#![no_std]

use core::fmt::Write;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::interrupts;

lazy_static! {
    /// SERIAL1 is the first serial port, sometimes called COM1.
    static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(0x3F8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

/// Writes formatted text to the serial port, acquiring `SERIAL1`'s lock.
///
/// Not normally called directly; use [`print!`] or [`println!`] instead.
#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    interrupts::without_interrupts(|| {
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("printing to serial failed");
    });
}

/// The standard printing macro, writing to the serial port.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::_print(format_args!($($arg)*)));
}

/// The standard line-printing macro, writing to the serial port.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

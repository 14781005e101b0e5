// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The saved CPU register frame: what a vector stub pushes on entry and
//! what `frame_return` pops on the way back out.
//!
//! [`Frame`] is deliberately opaque to everything outside this crate and
//! the fault dispatcher: callers read and write it only through the
//! accessors below, never by reaching into its layout directly, because
//! the layout is shared with assembly that this crate does not contain.

/// Number of general-purpose/control slots saved per frame, not counting
/// the extended (FPU/SSE) save area, which is sized and allocated at
/// runtime rather than compiled into the layout.
pub const FRAME_MAX: usize = 24;

/// A saved CPU register frame.
///
/// Laid out to match what a vector stub pushes: general-purpose
/// registers, then the software-assigned vector and error code, then
/// the hardware-pushed interrupt frame (`rip, cs, rflags, rsp, ss`).
/// Two extra software fields ride along in the same allocation: the
/// per-vector fault handler (`FRAME_FAULT_HANDLER`) and the `FULL` flag
/// the common handler uses to detect reentrant dispatch.
#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub struct Frame {
    slots: [u64; FRAME_MAX],
}

// Slot indices. Named rather than public so callers go through the
// accessor methods instead of indexing `slots` directly.
const SLOT_VECTOR: usize = 0;
const SLOT_ERROR_CODE: usize = 1;
const SLOT_RIP: usize = 2;
const SLOT_CS: usize = 3;
const SLOT_RFLAGS: usize = 4;
const SLOT_RSP: usize = 5;
const SLOT_SS: usize = 6;
const SLOT_FAULT_HANDLER: usize = 7;
const SLOT_FLAGS: usize = 8;

const FLAG_FULL: u64 = 1 << 0;

/// Signature of a per-vector fault handler, as installed by
/// [`crate::install_fallback_fault_handler`]. Returning `Some` asks the
/// dispatcher to `frame_return` into the returned frame instead of the
/// one the handler was given; returning `None` resumes the original
/// frame.
pub type FaultHandlerFn = fn(&mut Frame) -> Option<&'static mut Frame>;

impl Frame {
    /// A zeroed frame: vector 0, no fault handler, `FULL` clear. Only
    /// ever seen as the initial contents of a fresh [`crate::KernelContext`];
    /// real frames are populated by the vector stub before dispatch.
    pub const fn zeroed() -> Self {
        Frame { slots: [0; FRAME_MAX] }
    }

    pub fn vector(&self) -> u64 {
        self.slots[SLOT_VECTOR]
    }

    pub fn set_vector(&mut self, vector: u64) {
        self.slots[SLOT_VECTOR] = vector;
    }

    pub fn error_code(&self) -> u64 {
        self.slots[SLOT_ERROR_CODE]
    }

    pub fn set_error_code(&mut self, code: u64) {
        self.slots[SLOT_ERROR_CODE] = code;
    }

    pub fn rip(&self) -> u64 {
        self.slots[SLOT_RIP]
    }

    pub fn cs(&self) -> u64 {
        self.slots[SLOT_CS]
    }

    pub fn rflags(&self) -> u64 {
        self.slots[SLOT_RFLAGS]
    }

    pub fn rsp(&self) -> u64 {
        self.slots[SLOT_RSP]
    }

    pub fn ss(&self) -> u64 {
        self.slots[SLOT_SS]
    }

    /// The handler this frame falls back to when no per-vector handler
    /// is registered for [`Self::vector`], encoded as a fat-free
    /// function pointer. `None` means no fallback has been installed.
    pub fn fault_handler(&self) -> Option<FaultHandlerFn> {
        let raw = self.slots[SLOT_FAULT_HANDLER];
        if raw == 0 {
            None
        } else {
            // SAFETY: the only writer is `set_fault_handler`, which only
            // ever stores a value produced by casting a `FaultHandlerFn`.
            Some(unsafe { core::mem::transmute::<u64, FaultHandlerFn>(raw) })
        }
    }

    pub fn set_fault_handler(&mut self, handler: FaultHandlerFn) {
        self.slots[SLOT_FAULT_HANDLER] = handler as u64;
    }

    /// `true` once [`Self::set_full`] has run and before [`Self::clear_full`];
    /// the common handler fatal-asserts on a second dispatch onto a
    /// frame that is still full, per the single-reentry invariant.
    pub fn is_full(&self) -> bool {
        self.slots[SLOT_FLAGS] & FLAG_FULL != 0
    }

    pub fn set_full(&mut self) {
        self.slots[SLOT_FLAGS] |= FLAG_FULL;
    }

    pub fn clear_full(&mut self) {
        self.slots[SLOT_FLAGS] &= !FLAG_FULL;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zeroed_frame_has_no_fault_handler_and_is_not_full() {
        let f = Frame::zeroed();
        assert!(f.fault_handler().is_none());
        assert!(!f.is_full());
        assert_eq!(f.vector(), 0);
    }

    fn dummy_handler(_f: &mut Frame) -> Option<&'static mut Frame> {
        None
    }

    #[test]
    fn fault_handler_round_trips() {
        let mut f = Frame::zeroed();
        f.set_fault_handler(dummy_handler);
        let got = f.fault_handler().expect("handler should be set");
        assert!(got as usize == dummy_handler as usize);
    }

    #[test]
    fn full_flag_round_trips() {
        let mut f = Frame::zeroed();
        assert!(!f.is_full());
        f.set_full();
        assert!(f.is_full());
        f.clear_full();
        assert!(!f.is_full());
    }

    #[test]
    fn vector_and_error_code_round_trip() {
        let mut f = Frame::zeroed();
        f.set_vector(14);
        f.set_error_code(0x2);
        assert_eq!(f.vector(), 14);
        assert_eq!(f.error_code(), 0x2);
    }
}

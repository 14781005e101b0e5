// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The physically-backed heap: composes a virtual-address allocator, a
//! physical-frame allocator, and the page-table engine into a single
//! allocate/deallocate interface that yields mapped virtual memory.
//!
//! Neither sub-allocator is this crate's concern: [`RangeAllocator`] is
//! the uniform capability [`BackedHeap`] asks of whatever hands out
//! virtual ranges and whatever hands out physical frames, so production
//! code can plug in its own general-purpose allocators (an id-heap or an
//! mcache, say) while this crate's tests exercise
//! [`range_alloc::BitmapRangeAllocator`], a minimal bitmap-backed stand-in
//! that implements the same trait.

#![no_std]

mod heap;
mod range_alloc;

pub use heap::BackedHeap;
pub use range_alloc::{BitmapRangeAllocator, RangeAllocator, INVALID};

//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses, 4 KiB frames and pages,
//! and the ranges the memory manager operates on.
//!
//! ## Overview
//!
//! The types are zero-cost wrappers around `u64` values that keep virtual and
//! physical quantities apart at compile time:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`PhysicalFrame`] | A 4 KiB-aligned physical frame, addressable by its frame number. |
//! | [`FrameRange`] | A run of physically contiguous frames. |
//! | [`PhysicalRange`] | An arbitrary `[start, end)` byte range, e.g. from a firmware memory map. |
//! | [`VirtualAddress`] | A byte address in some virtual address space. |
//! | [`VirtualPage`] | A 4 KiB-aligned virtual page. |
//! | [`VirtualRange`] | A page-aligned `[start, end)` virtual range. |
//!
//! Only 4 KiB granularity exists; the memory manager never creates larger
//! leaf mappings.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0000_7fff_0000_1234);
//! let page = va.page();
//! assert_eq!(page.base().as_u64(), 0x0000_7fff_0000_1000);
//! assert_eq!(va.page_offset(), 0x234);
//!
//! let frame = PhysicalFrame::from_number(0x300);
//! assert_eq!(frame.base().as_u64(), 0x30_0000);
//! assert_eq!(frame.join(0x10).as_u64(), 0x30_0010);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod physical_frame;
mod range;
mod virtual_address;
mod virtual_page;

pub use crate::physical_address::PhysicalAddress;
pub use crate::physical_frame::PhysicalFrame;
pub use crate::range::{FrameRange, PhysicalRange, VirtualRange};
pub use crate::virtual_address::VirtualAddress;
pub use crate::virtual_page::VirtualPage;

/// Size of a frame or page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the in-page offset bits.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` on overflow.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0, 4096), Some(0));
/// assert_eq!(align_up(1, 4096), Some(4096));
/// assert_eq!(align_up(4096, 4096), Some(4096));
/// assert_eq!(align_up(u64::MAX, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Number of pages needed to hold `bytes` bytes.
///
/// ```rust
/// # use kernel_memory_addresses::pages_for;
/// assert_eq!(pages_for(0), 0);
/// assert_eq!(pages_for(1), 1);
/// assert_eq!(pages_for(4097), 2);
/// ```
#[inline(always)]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

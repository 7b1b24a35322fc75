use crate::{PAGE_SIZE, VirtualAddress, align_down};
use core::fmt;

/// A 4 KiB virtual page, stored as its page-aligned base.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let p = VirtualPage::containing(VirtualAddress::new(0x4000_0fff));
/// assert_eq!(p.base().as_u64(), 0x4000_0000);
/// assert_eq!(p.join(0xfff).as_u64(), 0x4000_0fff);
/// assert_eq!(p.next().unwrap().base().as_u64(), 0x4000_1000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(VirtualAddress);

impl VirtualPage {
    #[inline]
    #[must_use]
    pub const fn containing(va: VirtualAddress) -> Self {
        Self(VirtualAddress::new(align_down(va.as_u64(), PAGE_SIZE)))
    }

    /// Construct from an already aligned address.
    ///
    /// ### Debug assertions
    /// - Asserts that `va` is 4 KiB aligned.
    #[inline]
    #[must_use]
    pub const fn from_base(va: VirtualAddress) -> Self {
        debug_assert!(va.is_page_aligned(), "page base not aligned");
        Self::containing(va)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> VirtualAddress {
        debug_assert!(offset < PAGE_SIZE);
        VirtualAddress::new(self.0.as_u64() | offset)
    }

    /// The following page, or `None` at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(PAGE_SIZE) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Number of pages from `self` up to (excluding) `later`.
    #[inline]
    #[must_use]
    pub const fn pages_until(self, later: Self) -> u64 {
        (later.0.as_u64() - self.0.as_u64()) / PAGE_SIZE
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({:#x})", self.0.as_u64())
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

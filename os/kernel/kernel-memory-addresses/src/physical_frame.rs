use crate::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, align_down};
use core::fmt;

/// A 4 KiB physical frame.
///
/// Stores the **frame-aligned base** of the frame; the frame number is the
/// base shifted right by [`PAGE_SHIFT`]. The frame allocator indexes its
/// frame table by that number.
///
/// ### Invariants
/// - The low 12 bits of the base are always zero.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let f = PhysicalFrame::containing(PhysicalAddress::new(0x1234_5678));
/// assert_eq!(f.base().as_u64(), 0x1234_5000);
/// assert_eq!(f.number(), 0x12345);
/// assert_eq!(f.next().number(), 0x12346);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalFrame(PhysicalAddress);

impl PhysicalFrame {
    /// The frame containing `pa` (low bits are discarded).
    #[inline]
    #[must_use]
    pub const fn containing(pa: PhysicalAddress) -> Self {
        Self(PhysicalAddress::new(align_down(pa.as_u64(), PAGE_SIZE)))
    }

    /// Construct from an already aligned address.
    ///
    /// ### Debug assertions
    /// - Asserts that `pa` is 4 KiB aligned.
    #[inline]
    #[must_use]
    pub const fn from_base(pa: PhysicalAddress) -> Self {
        debug_assert!(pa.is_frame_aligned(), "frame base not aligned");
        Self::containing(pa)
    }

    #[inline]
    #[must_use]
    pub const fn from_number(number: u64) -> Self {
        Self(PhysicalAddress::new(number << PAGE_SHIFT))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0.as_u64() >> PAGE_SHIFT
    }

    /// Combine the frame base with an in-frame offset.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> PhysicalAddress {
        debug_assert!(offset < PAGE_SIZE);
        PhysicalAddress::new(self.0.as_u64() | offset)
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self::from_number(self.number() + 1)
    }

    /// The frame `n` frames after this one.
    #[inline]
    #[must_use]
    pub const fn offset_by(self, n: u64) -> Self {
        Self::from_number(self.number() + n)
    }
}

impl fmt::Debug for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:#x})", self.number())
    }
}

impl fmt::Display for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

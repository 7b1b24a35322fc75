//! Frame, virtual and physical ranges.

use crate::{
    PAGE_SIZE, PhysicalAddress, PhysicalFrame, VirtualAddress, VirtualPage, align_down, align_up,
};
use core::fmt;

/// A run of `count` physically contiguous frames starting at `start`.
///
/// An empty range (`count == 0`) is valid and denotes "nothing allocated".
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct FrameRange {
    start: PhysicalFrame,
    count: usize,
}

impl FrameRange {
    #[inline]
    #[must_use]
    pub const fn new(start: PhysicalFrame, count: usize) -> Self {
        Self { start, count }
    }

    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self::new(PhysicalFrame::from_number(0), 0)
    }

    #[inline]
    #[must_use]
    pub const fn single(frame: PhysicalFrame) -> Self {
        Self::new(frame, 1)
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalFrame {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// First frame number past the end of the range.
    #[inline]
    #[must_use]
    pub const fn end_number(&self) -> u64 {
        self.start.number() + self.count as u64
    }

    /// Size of the range in bytes.
    #[inline]
    #[must_use]
    pub const fn len_bytes(&self) -> u64 {
        self.count as u64 * PAGE_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, frame: PhysicalFrame) -> bool {
        frame.number() >= self.start.number() && frame.number() < self.end_number()
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start.number() < other.end_number()
            && other.start.number() < self.end_number()
    }

    /// The `i`-th frame of the range.
    #[inline]
    #[must_use]
    pub const fn nth(&self, i: usize) -> Option<PhysicalFrame> {
        if i < self.count {
            Some(self.start.offset_by(i as u64))
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = PhysicalFrame> + use<> {
        let start = self.start;
        (0..self.count as u64).map(move |i| start.offset_by(i))
    }
}

impl fmt::Debug for FrameRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frames[{:#x}..{:#x})",
            self.start.number(),
            self.end_number()
        )
    }
}

/// A page-aligned virtual range `[start, end)`.
///
/// Constructed only through checked constructors so both bounds are always
/// aligned and `start <= end`.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let r = VirtualRange::new(VirtualAddress::new(0x1000), VirtualAddress::new(0x4000)).unwrap();
/// assert_eq!(r.page_count(), 3);
/// assert!(VirtualRange::new(VirtualAddress::new(0x1001), VirtualAddress::new(0x4000)).is_none());
///
/// let cover = VirtualRange::covering(VirtualAddress::new(0x1ff0), 0x20).unwrap();
/// assert_eq!(cover.start().as_u64(), 0x1000);
/// assert_eq!(cover.end().as_u64(), 0x3000);
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct VirtualRange {
    start: VirtualAddress,
    end: VirtualAddress,
}

impl VirtualRange {
    /// Range from aligned bounds; `None` if misaligned or reversed.
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Option<Self> {
        if !start.is_page_aligned() || !end.is_page_aligned() || start.as_u64() > end.as_u64() {
            return None;
        }
        Some(Self { start, end })
    }

    /// `pages` pages starting at `start`; `None` on overflow.
    #[must_use]
    pub const fn from_pages(start: VirtualPage, pages: u64) -> Option<Self> {
        let Some(len) = pages.checked_mul(PAGE_SIZE) else {
            return None;
        };
        let Some(end) = start.base().checked_add(len) else {
            return None;
        };
        Some(Self {
            start: start.base(),
            end,
        })
    }

    /// Smallest page-aligned range covering `[addr, addr + len)`.
    ///
    /// Returns `None` if the byte range wraps around the address space.
    #[must_use]
    pub const fn covering(addr: VirtualAddress, len: u64) -> Option<Self> {
        let Some(last) = addr.as_u64().checked_add(len) else {
            return None;
        };
        let Some(end) = align_up(last, PAGE_SIZE) else {
            return None;
        };
        Some(Self {
            start: VirtualAddress::new(align_down(addr.as_u64(), PAGE_SIZE)),
            end: VirtualAddress::new(end),
        })
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.len() / PAGE_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn first_page(&self) -> VirtualPage {
        VirtualPage::from_base(self.start)
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() < self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn contains_range(&self, other: &Self) -> bool {
        other.start.as_u64() >= self.start.as_u64() && other.end.as_u64() <= self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start.as_u64() < other.end.as_u64() && other.start.as_u64() < self.end.as_u64()
    }

    /// Same end, new start.
    ///
    /// ### Debug assertions
    /// `start` must be page aligned and not above the end.
    #[inline]
    #[must_use]
    pub const fn with_start(self, start: VirtualAddress) -> Self {
        debug_assert!(start.is_page_aligned() && start.as_u64() <= self.end.as_u64());
        Self { start, end: self.end }
    }

    /// Same start, new end.
    ///
    /// ### Debug assertions
    /// `end` must be page aligned and not below the start.
    #[inline]
    #[must_use]
    pub const fn with_end(self, end: VirtualAddress) -> Self {
        debug_assert!(end.is_page_aligned() && end.as_u64() >= self.start.as_u64());
        Self { start: self.start, end }
    }

    /// The overlapping part of two ranges, if non-empty.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Iterate over every page of the range in ascending order.
    pub fn pages(&self) -> impl Iterator<Item = VirtualPage> + use<> {
        let start = self.start.as_u64();
        (0..self.page_count()).map(move |i| VirtualPage::from_base(VirtualAddress::new(start + i * PAGE_SIZE)))
    }
}

impl fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VA[{:#x}..{:#x})",
            self.start.as_u64(),
            self.end.as_u64()
        )
    }
}

/// A byte range `[start, end)` of physical memory with no alignment guarantees.
///
/// Used for firmware memory-map regions and the kernel image extent.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct PhysicalRange {
    start: PhysicalAddress,
    end: PhysicalAddress,
}

impl PhysicalRange {
    /// `[start, start + len)`, clamped at the top of the address space.
    #[must_use]
    pub const fn new(start: PhysicalAddress, len: u64) -> Self {
        Self {
            start,
            end: PhysicalAddress::new(start.as_u64().saturating_add(len)),
        }
    }

    /// `[start, end)`; a reversed range is treated as empty.
    #[must_use]
    pub const fn from_bounds(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        if end.as_u64() < start.as_u64() {
            Self { start, end: start }
        } else {
            Self { start, end }
        }
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start.as_u64() < other.end.as_u64() && other.start.as_u64() < self.end.as_u64()
    }

    /// Frame numbers fully contained in this range, as `first..end`.
    ///
    /// Used for usable memory: a partially usable frame is not usable.
    #[must_use]
    pub const fn inner_frames(&self) -> core::ops::Range<u64> {
        let first = match align_up(self.start.as_u64(), PAGE_SIZE) {
            Some(v) => v / PAGE_SIZE,
            None => u64::MAX / PAGE_SIZE,
        };
        let end = align_down(self.end.as_u64(), PAGE_SIZE) / PAGE_SIZE;
        if first < end { first..end } else { first..first }
    }

    /// Frame numbers touched by this range, as `first..end`.
    ///
    /// Used for reserved memory: a partially reserved frame is reserved.
    #[must_use]
    pub const fn outer_frames(&self) -> core::ops::Range<u64> {
        if self.is_empty() {
            let n = self.start.as_u64() / PAGE_SIZE;
            return n..n;
        }
        let first = align_down(self.start.as_u64(), PAGE_SIZE) / PAGE_SIZE;
        let end = match align_up(self.end.as_u64(), PAGE_SIZE) {
            Some(v) => v / PAGE_SIZE,
            None => u64::MAX / PAGE_SIZE + 1,
        };
        first..end
    }
}

impl fmt::Debug for PhysicalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PA[{:#x}..{:#x})",
            self.start.as_u64(),
            self.end.as_u64()
        )
    }
}

//! # Boot Memory Information
//!
//! The physical memory map and kernel image extent handed to the memory
//! manager once, right after the bootloader has exited.

use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};

/// Classification of a physical memory region.
///
/// Only [`Usable`](Self::Usable) memory is ever handed out by the frame
/// allocator; everything else is permanently reserved.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM.
    Usable = 0,
    /// Firmware or hardware reserved.
    Reserved = 1,
    /// ACPI tables; reclaimable once parsed, treated as reserved here.
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage.
    AcpiNvs = 3,
    /// RAM reported as faulty.
    Defective = 4,
}

/// One entry of the bootloader-provided memory map.
///
/// Keep this `#[repr(C)]`; it crosses the bootloader/kernel boundary.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    /// Physical start address in bytes.
    pub start: u64,
    /// Length in bytes.
    pub len: u64,
    /// What the memory may be used for.
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(start: u64, len: u64, kind: MemoryRegionKind) -> Self {
        Self { start, len, kind }
    }

    #[must_use]
    pub const fn usable(start: u64, len: u64) -> Self {
        Self::new(start, len, MemoryRegionKind::Usable)
    }

    #[must_use]
    pub const fn range(&self) -> PhysicalRange {
        PhysicalRange::new(PhysicalAddress::new(self.start), self.len)
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }
}

/// Everything the memory manager needs from the boot path.
#[derive(Copy, Clone, Debug)]
pub struct BootMemoryInfo<'a> {
    /// The raw physical memory map. Regions may be unsorted and may overlap;
    /// a frame touched by any non-usable region is reserved.
    pub regions: &'a [MemoryRegion],

    /// Physical extent of the loaded kernel image.
    pub kernel_image: PhysicalRange,

    /// Additional ranges that must never be allocated (boot stacks, the
    /// boot info block itself, early framebuffers, ...).
    pub reserved: &'a [PhysicalRange],
}

impl<'a> BootMemoryInfo<'a> {
    #[must_use]
    pub const fn new(regions: &'a [MemoryRegion], kernel_image: PhysicalRange) -> Self {
        Self {
            regions,
            kernel_image,
            reserved: &[],
        }
    }

    #[must_use]
    pub const fn with_reserved(mut self, reserved: &'a [PhysicalRange]) -> Self {
        self.reserved = reserved;
        self
    }

    /// Exclusive end of the highest usable region, or `None` if no usable
    /// memory exists.
    #[must_use]
    pub fn usable_end(&self) -> Option<PhysicalAddress> {
        self.regions
            .iter()
            .filter(|r| r.is_usable() && r.len > 0)
            .map(|r| r.range().end())
            .max()
    }
}

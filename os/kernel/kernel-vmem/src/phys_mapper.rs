//! # Direct-map [`PhysMapper`]
//!
//! The kernel maps all managed physical memory into the upper half at a
//! fixed offset (the higher-half direct map, HHDM). Touching a physical
//! address is then a single addition:
//!
//! ```text
//! VA = base + PA
//! ```
//!
//! [`HhdmPhysMapper::kernel`] uses [`HHDM_BASE`]. Host tests back "physical
//! memory" with an ordinary buffer and construct the mapper with a runtime
//! base via [`HhdmPhysMapper::with_base`].
//!
//! ## Example
//! ```rust
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::{HhdmPhysMapper, PhysMapper};
//! let mapper = HhdmPhysMapper::kernel();
//! let ptr = mapper.phys_to_ptr(PhysicalAddress::new(0x1234_0000));
//! assert_eq!(ptr.addr() as u64, kernel_vmem::info::HHDM_BASE + 0x1234_0000);
//! ```

use crate::PhysMapper;
use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// [`PhysMapper`] for a linear physical-to-virtual window.
///
/// # Safety
/// The window must be present and cover every physical address handed to
/// [`phys_to_ptr`](PhysMapper::phys_to_ptr) before the pointer is used.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    base: u64,
}

impl HhdmPhysMapper {
    /// The kernel's direct map at [`HHDM_BASE`].
    #[inline]
    #[must_use]
    pub const fn kernel() -> Self {
        Self { base: HHDM_BASE }
    }

    /// A window starting at `base`.
    ///
    /// `base` may be any value, including one that wraps when added to a
    /// physical address (host buffers below the simulated physical range).
    ///
    /// # Safety
    /// `base + pa` must be a valid, writable, exposed-provenance address for
    /// every physical address used with this mapper.
    #[inline]
    #[must_use]
    pub const unsafe fn with_base(base: u64) -> Self {
        Self { base }
    }

    /// Offset added to physical addresses.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// The virtual address through which `pa` is reached.
    #[inline]
    #[must_use]
    pub const fn virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.base.wrapping_add(pa.as_u64()))
    }

    /// Inverse of [`virt`](Self::virt) for addresses inside the window.
    #[inline]
    #[must_use]
    pub const fn phys(&self, va: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress::new(va.as_u64().wrapping_sub(self.base))
    }
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::kernel()
    }
}

impl PhysMapper for HhdmPhysMapper {
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        core::ptr::with_exposed_provenance_mut(self.virt(pa).as_u64() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_and_phys_are_inverse() {
        let m = unsafe { HhdmPhysMapper::with_base(0x7000_0000) };
        let pa = PhysicalAddress::new(0x0012_3000);
        assert_eq!(m.virt(pa).as_u64(), 0x7012_3000);
        assert_eq!(m.phys(m.virt(pa)), pa);
    }

    #[test]
    fn wrapping_base_still_inverts() {
        // buffer at a lower host address than the simulated physical start
        let base = 0x1000u64.wrapping_sub(0x10_0000);
        let m = unsafe { HhdmPhysMapper::with_base(base) };
        let pa = PhysicalAddress::new(0x10_2000);
        assert_eq!(m.virt(pa).as_u64(), 0x3000);
        assert_eq!(m.phys(VirtualAddress::new(0x3000)), pa);
    }
}

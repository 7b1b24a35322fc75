use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame};

/// A single 64-bit x86-64 page table entry in its raw bitfield form.
///
/// This structure models the **common superset** of fields found in all four
/// paging levels (PML4E, PDPTE, PDE, PTE). Each bit corresponds to a
/// hardware-defined flag or address field as specified by the AMD64 and Intel
/// manuals, except for three OS-available bits the memory manager assigns:
///
/// - bit 9, [`copy_on_write`](Self::copy_on_write): the leaf maps a frame
///   shared with another mapping; a write must copy it first.
/// - bit 10, [`unmanaged`](Self::unmanaged): the leaf's frame is not
///   reference counted (MMIO, the direct map, the kernel image) and must not be
///   released on unmap.
/// - bit 11, [`no_access`](Self::no_access): set on a non-present leaf that
///   still owns its frame because the area was made inaccessible. Together
///   with `present` it makes up [`occupied`](Self::occupied).
///
/// ### Bit layout (canonical)
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PS` / `PAT`      | Large page; never set by this crate |
/// | 8         | `G`               | Global (leaf only) |
/// | 9         | OS: COW           | Copy-on-write leaf |
/// | 10        | OS: unmanaged     | Frame not reference counted |
/// | 11        | OS: no access     | Frame kept, present cleared |
/// | 12–51     | `addr`            | Physical frame bits [51:12] |
/// | 52–58     | OS avail high     | Unused |
/// | 59–62     | `PKU`             | Protection key |
/// | 63        | `NX`              | Execute disable |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let mut e = PageEntryBits::new();
/// e.set_present(true);
/// e.set_writable(true);
/// e.set_physical_address(PhysicalAddress::new(0x12345));
/// assert!(e.present());
/// assert_eq!(e.physical_address().as_u64(), 0x12000);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    ///
    /// Set if the entry points to a valid next-level table or a valid leaf.
    /// Clear implies a not-present entry.
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Set to allow writes; clear for read-only. Permissions are the
    /// intersection over the walk, so table entries are always writable and
    /// the leaf decides.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    ///
    /// Set to allow user-mode access; clear restricts to supervisor only.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    ///
    /// Set for MMIO mappings.
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (D, bit 6): **leaf only**. Set by the CPU on first write.
    pub dirty: bool,

    /// Large Page / Page Size (PS, bit 7).
    ///
    /// Huge pages are not supported; this bit is never set on entries
    /// written by this crate and a set bit is treated as a foreign leaf.
    pub large_page: bool,

    /// Global (G, bit 8): **leaf only**.
    ///
    /// Kernel-half leaves are global so CR3 reloads keep them cached.
    pub global_translation: bool,

    /// Copy-on-write marker (OS-available bit 9).
    pub copy_on_write: bool,

    /// Frame is not reference counted (OS-available bit 10).
    pub unmanaged: bool,

    /// Leaf parked without access (OS-available bit 11). Only valid with
    /// `present` clear.
    pub no_access: bool,

    /// Physical address bits [51:12] (bits 12..=51).
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection Key (PKU, bits 59..=62) if supported; otherwise OS use.
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63): Execute Disable.
    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        // store bits [51:12]
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// The frame this entry refers to (next table or mapped page).
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalFrame {
        PhysicalFrame::from_base(self.physical_address())
    }

    /// Same flags, pointing at `frame`.
    #[inline]
    #[must_use]
    pub const fn with_frame(mut self, frame: PhysicalFrame) -> Self {
        self.set_physical_address(frame.base());
        self
    }

    /// Flags for a non-leaf entry linking to the next table level.
    ///
    /// Always present and writable; `user` must be set for user-half tables
    /// so the leaf alone decides user accessibility.
    #[inline]
    #[must_use]
    pub const fn table(user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
    }

    /// Kernel read-write data: global, non-executable.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_global_translation(true)
            .with_no_execute(true)
    }

    /// Kernel text: global, executable, writable only if `writable`.
    #[inline]
    #[must_use]
    pub const fn kernel_code(writable: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(writable)
            .with_global_translation(true)
    }

    /// Uncached kernel MMIO window; the frames are never reference counted.
    #[inline]
    #[must_use]
    pub const fn kernel_mmio() -> Self {
        Self::kernel_rw()
            .with_cache_disabled(true)
            .with_write_through(true)
            .with_unmanaged(true)
    }

    /// User leaf with the given permissions.
    #[inline]
    #[must_use]
    pub const fn user(writable: bool, executable: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_user_access(true)
            .with_writable(writable)
            .with_no_execute(!executable)
    }

    /// Demote a writable leaf to a read-only copy-on-write leaf.
    #[inline]
    #[must_use]
    pub const fn into_cow(self) -> Self {
        self.with_writable(false).with_copy_on_write(true)
    }

    /// Promote a copy-on-write leaf back to a private writable leaf.
    #[inline]
    #[must_use]
    pub const fn into_private_writable(self) -> Self {
        self.with_writable(true).with_copy_on_write(false)
    }

    /// Park a leaf: clear `present` but keep the frame and every other bit.
    #[inline]
    #[must_use]
    pub const fn into_no_access(self) -> Self {
        self.with_present(false).with_no_access(true)
    }

    /// `true` if the entry refers to a frame, accessible or parked.
    #[inline]
    #[must_use]
    pub const fn occupied(self) -> bool {
        self.present() || self.no_access()
    }

    /// Permission and caching bits only, without CPU-maintained state
    /// (accessed/dirty) and without the address.
    #[inline]
    #[must_use]
    pub const fn permissions(self) -> Self {
        self.with_accessed(false)
            .with_dirty(false)
            .with_phys_addr_bits_51_12(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_bits_land_in_bits_9_and_10() {
        let cow = PageEntryBits::new().with_copy_on_write(true);
        assert_eq!(cow.into_bits(), 1 << 9);
        let unmanaged = PageEntryBits::new().with_unmanaged(true);
        assert_eq!(unmanaged.into_bits(), 1 << 10);
    }

    #[test]
    fn address_field_roundtrip_preserves_flags() {
        let frame = PhysicalFrame::from_number(0xdead);
        let e = PageEntryBits::user(true, false).with_frame(frame);
        assert_eq!(e.frame(), frame);
        assert!(e.present() && e.writable() && e.user_access() && e.no_execute());
        assert_eq!(e.into_bits() & 0x000f_ffff_ffff_f000, 0xdead_000);
    }

    #[test]
    fn cow_demotion_and_promotion() {
        let e = PageEntryBits::user(true, true).into_cow();
        assert!(!e.writable());
        assert!(e.copy_on_write());
        let back = e.into_private_writable();
        assert_eq!(back, PageEntryBits::user(true, true));
    }

    #[test]
    fn parked_leaf_keeps_its_frame() {
        let frame = PhysicalFrame::from_number(42);
        let e = PageEntryBits::user(true, false).into_cow().with_frame(frame);
        let parked = e.into_no_access();
        assert!(!parked.present() && parked.occupied());
        assert!(parked.copy_on_write());
        assert_eq!(parked.frame(), frame);
        assert_eq!(parked.into_bits() & (1 << 11), 1 << 11);
        assert!(!PageEntryBits::new().occupied());
    }

    #[test]
    fn permissions_strip_hardware_state() {
        let e = PageEntryBits::kernel_rw()
            .with_frame(PhysicalFrame::from_number(3))
            .with_accessed(true)
            .with_dirty(true);
        assert_eq!(e.permissions(), PageEntryBits::kernel_rw());
    }
}

//! # x86-64 Page Tables
//!
//! One table type serves all four levels because no level ever holds a
//! large-page leaf: PML4, PDPT and PD entries always link to the next table,
//! PT entries always map a 4 KiB frame.
//!
//! - [`TableLevel`]: which of the four levels a table sits at.
//! - [`TableIndex`]: a 9-bit index into one table, derived from a VA.
//! - [`PageTable`]: a 4 KiB-aligned array of 512 [`PageEntryBits`].

use crate::PageEntryBits;
use kernel_memory_addresses::VirtualAddress;

/// Number of entries in every table.
pub const ENTRIES: usize = 512;

/// Paging level of a table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum TableLevel {
    /// Page table; entries map 4 KiB pages.
    L1 = 1,
    /// Page directory; each entry covers 2 MiB.
    L2 = 2,
    /// Page directory pointer table; each entry covers 1 GiB.
    L3 = 3,
    /// PML4; each entry covers 512 GiB.
    L4 = 4,
}

impl TableLevel {
    /// Bit position of this level's index inside a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        12 + 9 * (self as u32 - 1)
    }

    /// Bytes of virtual address space covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// The level below, or `None` for L1.
    #[inline]
    #[must_use]
    pub const fn next_lower(self) -> Option<Self> {
        match self {
            Self::L4 => Some(Self::L3),
            Self::L3 => Some(Self::L2),
            Self::L2 => Some(Self::L1),
            Self::L1 => None,
        }
    }
}

/// Index into a page table at some level (range `0..512`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// Extract the index for `level` from a virtual address.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(va: VirtualAddress, level: TableLevel) -> Self {
        Self::new(((va.as_u64() >> level.shift()) & 0x1FF) as u16)
    }

    /// Construct from a raw `u16`.
    ///
    /// ### Debug assertions
    /// - Asserts `v < 512` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 512);
        Self(v)
    }

    /// Return the index as `usize` for table access.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Split a virtual address into its `[L4, L3, L2, L1]` table indices.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> [TableIndex; 4] {
    [
        TableIndex::of(va, TableLevel::L4),
        TableIndex::of(va, TableLevel::L3),
        TableIndex::of(va, TableLevel::L2),
        TableIndex::of(va, TableLevel::L1),
    ]
}

/// A page table at any level: 512 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; ENTRIES],
}

impl PageTable {
    /// Create a fully zeroed table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntryBits::new(); ENTRIES],
        }
    }

    /// Read the entry at `i`.
    ///
    /// Plain load; does not imply any TLB synchronization.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PageEntryBits {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PageEntryBits) {
        self.entries[i.as_usize()] = e;
    }

    /// Clear the entry at `i`, returning the previous value.
    #[inline]
    pub const fn take(&mut self, i: TableIndex) -> PageEntryBits {
        let old = self.entries[i.as_usize()];
        self.entries[i.as_usize()] = PageEntryBits::new();
        old
    }

    /// `true` if no entry is [`occupied`](PageEntryBits::occupied).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.occupied())
    }

    /// Number of occupied entries, parked leaves included.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.occupied()).count()
    }

    /// Reset every entry to non-present.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntryBits::new());
    }
}

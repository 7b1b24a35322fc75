//! # Address Space (x86-64, PML4-rooted)
//!
//! One translation tree rooted at a PML4 frame, with the operations the
//! memory manager builds on:
//!
//! - [`AddressSpace::map`] installs 4 KiB leaves for a page range, allocating
//!   missing tables. Nothing is changed if any page is already mapped; if a
//!   table allocation fails midway the call is rolled back.
//! - [`AddressSpace::unmap`] clears leaves, releases the frames they
//!   referenced, invalidates the TLB and frees tables left empty.
//! - [`AddressSpace::translate`] / [`AddressSpace::leaf`] walk without
//!   mutating.
//! - [`AddressSpace::new_sharing_kernel`] creates a space whose upper half
//!   aliases the kernel's.
//!
//! ## Ownership
//!
//! A frame installed as a leaf carries one reference owned by the table.
//! Leaves marked [`unmanaged`](PageEntryBits::unmanaged) carry none and are
//! never released. A leaf parked with [`no_access`](PageEntryBits::no_access)
//! is not present for the CPU but still owns its frame: unmap, prune and
//! destroy treat it like a present leaf, [`translate`](AddressSpace::translate)
//! does not. Table frames below user-half PML4 slots are owned by the
//! space; tables below kernel-half slots are shared by every space and are
//! only ever pruned below the PDPT level.
//!
//! ## Safety
//!
//! Table frames are reached through the [`PhysMapper`]. All mutation goes
//! through `&mut self`; callers serialize access to a space with its lock.

use crate::page_table::{PageTable, TableIndex, TableLevel};
use crate::{FrameAlloc, PageEntryBits, PhysMapper, TlbFlush, info};
use kernel_memory_addresses::{
    FrameRange, PAGE_SIZE, PhysicalAddress, PhysicalFrame, VirtualAddress, VirtualPage,
    VirtualRange, align_down,
};
use log::{trace, warn};

/// Handle to a single, concrete address space.
pub struct AddressSpace<M: PhysMapper> {
    /// PML4 frame
    root: PhysicalFrame,
    mapper: M,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmemError {
    #[error("out of memory while allocating a page table")]
    OutOfMemory,
    #[error("{0:?} is already mapped")]
    AlreadyMapped(VirtualPage),
    #[error("{0:?} is not mapped")]
    NotMapped(VirtualPage),
    #[error("{0:?} is not canonical")]
    NonCanonical(VirtualAddress),
    #[error("{pages} pages cannot be backed by {frames} frames")]
    SizeMismatch { pages: u64, frames: usize },
}

/// Result of walking towards the leaf of one address.
enum Walk {
    /// The PT was reached; `entry` may or may not be present.
    Leaf {
        table: PhysicalFrame,
        index: TableIndex,
        entry: PageEntryBits,
    },
    /// No table below `level` covers the address.
    Hole(TableLevel),
}

const KERNEL_SLOT: usize = info::KERNEL_PML4_FIRST_SLOT;

#[allow(clippy::cast_possible_truncation)]
impl<M: PhysMapper> AddressSpace<M> {
    /// Allocate an empty space (all 512 PML4 slots clear).
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`] if the root frame cannot be allocated.
    pub fn new<A: FrameAlloc>(mapper: M, alloc: &A) -> Result<Self, VmemError> {
        let root = alloc.alloc_4k().ok_or(VmemError::OutOfMemory)?;
        // SAFETY: freshly allocated, nothing references it yet.
        unsafe { mapper.zero_frame(root) };
        Ok(Self { root, mapper })
    }

    /// Physical frame of the PML4.
    #[inline]
    pub const fn root(&self) -> PhysicalFrame {
        self.root
    }

    #[inline]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Load CR3 with this address space's root.
    ///
    /// # Safety
    /// The kernel half must be present and the current stack and code must be
    /// mapped in this space.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    #[inline]
    pub unsafe fn activate(&self) {
        let cr3 = self.root.base().as_u64();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }

    /// Create a user space whose PML4 slots `256..512` alias this space's.
    ///
    /// Only slots that are present at this point are shared, which is why the
    /// kernel space populates every kernel-half slot it will ever use at boot
    /// (see [`ensure_kernel_slots`](Self::ensure_kernel_slots)).
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`] if the root cannot be allocated.
    pub fn new_sharing_kernel<A: FrameAlloc>(&self, alloc: &A) -> Result<Self, VmemError>
    where
        M: Clone,
    {
        let space = Self::new(self.mapper.clone(), alloc)?;
        for i in KERNEL_SLOT..512 {
            let i = TableIndex::new(i as u16);
            let e = self.read(self.root, i);
            if e.present() {
                space.write(space.root, i, e);
            }
        }
        Ok(space)
    }

    /// Allocate an empty PDPT for every kernel-half PML4 slot in `range` that
    /// has none yet. Returns the number of tables created.
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`]; tables created before the failure stay.
    pub fn ensure_kernel_slots<A: FrameAlloc>(
        &mut self,
        alloc: &A,
        range: VirtualRange,
    ) -> Result<usize, VmemError> {
        check_canonical(range)?;
        if range.is_empty() {
            return Ok(0);
        }
        let first = TableIndex::of(range.start(), TableLevel::L4).as_usize();
        let last = TableIndex::of(last_byte(range), TableLevel::L4).as_usize();
        let mut created = 0;
        for i in first.max(KERNEL_SLOT)..=last {
            let i = TableIndex::new(i as u16);
            if !self.read(self.root, i).present() {
                let table = self.new_table(alloc)?;
                self.write(self.root, i, PageEntryBits::table(false).with_frame(table));
                created += 1;
            }
        }
        Ok(created)
    }

    /// `true` if the PML4 slot covering `va` is present.
    #[must_use]
    pub fn has_top_level(&self, va: VirtualAddress) -> bool {
        self.read(self.root, TableIndex::of(va, TableLevel::L4))
            .present()
    }

    /// Map `range` page by page onto `frames` with leaf flags `bits`.
    ///
    /// On success every leaf takes over the caller's reference to its frame.
    ///
    /// # Errors
    /// - [`VmemError::NonCanonical`] / [`VmemError::SizeMismatch`] on bad
    ///   arguments.
    /// - [`VmemError::AlreadyMapped`] if any page is present; checked before
    ///   anything is modified.
    /// - [`VmemError::OutOfMemory`] if a table cannot be allocated; leaves
    ///   installed by this call are cleared (without releasing the caller's
    ///   frames) and tables created by it are freed.
    pub fn map<A: FrameAlloc>(
        &mut self,
        alloc: &A,
        range: VirtualRange,
        frames: FrameRange,
        bits: PageEntryBits,
    ) -> Result<(), VmemError> {
        check_canonical(range)?;
        if range.page_count() != frames.count() as u64 {
            return Err(VmemError::SizeMismatch {
                pages: range.page_count(),
                frames: frames.count(),
            });
        }
        if let Some(page) = self.first_mapped(range) {
            return Err(VmemError::AlreadyMapped(page));
        }

        for (page, frame) in range.pages().zip(frames.iter()) {
            if let Err(e) = self.install(alloc, page, frame, bits) {
                warn!("map {range:?} failed at {page:?}: {e}; rolling back");
                self.rollback(alloc, range, page);
                return Err(e);
            }
        }
        trace!("mapped {range:?} -> {frames:?}");
        Ok(())
    }

    /// Map a single page. Same contract as [`map`](Self::map).
    ///
    /// # Errors
    /// See [`map`](Self::map).
    pub fn map_page<A: FrameAlloc>(
        &mut self,
        alloc: &A,
        page: VirtualPage,
        frame: PhysicalFrame,
        bits: PageEntryBits,
    ) -> Result<(), VmemError> {
        let va = page.base();
        if !va.is_canonical() {
            return Err(VmemError::NonCanonical(va));
        }
        if self.is_occupied(page) {
            return Err(VmemError::AlreadyMapped(page));
        }
        self.install(alloc, page, frame, bits).inspect_err(|_| {
            let mut freed = 0;
            let lo = va.as_u64();
            self.prune_level(alloc, self.root, TableLevel::L4, lo, lo + (PAGE_SIZE - 1), &mut freed);
        })
    }

    /// Clear every occupied leaf in `range`, release managed frames and
    /// invalidate their translations. Absent pages are skipped.
    ///
    /// Returns the number of leaves cleared.
    ///
    /// # Errors
    /// [`VmemError::NonCanonical`] if `range` is not canonical.
    pub fn unmap<A: FrameAlloc, T: TlbFlush>(
        &mut self,
        alloc: &A,
        tlb: &T,
        range: VirtualRange,
    ) -> Result<usize, VmemError> {
        check_canonical(range)?;
        let mut cleared = 0;
        self.scan(range, |space, page, table, index, entry| {
            if entry.occupied() {
                space.write(table, index, PageEntryBits::new());
                tlb.flush_page(page);
                if !entry.unmanaged() {
                    alloc.release_4k(entry.frame());
                }
                cleared += 1;
            }
        });
        self.prune_tables(alloc, range);
        trace!("unmapped {cleared} pages in {range:?}");
        Ok(cleared)
    }

    /// Translate a virtual address to the physical address it maps to.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let leaf = self.leaf(va.page())?;
        Some(leaf.frame().join(va.page_offset()))
    }

    /// The present leaf entry for `page`, if any.
    #[must_use]
    pub fn leaf(&self, page: VirtualPage) -> Option<PageEntryBits> {
        match self.walk(page.base()) {
            Walk::Leaf { entry, .. } if entry.present() => Some(entry),
            _ => None,
        }
    }

    /// `true` if a leaf, present or parked, owns a frame at `page`.
    #[must_use]
    pub fn is_occupied(&self, page: VirtualPage) -> bool {
        matches!(self.walk(page.base()), Walk::Leaf { entry, .. } if entry.occupied())
    }

    /// Replace the occupied leaf for `page` with `bits` (address included)
    /// and invalidate its translation. Returns the previous entry.
    ///
    /// Reference counts are not touched; the caller accounts for a frame
    /// change.
    ///
    /// # Errors
    /// [`VmemError::NotMapped`] if no leaf occupies `page`.
    pub fn update_leaf<T: TlbFlush>(
        &mut self,
        page: VirtualPage,
        bits: PageEntryBits,
        tlb: &T,
    ) -> Result<PageEntryBits, VmemError> {
        match self.walk(page.base()) {
            Walk::Leaf {
                table,
                index,
                entry,
            } if entry.occupied() => {
                self.write(table, index, bits);
                tlb.flush_page(page);
                Ok(entry)
            }
            _ => Err(VmemError::NotMapped(page)),
        }
    }

    /// Visit every occupied leaf in `range` in address order.
    pub fn for_each_leaf(&self, range: VirtualRange, mut f: impl FnMut(VirtualPage, PageEntryBits)) {
        self.scan(range, |_, page, _, _, entry| {
            if entry.occupied() {
                f(page, entry);
            }
        });
    }

    /// Visit every occupied leaf in `range`; when `f` returns `Some(bits)`
    /// the leaf is replaced and its translation invalidated.
    ///
    /// # Errors
    /// Stops at and returns the first error from `f`; leaves already
    /// rewritten stay rewritten.
    pub fn try_for_each_leaf_mut<T: TlbFlush, E>(
        &mut self,
        range: VirtualRange,
        tlb: &T,
        mut f: impl FnMut(VirtualPage, PageEntryBits) -> Result<Option<PageEntryBits>, E>,
    ) -> Result<(), E> {
        let mut result = Ok(());
        self.scan(range, |space, page, table, index, entry| {
            if result.is_err() || !entry.occupied() {
                return;
            }
            match f(page, entry) {
                Ok(Some(bits)) => {
                    space.write(table, index, bits);
                    tlb.flush_page(page);
                }
                Ok(None) => {}
                Err(e) => result = Err(e),
            }
        });
        result
    }

    /// Free tables overlapping `range` that contain no present entry.
    ///
    /// PDPTs below kernel-half PML4 slots are shared and never freed.
    /// Returns the number of tables freed.
    pub fn prune_tables<A: FrameAlloc>(&mut self, alloc: &A, range: VirtualRange) -> usize {
        if range.is_empty() || check_canonical(range).is_err() {
            return 0;
        }
        let lo = range.start().as_u64();
        let hi = last_byte(range).as_u64();
        let mut freed = 0;
        self.prune_level(alloc, self.root, TableLevel::L4, lo, hi, &mut freed);
        freed
    }

    /// Tear down the user half: release every managed leaf, free every
    /// user-half table and finally the root.
    ///
    /// The space must not be active on any core.
    pub fn destroy<A: FrameAlloc>(self, alloc: &A) {
        for i in 0..KERNEL_SLOT {
            let i = TableIndex::new(i as u16);
            let e = self.read(self.root, i);
            if e.present() {
                self.free_subtree(alloc, e.frame(), TableLevel::L3);
            }
        }
        alloc.release_4k(self.root);
        trace!("destroyed address space {:?}", self.root);
    }

    fn install<A: FrameAlloc>(
        &self,
        alloc: &A,
        page: VirtualPage,
        frame: PhysicalFrame,
        bits: PageEntryBits,
    ) -> Result<(), VmemError> {
        let va = page.base();
        let user = is_user(va);
        let mut table = self.root;
        let mut level = TableLevel::L4;
        while let Some(lower) = level.next_lower() {
            let index = TableIndex::of(va, level);
            let e = self.read(table, index);
            table = if e.present() {
                e.frame()
            } else {
                let next = self.new_table(alloc)?;
                self.write(table, index, PageEntryBits::table(user).with_frame(next));
                next
            };
            level = lower;
        }
        self.write(table, TableIndex::of(va, TableLevel::L1), bits.with_frame(frame));
        Ok(())
    }

    /// Undo a partial [`map`](Self::map) that failed at `failed`.
    fn rollback<A: FrameAlloc>(&self, alloc: &A, range: VirtualRange, failed: VirtualPage) {
        let done = VirtualRange::new(range.start(), failed.base()).unwrap_or(range);
        self.scan(done, |space, _, table, index, entry| {
            if entry.occupied() {
                space.write(table, index, PageEntryBits::new());
            }
        });
        let mut freed = 0;
        let lo = range.start().as_u64();
        let hi = last_byte(range).as_u64();
        self.prune_level(alloc, self.root, TableLevel::L4, lo, hi, &mut freed);
    }

    fn first_mapped(&self, range: VirtualRange) -> Option<VirtualPage> {
        let mut found = None;
        self.scan(range, |_, page, _, _, entry| {
            if found.is_none() && entry.occupied() {
                found = Some(page);
            }
        });
        found
    }

    fn new_table<A: FrameAlloc>(&self, alloc: &A) -> Result<PhysicalFrame, VmemError> {
        let frame = alloc.alloc_4k().ok_or(VmemError::OutOfMemory)?;
        // SAFETY: freshly allocated and not yet linked.
        unsafe { self.mapper.zero_frame(frame) };
        Ok(frame)
    }

    fn walk(&self, va: VirtualAddress) -> Walk {
        let mut table = self.root;
        let mut level = TableLevel::L4;
        loop {
            let index = TableIndex::of(va, level);
            let entry = self.read(table, index);
            let Some(lower) = level.next_lower() else {
                return Walk::Leaf {
                    table,
                    index,
                    entry,
                };
            };
            if !entry.present() || entry.large_page() {
                return Walk::Hole(level);
            }
            table = entry.frame();
            level = lower;
        }
    }

    /// Call `f` for every PT slot in `range` that has a page table, skipping
    /// whole spans whose tables are missing.
    fn scan(
        &self,
        range: VirtualRange,
        mut f: impl FnMut(&Self, VirtualPage, PhysicalFrame, TableIndex, PageEntryBits),
    ) {
        let end = range.end().as_u64();
        let mut va = range.start().as_u64();
        while va < end {
            let step = match self.walk(VirtualAddress::new(va)) {
                Walk::Leaf {
                    table,
                    index,
                    entry,
                } => {
                    f(self, VirtualPage::from_base(VirtualAddress::new(va)), table, index, entry);
                    PAGE_SIZE
                }
                Walk::Hole(level) => {
                    let span = level.entry_span();
                    align_down(va, span).wrapping_add(span).wrapping_sub(va)
                }
            };
            match va.checked_add(step) {
                Some(next) => va = next,
                None => break,
            }
        }
    }

    /// Prune below `table` (at `level`) for the inclusive byte range
    /// `lo..=hi`. Returns `true` if `table` is empty afterwards.
    fn prune_level<A: FrameAlloc>(
        &self,
        alloc: &A,
        table: PhysicalFrame,
        level: TableLevel,
        lo: u64,
        hi: u64,
        freed: &mut usize,
    ) -> bool {
        let Some(lower) = level.next_lower() else {
            return self.table(table).is_empty();
        };
        let span = level.entry_span();
        let first = TableIndex::of(VirtualAddress::new(lo), level).as_usize();
        let last = TableIndex::of(VirtualAddress::new(hi), level).as_usize();
        for i in first..=last {
            let index = TableIndex::new(i as u16);
            let e = self.read(table, index);
            if !e.present() || e.large_page() {
                continue;
            }
            let base = align_down(lo, span * 512) | ((i as u64) << level.shift());
            let child_lo = lo.max(base);
            let child_hi = hi.min(base + (span - 1));
            let empty = self.prune_level(alloc, e.frame(), lower, child_lo, child_hi, freed);
            // PDPTs below kernel slots are shared; keep them
            if empty && !(level == TableLevel::L4 && i >= KERNEL_SLOT) {
                self.write(table, index, PageEntryBits::new());
                alloc.release_4k(e.frame());
                *freed += 1;
            }
        }
        self.table(table).is_empty()
    }

    fn free_subtree<A: FrameAlloc>(&self, alloc: &A, table: PhysicalFrame, level: TableLevel) {
        for i in 0..512u16 {
            let e = self.read(table, TableIndex::new(i));
            if !e.occupied() {
                continue;
            }
            match level.next_lower() {
                Some(lower) if !e.large_page() => self.free_subtree(alloc, e.frame(), lower),
                _ if !e.unmanaged() => alloc.release_4k(e.frame()),
                _ => {}
            }
        }
        alloc.release_4k(table);
    }

    #[allow(clippy::mut_from_ref)]
    #[inline]
    fn table(&self, frame: PhysicalFrame) -> &mut PageTable {
        // SAFETY: `frame` is a page table of this space (or the shared kernel
        // half); callers keep the reference short-lived and never hold two to
        // the same table.
        unsafe { self.mapper.phys_to_mut::<PageTable>(frame.base()) }
    }

    #[inline]
    fn read(&self, table: PhysicalFrame, i: TableIndex) -> PageEntryBits {
        self.table(table).get(i)
    }

    #[inline]
    fn write(&self, table: PhysicalFrame, i: TableIndex, e: PageEntryBits) {
        self.table(table).set(i, e);
    }
}

impl<M: PhysMapper> core::fmt::Debug for AddressSpace<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

#[inline]
const fn is_user(va: VirtualAddress) -> bool {
    va.as_u64() < info::USERSPACE_END
}

#[inline]
const fn last_byte(range: VirtualRange) -> VirtualAddress {
    VirtualAddress::new(range.end().as_u64() - 1)
}

/// Both ends canonical and on the same side of the hole.
fn check_canonical(range: VirtualRange) -> Result<(), VmemError> {
    if range.is_empty() {
        return Ok(());
    }
    let first = range.start();
    let last = last_byte(range);
    if !first.is_canonical() {
        Err(VmemError::NonCanonical(first))
    } else if !last.is_canonical() || is_user(first) != is_user(last) {
        Err(VmemError::NonCanonical(last))
    } else {
        Ok(())
    }
}

//! # Virtual Memory Areas
//!
//! Each user address space describes its mappings as a list of [`Vma`]s:
//! page-aligned, non-overlapping `[start, end)` ranges with uniform
//! permissions and backing, kept sorted by start address in a `Vec`.
//!
//! The list, not the page tables, is the authority on what a process may
//! touch. Page tables are filled lazily by the fault handler.
//!
//! ```text
//! 0x1000_0000          0x1000_4000  0x1000_8000            0x7fff_f000
//!     | anon rw        |            | file r-x @0x2000 |    | stack rw ↓ |
//! ```

use crate::fault::AccessKind;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use kernel_info::memory::{STACK_GROWTH_WINDOW, STACK_MAX_SIZE, USERSPACE_END};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, VirtualPage, VirtualRange, align_down};
use log::{debug, trace};

/// Permissions and behavior of a [`Vma`].
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct VmaFlags {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    /// Writes are visible to every space mapping the same frames; fork
    /// shares instead of copying.
    pub shared: bool,
    /// Stack-like: a fault just below the start extends the area.
    pub grows_down: bool,
    #[bits(11)]
    __: u16,
}

impl VmaFlags {
    /// Read + write, private.
    #[must_use]
    pub const fn rw() -> Self {
        Self::new().with_read(true).with_write(true)
    }

    /// Read + execute, private.
    #[must_use]
    pub const fn rx() -> Self {
        Self::new().with_read(true).with_exec(true)
    }

    /// Read only, private.
    #[must_use]
    pub const fn ro() -> Self {
        Self::new().with_read(true)
    }

    /// `true` if an access of this kind is allowed.
    #[must_use]
    pub const fn permits(self, access: AccessKind) -> bool {
        match access {
            AccessKind::Read => self.read(),
            AccessKind::Write => self.write(),
            AccessKind::Execute => self.exec(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackingError {
    #[error("read beyond the end of the backing object")]
    OutOfBounds,
    #[error("I/O error reading the backing object")]
    Io,
}

/// Content source for file-backed areas; implemented by the VFS.
pub trait BackingFile: Send + Sync + core::fmt::Debug {
    /// Fill `page` with the bytes at `offset`; returns how many bytes were
    /// read. Bytes past the end of the object stay zero.
    ///
    /// # Errors
    /// Whatever the underlying object reports.
    fn read_page(&self, offset: u64, page: &mut [u8]) -> Result<usize, BackingError>;
}

/// What a [`Vma`]'s pages are filled from on first touch.
#[derive(Clone, Debug)]
pub enum Backing {
    /// Zero-filled memory.
    Anonymous,
    /// File content; `offset` is the file position of the area's start.
    File {
        file: Arc<dyn BackingFile>,
        offset: u64,
    },
}

impl Backing {
    /// Same backing, advanced by `delta` bytes.
    #[must_use]
    fn advanced(&self, delta: u64) -> Self {
        match self {
            Self::Anonymous => Self::Anonymous,
            Self::File { file, offset } => Self::File {
                file: Arc::clone(file),
                offset: offset + delta,
            },
        }
    }

    /// `true` if an area backed by `self` of `len` bytes can be followed
    /// seamlessly by one backed by `next`.
    fn continues_into(&self, len: u64, next: &Self) -> bool {
        match (self, next) {
            (Self::Anonymous, Self::Anonymous) => true,
            (Self::File { file: a, offset: oa }, Self::File { file: b, offset: ob }) => {
                Arc::ptr_eq(a, b) && oa + len == *ob
            }
            _ => false,
        }
    }
}

/// One contiguous mapped region.
#[derive(Clone, Debug)]
pub struct Vma {
    range: VirtualRange,
    flags: VmaFlags,
    backing: Backing,
}

impl Vma {
    #[must_use]
    pub const fn new(range: VirtualRange, flags: VmaFlags, backing: Backing) -> Self {
        Self {
            range,
            flags,
            backing,
        }
    }

    #[must_use]
    pub const fn range(&self) -> VirtualRange {
        self.range
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.range.start()
    }

    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.range.end()
    }

    #[must_use]
    pub const fn flags(&self) -> VmaFlags {
        self.flags
    }

    #[must_use]
    pub const fn backing(&self) -> &Backing {
        &self.backing
    }

    /// File and file offset backing `page`, if file-backed.
    #[must_use]
    pub fn file_page(&self, page: VirtualPage) -> Option<(&Arc<dyn BackingFile>, u64)> {
        match &self.backing {
            Backing::Anonymous => None,
            Backing::File { file, offset } => {
                Some((file, offset + (page.base().as_u64() - self.start().as_u64())))
            }
        }
    }

    /// The part of `self` inside `range`, with the backing offset adjusted.
    fn slice(&self, range: VirtualRange) -> Option<Self> {
        let part = self.range.intersection(&range)?;
        let delta = part.start().as_u64() - self.start().as_u64();
        Some(Self {
            range: part,
            flags: self.flags,
            backing: self.backing.advanced(delta),
        })
    }

    fn merges_with(&self, next: &Self) -> bool {
        self.end() == next.start()
            && self.flags == next.flags
            && self.backing.continues_into(self.range.len(), &next.backing)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmaError {
    #[error("{0:?} overlaps an existing area")]
    Overlap(VirtualRange),
    #[error("{0:?} is empty")]
    EmptyRange(VirtualRange),
    #[error("{0:?} is not inside user space")]
    OutsideUserSpace(VirtualRange),
    #[error("{0:?} is not fully covered by areas")]
    NotCovered(VirtualRange),
    #[error("no free gap of {0:#x} bytes")]
    NoGap(u64),
    #[error("no grows-down area can be extended to {0:?}")]
    NotGrowable(VirtualAddress),
}

/// Ordered, non-overlapping list of areas for one address space.
#[derive(Clone, Debug, Default)]
pub struct VmaList {
    vmas: Vec<Vma>,
}

impl VmaList {
    #[must_use]
    pub const fn new() -> Self {
        Self { vmas: Vec::new() }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.vmas.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.vmas.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Vma> {
        self.vmas.iter()
    }

    /// Insert an area, merging it with identical neighbours.
    ///
    /// With `overwrite`, whatever overlaps `range` is removed first; without
    /// it an overlap is a caller bug.
    ///
    /// # Errors
    /// [`VmaError::EmptyRange`], [`VmaError::OutsideUserSpace`] and
    /// [`VmaError::Overlap`].
    pub fn insert(
        &mut self,
        range: VirtualRange,
        flags: VmaFlags,
        backing: Backing,
        overwrite: bool,
    ) -> Result<(), VmaError> {
        check_user(range)?;
        if overwrite {
            self.remove(range)?;
        } else if self.overlaps(range) {
            debug_assert!(false, "inserting {range:?} over an existing area");
            return Err(VmaError::Overlap(range));
        }

        let pos = self.vmas.partition_point(|v| v.start() < range.start());
        let vma = Vma::new(range, flags, backing);

        let merged_prev = pos > 0 && self.vmas[pos - 1].merges_with(&vma);
        let at = if merged_prev {
            let prev = &mut self.vmas[pos - 1];
            prev.range = prev.range.with_end(range.end());
            trace!("merged {range:?} into {:?}", prev.range);
            pos - 1
        } else {
            self.vmas.insert(pos, vma);
            pos
        };
        if at + 1 < self.vmas.len() && self.vmas[at].merges_with(&self.vmas[at + 1]) {
            let next = self.vmas.remove(at + 1);
            self.vmas[at].range = self.vmas[at].range.with_end(next.end());
            trace!("merged {:?} with its successor", self.vmas[at].range);
        }
        debug_assert!(self.check_invariants());
        Ok(())
    }

    /// Remove `range` from the list: areas inside it are deleted, areas
    /// overlapping one edge are truncated, an area containing it is split.
    ///
    /// Returns the removed pieces in address order.
    ///
    /// # Errors
    /// [`VmaError::OutsideUserSpace`].
    pub fn remove(&mut self, range: VirtualRange) -> Result<Vec<Vma>, VmaError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        check_user(range)?;
        let mut removed = Vec::new();
        let mut i = self.vmas.partition_point(|v| v.end() <= range.start());
        while i < self.vmas.len() && self.vmas[i].start() < range.end() {
            let vma = &self.vmas[i];
            if let Some(piece) = vma.slice(range) {
                removed.push(piece);
            }
            let keeps_head = vma.start() < range.start();
            let keeps_tail = vma.end() > range.end();
            match (keeps_head, keeps_tail) {
                (false, false) => {
                    self.vmas.remove(i);
                    continue;
                }
                (true, false) => {
                    let vma = &mut self.vmas[i];
                    vma.range = vma.range.with_end(range.start());
                }
                (false, true) => {
                    let vma = &mut self.vmas[i];
                    let delta = range.end().as_u64() - vma.start().as_u64();
                    vma.backing = vma.backing.advanced(delta);
                    vma.range = vma.range.with_start(range.end());
                }
                (true, true) => {
                    let tail_range = vma.range.with_start(range.end());
                    let tail = vma.slice(tail_range);
                    let vma = &mut self.vmas[i];
                    vma.range = vma.range.with_end(range.start());
                    if let Some(tail) = tail {
                        self.vmas.insert(i + 1, tail);
                    }
                    debug!("split area around {range:?}");
                    i += 1;
                }
            }
            i += 1;
        }
        debug_assert!(self.check_invariants());
        Ok(removed)
    }

    /// The area covering `addr`.
    #[must_use]
    pub fn find(&self, addr: VirtualAddress) -> Option<&Vma> {
        let i = self.vmas.partition_point(|v| v.end() <= addr);
        self.vmas.get(i).filter(|v| v.range().contains(addr))
    }

    /// `true` if `[addr, addr + len)` lies below the end of user space, does
    /// not wrap, and every byte is covered by areas permitting `access`.
    /// A zero length is always accepted.
    #[must_use]
    pub fn access_ok(&self, addr: VirtualAddress, len: u64, access: AccessKind) -> bool {
        if len == 0 {
            return true;
        }
        let Some(end) = addr.as_u64().checked_add(len) else {
            return false;
        };
        if end > USERSPACE_END {
            return false;
        }
        let mut cursor = addr.as_u64();
        let mut i = self.vmas.partition_point(|v| v.end().as_u64() <= cursor);
        while cursor < end {
            let Some(v) = self.vmas.get(i) else {
                return false;
            };
            if v.start().as_u64() > cursor || !v.flags().permits(access) {
                return false;
            }
            cursor = v.end().as_u64();
            i += 1;
        }
        true
    }

    /// `true` if any area intersects `range`.
    #[must_use]
    pub fn overlaps(&self, range: VirtualRange) -> bool {
        self.overlapping(range).next().is_some()
    }

    /// `true` if `range` is covered by consecutive areas without holes.
    #[must_use]
    pub fn covers(&self, range: VirtualRange) -> bool {
        let mut cursor = range.start();
        for v in self.overlapping(range) {
            if v.start() > cursor {
                return false;
            }
            cursor = v.end();
        }
        cursor >= range.end()
    }

    /// Lowest page-aligned start `>= floor` of a free gap of `len` bytes that
    /// ends at or below `ceiling`.
    ///
    /// # Errors
    /// [`VmaError::NoGap`].
    pub fn find_gap(&self, len: u64, floor: VirtualAddress, ceiling: VirtualAddress) -> Result<VirtualAddress, VmaError> {
        let len = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let mut candidate = floor.as_u64().div_ceil(PAGE_SIZE) * PAGE_SIZE;
        for v in &self.vmas {
            if v.end().as_u64() <= candidate {
                continue;
            }
            if candidate.checked_add(len).is_some_and(|e| e <= v.start().as_u64()) {
                break;
            }
            candidate = v.end().as_u64();
        }
        match candidate.checked_add(len) {
            Some(end) if end <= ceiling.as_u64() && len > 0 => Ok(VirtualAddress::new(candidate)),
            _ => Err(VmaError::NoGap(len)),
        }
    }

    /// Change the flags of every area inside `range`, splitting at the edges.
    ///
    /// # Errors
    /// [`VmaError::NotCovered`] if `range` has holes; nothing is changed.
    pub fn protect(&mut self, range: VirtualRange, flags: VmaFlags) -> Result<(), VmaError> {
        check_user(range)?;
        if !self.covers(range) {
            return Err(VmaError::NotCovered(range));
        }
        for piece in self.remove(range)? {
            self.insert(piece.range, flags, piece.backing, false)?;
        }
        Ok(())
    }

    /// Extend the grows-down area just above `addr` so it covers `addr`.
    ///
    /// The new start may lie at most [`STACK_GROWTH_WINDOW`] below the old
    /// one, the area may not exceed [`STACK_MAX_SIZE`] or run into the area
    /// below. Only anonymous areas grow; a file offset cannot follow the
    /// start downwards.
    ///
    /// # Errors
    /// [`VmaError::NotGrowable`].
    pub fn grow_down(&mut self, addr: VirtualAddress) -> Result<&Vma, VmaError> {
        let err = VmaError::NotGrowable(addr);
        let i = self.vmas.partition_point(|v| v.end() <= addr);
        let Some(v) = self.vmas.get(i) else {
            return Err(err);
        };
        let new_start = align_down(addr.as_u64(), PAGE_SIZE);
        if !v.flags().grows_down()
            || !matches!(v.backing(), Backing::Anonymous)
            || v.start() <= addr
            || v.start().as_u64() - new_start > STACK_GROWTH_WINDOW
            || v.end().as_u64() - new_start > STACK_MAX_SIZE
        {
            return Err(err);
        }
        if i > 0 && self.vmas[i - 1].end().as_u64() > new_start {
            return Err(err);
        }
        let vma = &mut self.vmas[i];
        vma.range = vma.range.with_start(VirtualAddress::new(new_start));
        debug!("grew stack area down to {:?}", vma.range);
        Ok(&self.vmas[i])
    }

    /// Remove every area.
    pub fn clear(&mut self) -> Vec<Vma> {
        core::mem::take(&mut self.vmas)
    }

    /// Sorted, non-empty and non-overlapping.
    #[must_use]
    pub fn check_invariants(&self) -> bool {
        self.vmas.iter().all(|v| !v.range().is_empty())
            && self.vmas.windows(2).all(|w| w[0].end() <= w[1].start())
    }

    fn overlapping(&self, range: VirtualRange) -> impl Iterator<Item = &Vma> {
        let i = self.vmas.partition_point(|v| v.end() <= range.start());
        self.vmas[i..]
            .iter()
            .take_while(move |v| v.start() < range.end())
    }
}

fn check_user(range: VirtualRange) -> Result<(), VmaError> {
    if range.is_empty() {
        return Err(VmaError::EmptyRange(range));
    }
    if range.end().as_u64() > USERSPACE_END {
        return Err(VmaError::OutsideUserSpace(range));
    }
    Ok(())
}

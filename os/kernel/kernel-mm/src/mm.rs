//! # Process Address Spaces
//!
//! An [`Mm`] ties an [`AddressSpace`] (page tables) to the [`VmaList`]
//! describing what the process may touch, plus a mapped-page counter and the
//! optional program break. Everything sits behind one [`SpinLock`].
//!
//! Mappings are lazy: [`Mm::map`] only records an area, and the first access
//! faults the page in through [`Mm::handle_fault`].
//!
//! ## Fork and copy-on-write
//!
//! [`Mm::fork`] shares every present frame of private areas between parent
//! and child, demoting both leaves to read-only copy-on-write and bumping the
//! frame's refcount. A later write fault either copies the frame or, if the
//! other side already let go of it, makes the leaf writable in place.
//! Shared areas are populated in the parent first, then keep their leaves
//! unchanged in both spaces, so both sides always reach the same frames.
//!
//! ## Inaccessible areas
//!
//! A present x86 leaf is always readable. [`Mm::protect`] with no permission
//! at all therefore parks the leaves with
//! [`no_access`](PageEntryBits::no_access): not present, frame kept. Granting
//! access again turns them back into present leaves with the old contents.

use crate::fault::{AccessKind, FaultError, FaultResolution, PageFaultErrorCode};
use crate::frames::{FrameAllocator, FrameError};
use crate::vma::{Backing, Vma, VmaError, VmaFlags, VmaList};
use alloc::vec::Vec;
use kernel_info::memory::{USER_MMAP_BASE, USER_MMAP_MIN, USERSPACE_END};
use kernel_memory_addresses::{
    FrameRange, PAGE_SIZE, PhysicalAddress, PhysicalFrame, VirtualAddress, VirtualPage, VirtualRange,
    align_up,
};
use kernel_sync::SpinLock;
use kernel_vmem::{AddressSpace, FrameAlloc, PageEntryBits, PhysMapper, TlbFlush, VmemError};
use log::{debug, error, trace, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MmError {
    #[error(transparent)]
    Vma(#[from] VmaError),
    #[error(transparent)]
    Vmem(#[from] VmemError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Fault(#[from] FaultError),
    #[error("{0:?} is not page aligned")]
    Misaligned(VirtualAddress),
    #[error("invalid length {0:#x}")]
    InvalidLength(u64),
    #[error("{0:?} is not in the kernel half or has no top-level table")]
    NotKernelRange(VirtualRange),
    #[error("the program break is not set up")]
    NoBreak,
    #[error("memory management is not initialized")]
    Uninitialized,
}

/// Where [`Mm::map`] places a new area.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Lowest free gap at or above [`USER_MMAP_BASE`].
    Anywhere,
    /// Exactly at `addr`. With `replace`, existing mappings in the way are
    /// dropped; without it they make the call fail.
    Fixed { addr: VirtualAddress, replace: bool },
}

#[derive(Debug, Copy, Clone)]
struct Break {
    start: VirtualAddress,
    current: VirtualAddress,
}

struct MmInner<M: PhysMapper> {
    space: AddressSpace<M>,
    vmas: VmaList,
    mapped_pages: u64,
    brk: Option<Break>,
}

/// A user address space.
pub struct Mm<M: PhysMapper + Clone> {
    inner: SpinLock<MmInner<M>>,
}

impl<M: PhysMapper + Clone> Mm<M> {
    /// Empty user space sharing the kernel half of `kernel`.
    ///
    /// # Errors
    /// [`MmError::Vmem`] if the root table cannot be allocated.
    pub fn new(kernel: &AddressSpace<M>, frames: &FrameAllocator) -> Result<Self, MmError> {
        let space = kernel.new_sharing_kernel(frames)?;
        debug!("new address space {:?}", space.root());
        Ok(Self::from_parts(space, VmaList::new(), 0, None))
    }

    const fn from_parts(space: AddressSpace<M>, vmas: VmaList, mapped_pages: u64, brk: Option<Break>) -> Self {
        Self {
            inner: SpinLock::new(MmInner {
                space,
                vmas,
                mapped_pages,
                brk,
            }),
        }
    }

    /// Root table of the space, for loading into CR3.
    #[must_use]
    pub fn root(&self) -> PhysicalFrame {
        self.inner.lock().space.root()
    }

    /// Leaves currently installed in the user half.
    #[must_use]
    pub fn mapped_pages(&self) -> u64 {
        self.inner.lock().mapped_pages
    }

    #[must_use]
    pub fn vma_count(&self) -> usize {
        self.inner.lock().vmas.len()
    }

    /// Run `f` with the area list locked.
    pub fn with_vmas<R>(&self, f: impl FnOnce(&VmaList) -> R) -> R {
        f(&self.inner.lock().vmas)
    }

    /// Record a new lazily populated area of `len` bytes (rounded up to
    /// pages) and return its start.
    ///
    /// # Errors
    /// - [`MmError::InvalidLength`] for zero or overflowing lengths.
    /// - [`MmError::Misaligned`] for an unaligned fixed address.
    /// - [`VmaError::Overlap`] for a fixed placement over existing areas
    ///   without `replace`, [`VmaError::NoGap`] if nothing fits.
    pub fn map<T: TlbFlush>(
        &self,
        frames: &FrameAllocator,
        tlb: &T,
        placement: Placement,
        len: u64,
        flags: VmaFlags,
        backing: Backing,
    ) -> Result<VirtualAddress, MmError> {
        let len = match align_up(len, PAGE_SIZE) {
            Some(len) if len > 0 => len,
            _ => return Err(MmError::InvalidLength(len)),
        };
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let (range, replace) = match placement {
            Placement::Anywhere => {
                let start = inner.vmas.find_gap(
                    len,
                    VirtualAddress::new(USER_MMAP_BASE),
                    VirtualAddress::new(USERSPACE_END),
                )?;
                (range_at(start, len)?, false)
            }
            Placement::Fixed { addr, replace } => {
                if !addr.is_page_aligned() {
                    return Err(MmError::Misaligned(addr));
                }
                let range = range_at(addr, len)?;
                if !replace && inner.vmas.overlaps(range) {
                    return Err(VmaError::Overlap(range).into());
                }
                (range, replace)
            }
        };
        if range.start().as_u64() < USER_MMAP_MIN || range.end().as_u64() > USERSPACE_END {
            return Err(VmaError::OutsideUserSpace(range).into());
        }
        if replace {
            inner.drop_leaves(frames, tlb, range)?;
        }
        inner.vmas.insert(range, flags, backing, replace)?;
        debug!("mapped area {range:?} {flags:?}");
        Ok(range.start())
    }

    /// Map caller-owned `frames` at `addr` right away, e.g. a buffer shared
    /// with a device. The mapping takes over the caller's references.
    ///
    /// # Errors
    /// Fails without side effects if the area overlaps an existing one or
    /// the page tables cannot be built.
    pub fn map_frames(
        &self,
        allocator: &FrameAllocator,
        addr: VirtualAddress,
        frames: FrameRange,
        flags: VmaFlags,
    ) -> Result<VirtualRange, MmError> {
        if !addr.is_page_aligned() {
            return Err(MmError::Misaligned(addr));
        }
        let range = range_at(addr, frames.len_bytes())?;
        let mut inner = self.inner.lock();
        if inner.vmas.overlaps(range) {
            return Err(VmaError::Overlap(range).into());
        }
        inner.vmas.insert(range, flags, Backing::Anonymous, false)?;
        if let Err(e) = inner.space.map(allocator, range, frames, leaf_bits(flags)) {
            inner.vmas.remove(range)?;
            return Err(e.into());
        }
        inner.mapped_pages += range.page_count();
        Ok(range)
    }

    /// Drop every area and leaf in `[addr, addr + len)`; frames whose last
    /// reference goes away return to the allocator. Returns the number of
    /// leaves cleared.
    ///
    /// # Errors
    /// [`MmError::Misaligned`] and range errors.
    pub fn unmap<T: TlbFlush>(
        &self,
        frames: &FrameAllocator,
        tlb: &T,
        addr: VirtualAddress,
        len: u64,
    ) -> Result<u64, MmError> {
        if !addr.is_page_aligned() {
            return Err(MmError::Misaligned(addr));
        }
        let range = VirtualRange::covering(addr, len).ok_or(MmError::InvalidLength(len))?;
        let mut inner = self.inner.lock();
        inner.vmas.remove(range)?;
        inner.drop_leaves(frames, tlb, range)
    }

    /// Change the permissions of `[addr, addr + len)`.
    ///
    /// Populated leaves are rewritten right away; copy-on-write leaves stay
    /// read-only until their next write fault. Revoking every permission
    /// parks the leaves, which keeps their frames and contents.
    ///
    /// # Errors
    /// [`VmaError::NotCovered`] if part of the range is unmapped.
    pub fn protect<T: TlbFlush>(
        &self,
        frames: &FrameAllocator,
        tlb: &T,
        addr: VirtualAddress,
        len: u64,
        flags: VmaFlags,
    ) -> Result<(), MmError> {
        if !addr.is_page_aligned() {
            return Err(MmError::Misaligned(addr));
        }
        let range = VirtualRange::covering(addr, len).ok_or(MmError::InvalidLength(len))?;
        let mut inner = self.inner.lock();
        inner.vmas.protect(range, flags)?;
        inner
            .space
            .try_for_each_leaf_mut(range, tlb, |_, e| {
                let cow = e.copy_on_write();
                let bits = leaf_bits(flags)
                    .with_writable(flags.write() && !cow)
                    .with_copy_on_write(cow)
                    .with_unmanaged(e.unmanaged())
                    .with_frame(e.frame());
                Ok::<_, MmError>((bits.permissions() != e.permissions()).then_some(bits))
            })?;
        trace!("protected {range:?} as {flags:?}");
        Ok(())
    }

    /// Set the start of the heap area grown by [`brk`](Self::brk).
    ///
    /// # Errors
    /// [`MmError::Misaligned`].
    pub fn init_brk(&self, start: VirtualAddress) -> Result<(), MmError> {
        if !start.is_page_aligned() {
            return Err(MmError::Misaligned(start));
        }
        self.inner.lock().brk = Some(Break {
            start,
            current: start,
        });
        Ok(())
    }

    /// Move the program break to `new`, or just report it for `None`.
    /// Growing adds a private read-write area; shrinking unmaps whole pages.
    ///
    /// # Errors
    /// [`MmError::NoBreak`] before [`init_brk`](Self::init_brk),
    /// [`VmaError::Overlap`] if the heap would run into another area.
    pub fn brk<T: TlbFlush>(
        &self,
        frames: &FrameAllocator,
        tlb: &T,
        new: Option<VirtualAddress>,
    ) -> Result<VirtualAddress, MmError> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let mut brk = inner.brk.ok_or(MmError::NoBreak)?;
        let Some(new) = new else {
            return Ok(brk.current);
        };
        if new < brk.start || new.as_u64() > USERSPACE_END {
            return Err(MmError::InvalidLength(new.as_u64()));
        }
        let page_end = |va: VirtualAddress| {
            VirtualAddress::new(align_up(va.as_u64(), PAGE_SIZE).unwrap_or(USERSPACE_END))
        };
        let (old_end, new_end) = (page_end(brk.current), page_end(new));
        if let Some(grow) = VirtualRange::new(old_end, new_end).filter(|r| !r.is_empty()) {
            if inner.vmas.overlaps(grow) {
                return Err(VmaError::Overlap(grow).into());
            }
            inner.vmas.insert(grow, VmaFlags::rw(), Backing::Anonymous, false)?;
        } else if let Some(shrink) = VirtualRange::new(new_end, old_end).filter(|r| !r.is_empty()) {
            inner.vmas.remove(shrink)?;
            inner.drop_leaves(frames, tlb, shrink)?;
        }
        brk.current = new;
        inner.brk = Some(brk);
        trace!("program break at {new:?}");
        Ok(new)
    }

    /// Duplicate this space for a child process.
    ///
    /// # Errors
    /// - [`MmError::Fault`] if a shared area cannot be populated; pages
    ///   populated so far stay in the parent.
    /// - [`MmError::Vmem`] if tables for the child run out; the child is torn
    ///   down and the parent keeps working (some leaves may stay
    ///   copy-on-write).
    pub fn fork<T: TlbFlush>(&self, frames: &FrameAllocator, tlb: &T) -> Result<Self, MmError> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        inner.populate_shared(frames)?;
        let mut child = inner.space.new_sharing_kernel(frames)?;
        let mut copied = 0;

        let mut result = Ok(());
        for vma in inner.vmas.iter() {
            let shared = vma.flags().shared();
            result = inner.space.try_for_each_leaf_mut(vma.range(), tlb, |page, e| {
                let bits = if shared || e.unmanaged() { e } else { e.into_cow() };
                if !e.unmanaged() {
                    frames.share_4k(e.frame());
                }
                if let Err(err) = child.map_page(frames, page, e.frame(), bits.permissions()) {
                    if !e.unmanaged() {
                        frames.release_4k(e.frame());
                    }
                    return Err(MmError::from(err));
                }
                copied += 1;
                Ok((bits != e).then_some(bits))
            });
            if result.is_err() {
                break;
            }
        }
        if let Err(e) = result {
            warn!("fork failed after {copied} pages: {e}");
            child.destroy(frames);
            return Err(e);
        }

        debug!(
            "forked {:?} into {:?}: {copied} pages shared",
            inner.space.root(),
            child.root()
        );
        Ok(Self::from_parts(
            child,
            inner.vmas.clone(),
            copied,
            inner.brk,
        ))
    }

    /// Physical address backing `va`, if a leaf is present.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.inner.lock().space.translate(va)
    }

    /// Whether the process may perform `access` on `[addr, addr + len)`.
    #[must_use]
    pub fn access_ok(&self, addr: VirtualAddress, len: u64, access: AccessKind) -> bool {
        self.inner.lock().vmas.access_ok(addr, len, access)
    }

    /// Resolve a page fault at `addr`.
    ///
    /// Classification, in order: reserved-bit faults and kernel-half
    /// addresses are fatal; an address outside every area is fatal unless it
    /// sits just below a grows-down area; the area must permit the access;
    /// a missing leaf is demand paged; a write to a copy-on-write leaf copies
    /// or reuses the frame; a leaf that already permits the access is
    /// spurious.
    ///
    /// # Errors
    /// See [`FaultError`]; all of them are fatal for the faulting task.
    pub fn handle_fault<T: TlbFlush>(
        &self,
        frames: &FrameAllocator,
        tlb: &T,
        addr: VirtualAddress,
        code: PageFaultErrorCode,
    ) -> Result<FaultResolution, FaultError> {
        if code.reserved_bit() {
            error!("{} at {addr:?}", code.explain());
            return Err(FaultError::ReservedBit(addr));
        }
        if addr.as_u64() >= USERSPACE_END {
            return Err(FaultError::KernelFault(addr));
        }
        let mut inner = self.inner.lock();
        inner.resolve(frames, tlb, addr, code.access())
    }

    /// Copy `src` into user memory at `dst`, faulting pages in as needed.
    ///
    /// # Errors
    /// [`FaultError::AccessDenied`] if the range is not writable user memory.
    pub fn copy_to_user<T: TlbFlush>(
        &self,
        frames: &FrameAllocator,
        tlb: &T,
        dst: VirtualAddress,
        src: &[u8],
    ) -> Result<(), FaultError> {
        let mut inner = self.inner.lock();
        inner.copy_user(frames, tlb, dst, src.len(), AccessKind::Write, |offset, ptr, n| unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr().add(offset), ptr, n);
        })
    }

    /// Copy user memory at `src` into `dst`, faulting pages in as needed.
    ///
    /// # Errors
    /// [`FaultError::AccessDenied`] if the range is not readable user memory.
    pub fn copy_from_user<T: TlbFlush>(
        &self,
        frames: &FrameAllocator,
        tlb: &T,
        dst: &mut [u8],
        src: VirtualAddress,
    ) -> Result<(), FaultError> {
        let mut inner = self.inner.lock();
        let len = dst.len();
        let out = dst.as_mut_ptr();
        inner.copy_user(frames, tlb, src, len, AccessKind::Read, |offset, ptr, n| unsafe {
            core::ptr::copy_nonoverlapping(ptr, out.add(offset), n);
        })
    }

    /// Tear the space down: every leaf is released, then every user-half
    /// table and the root. The space must not be active on any core.
    pub fn destroy(self, frames: &FrameAllocator) {
        let inner = self.inner.into_inner();
        debug!(
            "destroying {:?}: {} areas, {} pages",
            inner.space.root(),
            inner.vmas.len(),
            inner.mapped_pages
        );
        inner.space.destroy(frames);
    }
}

impl<M: PhysMapper + Clone> MmInner<M> {
    /// Fault in every missing page of the shared areas.
    fn populate_shared(&mut self, frames: &FrameAllocator) -> Result<(), FaultError> {
        let shared: Vec<Vma> = self
            .vmas
            .iter()
            .filter(|v| v.flags().shared())
            .cloned()
            .collect();
        let mut populated = 0;
        for vma in &shared {
            for page in vma.range().pages() {
                if !self.space.is_occupied(page) {
                    self.demand_page(frames, vma, page)?;
                    populated += 1;
                }
            }
        }
        if populated > 0 {
            debug!("populated {populated} shared pages before fork");
        }
        Ok(())
    }

    /// Clear every leaf in `range` and subtract them from the counter.
    fn drop_leaves<T: TlbFlush>(
        &mut self,
        frames: &FrameAllocator,
        tlb: &T,
        range: VirtualRange,
    ) -> Result<u64, MmError> {
        let cleared = self.space.unmap(frames, tlb, range)? as u64;
        self.mapped_pages = self.mapped_pages.saturating_sub(cleared);
        Ok(cleared)
    }

    fn resolve<T: TlbFlush>(
        &mut self,
        frames: &FrameAllocator,
        tlb: &T,
        addr: VirtualAddress,
        access: AccessKind,
    ) -> Result<FaultResolution, FaultError> {
        let vma = if let Some(vma) = self.vmas.find(addr) {
            vma.clone()
        } else {
            self.vmas
                .grow_down(addr)
                .map_err(|_| FaultError::NoMapping(addr))?
                .clone()
        };
        if !vma.flags().permits(access) {
            return Err(FaultError::AccessDenied { addr, access });
        }

        let page = addr.page();
        let resolution = match self.space.leaf(page) {
            None => self.demand_page(frames, &vma, page)?,
            Some(e) if access == AccessKind::Write && e.copy_on_write() => {
                self.break_cow(frames, tlb, page, e)?
            }
            Some(e) if leaf_permits(e, access) => FaultResolution::Spurious,
            Some(_) => return Err(FaultError::AccessDenied { addr, access }),
        };
        trace!("fault at {addr:?} ({access:?}): {resolution:?}");
        Ok(resolution)
    }

    fn demand_page(
        &mut self,
        frames: &FrameAllocator,
        vma: &Vma,
        page: VirtualPage,
    ) -> Result<FaultResolution, FaultError> {
        let frame = frames.alloc_4k().ok_or(FaultError::OutOfMemory)?;
        let mapper = self.space.mapper();
        // SAFETY: the frame was just allocated and nothing maps it yet.
        unsafe { mapper.zero_frame(frame) };
        if let Some((file, offset)) = vma.file_page(page) {
            // SAFETY: as above; the mapper maps the whole frame contiguously.
            let buf = unsafe {
                core::slice::from_raw_parts_mut(mapper.phys_to_ptr(frame.base()), PAGE_SIZE as usize)
            };
            if let Err(e) = file.read_page(offset, buf) {
                frames.release_4k(frame);
                return Err(e.into());
            }
        }
        self.space
            .map_page(frames, page, frame, leaf_bits(vma.flags()))
            .map_err(|e| {
                frames.release_4k(frame);
                match e {
                    VmemError::OutOfMemory => FaultError::OutOfMemory,
                    e => e.into(),
                }
            })?;
        self.mapped_pages += 1;
        Ok(FaultResolution::DemandPaged)
    }

    fn break_cow<T: TlbFlush>(
        &mut self,
        frames: &FrameAllocator,
        tlb: &T,
        page: VirtualPage,
        e: PageEntryBits,
    ) -> Result<FaultResolution, FaultError> {
        let old = e.frame();
        let writable = e.into_private_writable();
        if frames.refcount(old) == 1 {
            self.space.update_leaf(page, writable, tlb)?;
            return Ok(FaultResolution::Reused);
        }
        let new = frames.alloc_4k().ok_or(FaultError::OutOfMemory)?;
        // SAFETY: `new` is private to us; `old` is only read.
        unsafe { self.space.mapper().copy_frame(old, new) };
        if let Err(err) = self.space.update_leaf(page, writable.with_frame(new), tlb) {
            frames.release_4k(new);
            return Err(err.into());
        }
        frames.release_4k(old);
        Ok(FaultResolution::CopiedOnWrite)
    }

    /// Walk `[addr, addr + len)` page by page, resolving faults the way the
    /// CPU would, and hand each chunk's kernel pointer to `copy`.
    fn copy_user<T: TlbFlush>(
        &mut self,
        frames: &FrameAllocator,
        tlb: &T,
        addr: VirtualAddress,
        len: usize,
        access: AccessKind,
        mut copy: impl FnMut(usize, *mut u8, usize),
    ) -> Result<(), FaultError> {
        if !self.vmas.access_ok(addr, len as u64, access) {
            return Err(FaultError::AccessDenied { addr, access });
        }
        let mut done = 0;
        while done < len {
            let va = VirtualAddress::new(addr.as_u64() + done as u64);
            let n = (PAGE_SIZE - va.page_offset()).min((len - done) as u64) as usize;
            let ready = self
                .space
                .leaf(va.page())
                .is_some_and(|e| leaf_permits(e, access));
            if !ready {
                self.resolve(frames, tlb, va, access)?;
            }
            let pa = self
                .space
                .translate(va)
                .ok_or(FaultError::NoMapping(va))?;
            copy(done, self.space.mapper().phys_to_ptr(pa), n);
            done += n;
        }
        Ok(())
    }
}

/// Leaf bits for a freshly populated page of an area with `flags`; parked
/// if the area permits no access at all.
const fn leaf_bits(flags: VmaFlags) -> PageEntryBits {
    let bits = PageEntryBits::user(flags.write(), flags.exec());
    if flags.read() || flags.write() || flags.exec() {
        bits
    } else {
        bits.into_no_access()
    }
}

const fn leaf_permits(e: PageEntryBits, access: AccessKind) -> bool {
    match access {
        AccessKind::Read => true,
        AccessKind::Write => e.writable(),
        AccessKind::Execute => !e.no_execute(),
    }
}

fn range_at(start: VirtualAddress, len: u64) -> Result<VirtualRange, MmError> {
    start
        .checked_add(len)
        .and_then(|end| VirtualRange::new(start, end))
        .ok_or(MmError::InvalidLength(len))
}

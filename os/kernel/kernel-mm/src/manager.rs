//! # Memory Manager
//!
//! Boot bring-up and the kernel-wide entry points: one [`FrameAllocator`],
//! the kernel [`AddressSpace`], the [`KernelHeap`] and the TLB primitive,
//! owned together so every operation sees the same state.
//!
//! ## Bring-up order
//!
//! 1. Build the frame table over the boot memory map.
//! 2. Create the kernel address space and give every kernel-half PML4 slot
//!    the kernel will ever use (direct map, kernel image, vmap window) a
//!    PDPT, so user spaces created later share all of them.
//! 3. Map the direct map and the kernel image as unmanaged leaves.
//! 4. Carve the first heap arena out of the frame allocator.

use crate::fault::{AccessKind, FaultError, FaultResolution, PageFaultErrorCode};
use crate::frames::{FrameAllocator, FrameError, FrameStats};
use crate::heap::{AtomicHeap, HeapError, HeapStats, KernelHeap};
use crate::mm::{Mm, MmError};
use core::ptr::NonNull;
use kernel_info::boot::BootMemoryInfo;
use kernel_info::memory::{
    HHDM_BASE, KERNEL_BASE, KERNEL_SPACE_START, KERNEL_VMAP_BASE, KERNEL_VMAP_SIZE,
};
use kernel_memory_addresses::{
    FrameRange, PAGE_SIZE, PhysicalAddress, PhysicalFrame, VirtualAddress, VirtualPage,
    VirtualRange,
};
use kernel_sync::SpinLock;
use kernel_vmem::{AddressSpace, PageEntryBits, PhysMapper, TlbFlush, VmemError};
use log::{debug, info, trace, warn};

/// Runtime knobs for [`MemoryManager::init`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryConfig {
    /// Frames in the first heap arena; `0` leaves the heap empty until the
    /// first allocation grows it.
    pub initial_heap_pages: usize,
    /// Minimum number of frames added when the heap grows.
    pub heap_growth_pages: usize,
    /// Map every usable frame at [`HHDM_BASE`] in the kernel space.
    pub direct_map: bool,
    /// Map the kernel image at [`KERNEL_BASE`] in the kernel space.
    pub map_kernel_image: bool,
}

impl MemoryConfig {
    /// 1 MiB initial heap, growing by 256 KiB, everything mapped.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            initial_heap_pages: 256,
            heap_growth_pages: 64,
            direct_map: true,
            map_kernel_image: true,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootError {
    #[error("frame allocator: {0}")]
    Frames(#[from] FrameError),
    #[error("kernel address space: {0}")]
    KernelSpace(#[from] VmemError),
    #[error("kernel heap: {0}")]
    Heap(#[from] HeapError),
    #[error("no {pages} contiguous frames for the initial heap")]
    HeapExhausted { pages: usize },
    #[error("the memory manager is already initialized")]
    AlreadyInitialized,
}

/// The kernel's memory manager. See the [module docs](self).
pub struct MemoryManager<M: PhysMapper + Clone, T: TlbFlush> {
    frames: FrameAllocator,
    kernel: SpinLock<AddressSpace<M>>,
    heap: KernelHeap<M>,
    tlb: T,
    config: MemoryConfig,
}

impl<M: PhysMapper + Clone, T: TlbFlush> MemoryManager<M, T> {
    /// Bring up physical and virtual memory.
    ///
    /// # Errors
    /// Any failure is a [`BootError`]; nothing useful can run afterwards.
    ///
    /// # Safety
    /// Every usable frame in `boot` must be reachable through `mapper` and
    /// must not be in use by anything else. Must run once per set of RAM.
    pub unsafe fn init(
        boot: &BootMemoryInfo<'_>,
        mapper: M,
        tlb: T,
        config: MemoryConfig,
    ) -> Result<Self, BootError> {
        let frames = unsafe { FrameAllocator::init(boot, &mapper)? };
        let mut kernel = AddressSpace::new(mapper.clone(), &frames)?;

        let phys_end = boot.usable_end().map_or(0, PhysicalAddress::as_u64);
        let image = boot.kernel_image;
        let windows = [
            (HHDM_BASE, phys_end),
            (KERNEL_BASE, image.len()),
            (KERNEL_VMAP_BASE, KERNEL_VMAP_SIZE),
        ];
        let mut slots = 0;
        for (base, len) in windows {
            if let Some(range) = VirtualRange::covering(VirtualAddress::new(base), len) {
                slots += kernel.ensure_kernel_slots(&frames, range)?;
            }
        }
        debug!("kernel space {:?}: {slots} kernel-half slots", kernel.root());

        if config.direct_map {
            let pages = map_direct(&mut kernel, &frames, boot)?;
            info!("direct map: {pages} pages at {HHDM_BASE:#x}");
        }
        if config.map_kernel_image && !image.is_empty() {
            let frames_in_image = image.outer_frames();
            let first = PhysicalFrame::from_number(frames_in_image.start);
            let count = (frames_in_image.end - frames_in_image.start) as usize;
            let range = VirtualRange::from_pages(
                VirtualPage::containing(VirtualAddress::new(KERNEL_BASE)),
                count as u64,
            )
            .ok_or(BootError::KernelSpace(VmemError::NonCanonical(VirtualAddress::new(KERNEL_BASE))))?;
            kernel.map(
                &frames,
                range,
                FrameRange::new(first, count),
                PageEntryBits::kernel_code(true).with_unmanaged(true),
            )?;
            info!("kernel image: {count} pages at {KERNEL_BASE:#x}");
        }

        let heap = KernelHeap::new(mapper.clone(), config.heap_growth_pages);
        if config.initial_heap_pages > 0 {
            let pages = config.initial_heap_pages;
            let run = frames
                .alloc(pages)
                .ok_or(BootError::HeapExhausted { pages })?;
            let len = pages * PAGE_SIZE as usize;
            let start = mapper.phys_to_ptr(run.start().base());
            // SAFETY: freshly allocated run, contiguous through the mapper.
            unsafe { start.write_bytes(0, len) };
            let start = NonNull::new(start).ok_or(HeapError::NotHeapPointer)?;
            // SAFETY: the run belongs to the heap from now on.
            unsafe { heap.add_arena(start, len)? };
            info!("kernel heap: {pages} pages at {:?}", run.start());
        }

        let stats = frames.stats();
        info!(
            "memory up: {} frames usable, {} free",
            stats.usable, stats.free
        );
        Ok(Self {
            frames,
            kernel: SpinLock::new(kernel),
            heap,
            tlb,
            config,
        })
    }

    #[must_use]
    pub const fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    #[must_use]
    pub const fn heap(&self) -> &KernelHeap<M> {
        &self.heap
    }

    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    #[must_use]
    pub fn frame_stats(&self) -> FrameStats {
        self.frames.stats()
    }

    /// Root of the kernel address space.
    #[must_use]
    pub fn kernel_root(&self) -> PhysicalFrame {
        self.kernel.lock().root()
    }

    /// `n` contiguous frames with refcount 1.
    #[must_use]
    pub fn alloc_frames(&self, n: usize) -> Option<FrameRange> {
        self.frames.alloc(n)
    }

    /// # Errors
    /// [`MmError::Frame`] if a frame in the range is not allocated.
    pub fn free_frames(&self, range: FrameRange) -> Result<(), MmError> {
        Ok(self.frames.free(range)?)
    }

    /// Map `frames` at `va` in the kernel space. The mapping takes over the
    /// caller's frame references unless `bits` marks them unmanaged.
    ///
    /// # Errors
    /// [`MmError::NotKernelRange`] outside the pre-populated kernel-half
    /// slots, plus the errors of [`AddressSpace::map`].
    pub fn map_pages(
        &self,
        va: VirtualAddress,
        frames: FrameRange,
        bits: PageEntryBits,
    ) -> Result<VirtualRange, MmError> {
        if !va.is_page_aligned() {
            return Err(MmError::Misaligned(va));
        }
        let range = VirtualRange::from_pages(va.page(), frames.count() as u64)
            .ok_or(MmError::InvalidLength(frames.len_bytes()))?;
        let mut kernel = self.kernel.lock();
        check_kernel_range(&kernel, range)?;
        kernel.map(&self.frames, range, frames, bits)?;
        Ok(range)
    }

    /// Unmap `range` from the kernel space; returns the pages cleared.
    ///
    /// # Errors
    /// [`MmError::NotKernelRange`] outside the kernel half.
    pub fn unmap_pages(&self, range: VirtualRange) -> Result<usize, MmError> {
        let mut kernel = self.kernel.lock();
        check_kernel_range(&kernel, range)?;
        Ok(kernel.unmap(&self.frames, &self.tlb, range)?)
    }

    /// Physical address behind a kernel virtual address.
    #[must_use]
    pub fn get_physaddr(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.kernel.lock().translate(va)
    }

    #[must_use]
    pub fn kmalloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.heap.alloc(&self.frames, size)
    }

    /// `size` bytes aligned to `align` (a power of two up to a page).
    #[must_use]
    pub fn kmalloc_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        self.heap.alloc_aligned(&self.frames, size, align)
    }

    #[must_use]
    pub fn kzmalloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.heap.zalloc(&self.frames, size)
    }

    #[must_use]
    pub fn kcalloc(&self, n: usize, size: usize) -> Option<NonNull<u8>> {
        self.heap.calloc(&self.frames, n, size)
    }

    /// C-style resize: `None` allocates, a zero size frees and returns
    /// `None`. On failure the old block is left alone and `None` returned.
    ///
    /// # Safety
    /// `ptr` must come from this heap and must not be used after a
    /// successful call.
    pub unsafe fn krealloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.kmalloc(size);
        };
        if size == 0 {
            let freed = unsafe { self.kfree(Some(ptr)) };
            debug_assert!(freed.is_ok(), "krealloc({ptr:p}, 0): {freed:?}");
            return None;
        }
        match unsafe { self.heap.realloc(&self.frames, ptr, size) } {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("krealloc({ptr:p}, {size}): {e}");
                None
            }
        }
    }

    /// Free a heap block; `None` is a no-op.
    ///
    /// # Errors
    /// Double frees and foreign pointers are detected and reported.
    ///
    /// # Safety
    /// `ptr` must not be used afterwards.
    pub unsafe fn kfree(&self, ptr: Option<NonNull<u8>>) -> Result<(), HeapError> {
        match ptr {
            Some(ptr) => unsafe { self.heap.free(ptr) },
            None => Ok(()),
        }
    }

    /// # Errors
    /// As for [`KernelHeap::usable_size`].
    ///
    /// # Safety
    /// As for [`KernelHeap::usable_size`].
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        unsafe { self.heap.usable_size(ptr) }
    }

    /// Heap handle for interrupt context.
    #[must_use]
    pub const fn atomic_heap(&self) -> AtomicHeap<'_, M> {
        self.heap.atomic()
    }

    /// Pre-grow the heap so [`atomic_heap`](Self::atomic_heap) can serve a
    /// block of `bytes`.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`].
    pub fn reserve_atomic(&self, bytes: usize) -> Result<(), HeapError> {
        self.heap.reserve(&self.frames, bytes)
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Fresh user address space sharing the kernel half.
    ///
    /// # Errors
    /// [`MmError::Vmem`] if the root table cannot be allocated.
    pub fn new_mm(&self) -> Result<Mm<M>, MmError> {
        let kernel = self.kernel.lock();
        Mm::new(&kernel, &self.frames)
    }

    /// # Errors
    /// As for [`Mm::fork`].
    pub fn fork(&self, mm: &Mm<M>) -> Result<Mm<M>, MmError> {
        mm.fork(&self.frames, &self.tlb)
    }

    pub fn destroy_mm(&self, mm: Mm<M>) {
        mm.destroy(&self.frames);
    }

    /// Entry point for the `#PF` handler.
    ///
    /// # Errors
    /// Fatal faults; see [`FaultError`].
    pub fn page_fault(
        &self,
        mm: &Mm<M>,
        addr: VirtualAddress,
        code: PageFaultErrorCode,
    ) -> Result<FaultResolution, FaultError> {
        mm.handle_fault(&self.frames, &self.tlb, addr, code)
            .inspect_err(|e| warn!("unresolved page fault at {addr:?}: {e} ({})", code.explain()))
    }

    /// Whether `mm` may perform `access` on `[addr, addr + len)`, e.g.
    /// [`AccessKind::Write`] before a system call fills a user buffer.
    #[must_use]
    pub fn access_ok(&self, mm: &Mm<M>, addr: VirtualAddress, len: u64, access: AccessKind) -> bool {
        let ok = mm.access_ok(addr, len, access);
        if !ok {
            trace!("{access:?} access to {len:#x} bytes at {addr:?} refused");
        }
        ok
    }
}

/// Map every usable frame at `HHDM_BASE + pa`. Returns the pages mapped.
fn map_direct<M: PhysMapper>(
    kernel: &mut AddressSpace<M>,
    frames: &FrameAllocator,
    boot: &BootMemoryInfo<'_>,
) -> Result<u64, VmemError> {
    let bits = PageEntryBits::kernel_rw().with_unmanaged(true);
    let mut mapped = 0;
    for region in boot.regions.iter().filter(|r| r.is_usable()) {
        for n in region.range().outer_frames() {
            let frame = PhysicalFrame::from_number(n);
            let page = VirtualPage::containing(VirtualAddress::new(HHDM_BASE + frame.base().as_u64()));
            // regions may overlap
            if kernel.leaf(page).is_some() {
                continue;
            }
            kernel.map_page(frames, page, frame, bits)?;
            mapped += 1;
        }
    }
    Ok(mapped)
}

fn check_kernel_range<M: PhysMapper>(kernel: &AddressSpace<M>, range: VirtualRange) -> Result<(), MmError> {
    const SLOT_SHIFT: u32 = 39;
    let err = MmError::NotKernelRange(range);
    if range.is_empty() || range.start().as_u64() < KERNEL_SPACE_START {
        return Err(err);
    }
    let first = range.start().as_u64() >> SLOT_SHIFT;
    let last = (range.end().as_u64() - 1) >> SLOT_SHIFT;
    if (first..=last).all(|slot| kernel.has_top_level(VirtualAddress::new(slot << SLOT_SHIFT))) {
        Ok(())
    } else {
        Err(err)
    }
}

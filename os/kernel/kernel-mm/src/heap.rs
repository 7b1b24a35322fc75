//! # Kernel Heap
//!
//! General-purpose `kmalloc`-style allocator for kernel objects.
//!
//! The heap is a chain of *arenas*: physically contiguous runs of frames
//! from the [`FrameAllocator`], addressed through the direct map. Inside the
//! arenas a first-fit free list hands out 16-byte aligned blocks, each behind
//! a 16-byte header that records its size and whether it is in use.
//!
//! When no block fits, the general path grows the heap by another arena of
//! at least the configured growth step. Interrupt handlers must not do that
//! (growing takes the frame lock and may spin), so they go through an
//! [`AtomicHeap`], which only `try_lock`s and never grows;
//! [`KernelHeap::reserve`] pre-grows the heap for them.

mod free_list;

use crate::frames::FrameAllocator;
use core::ptr::NonNull;
use free_list::FreeList;
use kernel_memory_addresses::{PAGE_SIZE, pages_for};
use kernel_sync::SpinLock;
use kernel_vmem::PhysMapper;
use log::{debug, error, warn};

/// Alignment of every block payload.
pub const MIN_ALIGN: usize = free_list::ALIGN;

const BLOCK_HEADER: usize = free_list::HEADER;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("pointer does not belong to the heap")]
    NotHeapPointer,
    #[error("block is already free")]
    DoubleFree,
    #[error("block header is corrupt")]
    CorruptHeader,
    #[error("out of memory")]
    OutOfMemory,
    #[error("heap is busy")]
    Busy,
    #[error("size overflow")]
    Overflow,
}

/// Heap counters; see [`KernelHeap::stats`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HeapStats {
    /// Bytes of all arenas, headers included.
    pub arena_bytes: usize,
    /// Payload bytes of blocks in use.
    pub allocated_bytes: usize,
    /// Payload bytes of free blocks.
    pub free_bytes: usize,
    /// Payload bytes of the largest free block.
    pub largest_free: usize,
}

/// The kernel heap. See the [module docs](self).
pub struct KernelHeap<M: PhysMapper> {
    list: SpinLock<FreeList>,
    mapper: M,
    growth_pages: usize,
}

impl<M: PhysMapper> KernelHeap<M> {
    /// Empty heap growing by at least `growth_pages` frames at a time.
    #[must_use]
    pub const fn new(mapper: M, growth_pages: usize) -> Self {
        Self {
            list: SpinLock::new(FreeList::new()),
            mapper,
            growth_pages,
        }
    }

    /// Add `[start, start + len)` as an arena.
    ///
    /// # Errors
    /// [`HeapError::CorruptHeader`] if the region is misaligned or too small.
    ///
    /// # Safety
    /// The region must be mapped writable and owned by the heap forever.
    pub unsafe fn add_arena(&self, start: NonNull<u8>, len: usize) -> Result<(), HeapError> {
        let added = unsafe { self.list.lock_irq().add_arena(start.as_ptr() as usize, len) };
        if added {
            debug!("heap arena {start:p} ({len:#x} bytes)");
            Ok(())
        } else {
            error!("rejected heap arena {start:p} ({len:#x} bytes)");
            Err(HeapError::CorruptHeader)
        }
    }

    /// Allocate `size` bytes, growing the heap if needed.
    #[must_use]
    pub fn alloc(&self, frames: &FrameAllocator, size: usize) -> Option<NonNull<u8>> {
        self.alloc_aligned(frames, size, MIN_ALIGN)
    }

    /// Allocate `size` bytes aligned to `align`, which must be a power of two
    /// no larger than a page.
    #[must_use]
    pub fn alloc_aligned(&self, frames: &FrameAllocator, size: usize, align: usize) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() || align > PAGE_SIZE as usize {
            return None;
        }
        let mut list = self.list.lock_irq();
        if let Some(p) = list.alloc(size, align) {
            return Some(p);
        }
        let needed = size.checked_add(align + 4 * BLOCK_HEADER)?;
        if let Err(e) = self.grow(&mut list, frames, needed) {
            warn!("heap allocation of {size} bytes failed: {e}");
            return None;
        }
        list.alloc(size, align)
    }

    /// Allocate `size` zeroed bytes.
    #[must_use]
    pub fn zalloc(&self, frames: &FrameAllocator, size: usize) -> Option<NonNull<u8>> {
        let p = self.alloc(frames, size)?;
        // SAFETY: the block holds at least `size` bytes.
        unsafe { p.as_ptr().write_bytes(0, size) };
        Some(p)
    }

    /// Allocate `n * size` zeroed bytes; `None` if the product overflows.
    #[must_use]
    pub fn calloc(&self, frames: &FrameAllocator, n: usize, size: usize) -> Option<NonNull<u8>> {
        self.zalloc(frames, n.checked_mul(size)?)
    }

    /// Resize the block at `ptr` to `new_size` bytes, in place when possible,
    /// otherwise by moving the first `min(old, new)` bytes to a new block.
    ///
    /// # Errors
    /// Invalid pointers are rejected; on [`HeapError::OutOfMemory`] the old
    /// block is left untouched.
    ///
    /// # Safety
    /// `ptr` must not be used after a successful call.
    pub unsafe fn realloc(
        &self,
        frames: &FrameAllocator,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        let old_size = {
            let mut list = self.list.lock_irq();
            if unsafe { list.resize_in_place(ptr, new_size)? } {
                return Ok(ptr);
            }
            unsafe { list.usable_size(ptr)? }
        };
        let new = self.alloc(frames, new_size).ok_or(HeapError::OutOfMemory)?;
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), old_size.min(new_size));
            self.free(ptr)?;
        }
        Ok(new)
    }

    /// Return a block.
    ///
    /// # Errors
    /// [`HeapError::DoubleFree`], [`HeapError::NotHeapPointer`] or
    /// [`HeapError::CorruptHeader`]; the heap is unchanged.
    ///
    /// # Safety
    /// `ptr` must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let result = unsafe { self.list.lock_irq().free(ptr) };
        result.map(|_| ()).inspect_err(|e| error!("kfree({ptr:p}): {e}"))
    }

    /// Usable payload bytes behind `ptr`, at least what was requested.
    ///
    /// # Errors
    /// As for [`free`](Self::free).
    ///
    /// # Safety
    /// `ptr` must point into the heap's arenas or be foreign memory whose
    /// preceding 16 bytes are readable.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        unsafe { self.list.lock_irq().usable_size(ptr) }
    }

    /// Make sure a block of `bytes` can be allocated without growing.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if the heap cannot grow.
    pub fn reserve(&self, frames: &FrameAllocator, bytes: usize) -> Result<(), HeapError> {
        let mut list = self.list.lock_irq();
        if list.can_fit(bytes, MIN_ALIGN) {
            return Ok(());
        }
        let needed = bytes.checked_add(4 * BLOCK_HEADER).ok_or(HeapError::Overflow)?;
        self.grow(&mut list, frames, needed)
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.list.lock_irq().stats()
    }

    /// Handle for interrupt context.
    #[must_use]
    pub const fn atomic(&self) -> AtomicHeap<'_, M> {
        AtomicHeap { heap: self }
    }

    /// Add an arena of at least `bytes` (and at least the growth step).
    fn grow(&self, list: &mut FreeList, frames: &FrameAllocator, bytes: usize) -> Result<(), HeapError> {
        let pages = (pages_for(bytes as u64) as usize).max(self.growth_pages);
        let run = frames.alloc(pages).ok_or(HeapError::OutOfMemory)?;
        let start = self.mapper.phys_to_ptr(run.start().base());
        let len = pages * PAGE_SIZE as usize;
        // SAFETY: the run is ours and the mapper covers it contiguously.
        unsafe { start.write_bytes(0, len) };
        if unsafe { !list.add_arena(start as usize, len) } {
            warn!("heap arena at {:?} rejected", run.start());
            if let Err(e) = frames.free(run) {
                error!("returning rejected heap arena {run:?}: {e}");
            }
            return Err(HeapError::OutOfMemory);
        }
        debug!("heap grew by {pages} pages at {:?}", run.start());
        Ok(())
    }
}

/// Non-growing view of a [`KernelHeap`] for interrupt handlers.
///
/// Every operation fails with [`HeapError::Busy`] instead of spinning when
/// the heap lock is held, so an interrupt arriving while its own core holds
/// the lock cannot deadlock.
pub struct AtomicHeap<'a, M: PhysMapper> {
    heap: &'a KernelHeap<M>,
}

impl<M: PhysMapper> AtomicHeap<'_, M> {
    /// # Errors
    /// [`HeapError::Busy`] or [`HeapError::OutOfMemory`].
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let mut list = self.heap.list.try_lock().ok_or(HeapError::Busy)?;
        list.alloc(size, MIN_ALIGN).ok_or(HeapError::OutOfMemory)
    }

    /// # Errors
    /// As for [`alloc`](Self::alloc).
    pub fn zalloc(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let p = self.alloc(size)?;
        // SAFETY: the block holds at least `size` bytes.
        unsafe { p.as_ptr().write_bytes(0, size) };
        Ok(p)
    }

    /// # Errors
    /// [`HeapError::Busy`] or the errors of [`KernelHeap::free`].
    ///
    /// # Safety
    /// `ptr` must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let mut list = self.heap.list.try_lock().ok_or(HeapError::Busy)?;
        unsafe { list.free(ptr) }.map(|_| ())
    }
}

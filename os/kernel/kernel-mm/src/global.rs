//! # Kernel-Wide Memory API
//!
//! The running kernel has exactly one [`MemoryManager`], stored in a
//! write-once cell by [`init`]. The free functions here forward to it so
//! the rest of the kernel can call `kmalloc`, `alloc_frames` or
//! `page_fault` without threading a handle around.
//!
//! Every function is safe to call before [`init`]: allocations fail,
//! lookups return `None`, and page faults are fatal.

use crate::fault::{AccessKind, FaultError, FaultResolution, PageFaultErrorCode};
use crate::heap::{AtomicHeap, HeapError, MIN_ALIGN};
use crate::manager::{BootError, MemoryConfig, MemoryManager};
use crate::mm::{Mm, MmError};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::boot::BootMemoryInfo;
use kernel_memory_addresses::{FrameRange, PAGE_SIZE, PhysicalAddress, VirtualAddress, VirtualRange};
use kernel_sync::SyncOnceCell;
use kernel_vmem::{HhdmPhysMapper, LocalTlb, PageEntryBits};
use log::error;

/// The memory manager as the kernel runs it.
pub type KernelMemory = MemoryManager<HhdmPhysMapper, LocalTlb>;

/// A user address space of the running kernel.
pub type KernelMm = Mm<HhdmPhysMapper>;

static MEMORY: SyncOnceCell<KernelMemory> = SyncOnceCell::new();
static CLAIMED: AtomicBool = AtomicBool::new(false);

/// Bring up memory management once.
///
/// # Errors
/// [`BootError::AlreadyInitialized`] on every call after the first
/// successful one; otherwise whatever [`MemoryManager::init`] reports.
///
/// # Safety
/// As for [`MemoryManager::init`].
pub unsafe fn init(
    boot: &BootMemoryInfo<'_>,
    mapper: HhdmPhysMapper,
    config: MemoryConfig,
) -> Result<&'static KernelMemory, BootError> {
    if CLAIMED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(BootError::AlreadyInitialized);
    }
    match unsafe { MemoryManager::init(boot, mapper, LocalTlb, config) } {
        Ok(memory) => MEMORY.set(memory).map_err(|_| BootError::AlreadyInitialized),
        Err(e) => {
            CLAIMED.store(false, Ordering::Release);
            Err(e)
        }
    }
}

/// [`init`] with the kernel's direct map.
///
/// # Errors
/// As for [`init`].
///
/// # Safety
/// The bootloader's direct map at `HHDM_BASE` must cover every usable frame.
pub unsafe fn init_kernel(
    boot: &BootMemoryInfo<'_>,
    config: MemoryConfig,
) -> Result<&'static KernelMemory, BootError> {
    unsafe { init(boot, HhdmPhysMapper::kernel(), config) }
}

/// [`init_kernel`] for the boot path, which has no way to recover.
///
/// # Panics
/// With the diagnostic if bring-up fails.
///
/// # Safety
/// As for [`init_kernel`].
pub unsafe fn init_or_halt(boot: &BootMemoryInfo<'_>, config: MemoryConfig) -> &'static KernelMemory {
    match unsafe { init_kernel(boot, config) } {
        Ok(memory) => memory,
        Err(e) => {
            error!("memory bring-up failed: {e}");
            panic!("memory bring-up failed: {e}");
        }
    }
}

/// The memory manager, once initialized.
#[inline]
#[must_use]
pub fn memory() -> Option<&'static KernelMemory> {
    MEMORY.get()
}

#[must_use]
pub fn alloc_frames(n: usize) -> Option<FrameRange> {
    memory()?.alloc_frames(n)
}

/// # Errors
/// As for [`MemoryManager::free_frames`].
pub fn free_frames(range: FrameRange) -> Result<(), MmError> {
    memory().map_or(Err(MmError::Uninitialized), |m| m.free_frames(range))
}

/// # Errors
/// As for [`MemoryManager::map_pages`].
pub fn map_pages(va: VirtualAddress, frames: FrameRange, bits: PageEntryBits) -> Result<VirtualRange, MmError> {
    memory().map_or(Err(MmError::Uninitialized), |m| m.map_pages(va, frames, bits))
}

/// # Errors
/// As for [`MemoryManager::unmap_pages`].
pub fn unmap_pages(range: VirtualRange) -> Result<usize, MmError> {
    memory().map_or(Err(MmError::Uninitialized), |m| m.unmap_pages(range))
}

#[must_use]
pub fn get_physaddr(va: VirtualAddress) -> Option<PhysicalAddress> {
    memory()?.get_physaddr(va)
}

#[must_use]
pub fn kmalloc(size: usize) -> Option<NonNull<u8>> {
    memory()?.kmalloc(size)
}

#[must_use]
pub fn kzmalloc(size: usize) -> Option<NonNull<u8>> {
    memory()?.kzmalloc(size)
}

#[must_use]
pub fn kcalloc(n: usize, size: usize) -> Option<NonNull<u8>> {
    memory()?.kcalloc(n, size)
}

/// # Safety
/// As for [`MemoryManager::krealloc`].
pub unsafe fn krealloc(ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
    unsafe { memory()?.krealloc(ptr, size) }
}

/// Free a heap block; `None` is a no-op. Double frees and foreign pointers
/// are logged and trip a debug assertion.
///
/// # Safety
/// `ptr` must not be used afterwards.
pub unsafe fn kfree(ptr: Option<NonNull<u8>>) {
    let result = match memory() {
        Some(m) => unsafe { m.kfree(ptr) },
        None if ptr.is_none() => Ok(()),
        None => Err(HeapError::NotHeapPointer),
    };
    if let Err(e) = result {
        debug_assert!(false, "kfree({ptr:?}): {e}");
    }
}

/// Heap handle for interrupt context, once initialized.
#[must_use]
pub fn atomic_heap() -> Option<AtomicHeap<'static, HhdmPhysMapper>> {
    Some(memory()?.atomic_heap())
}

/// Resolve a page fault in `mm`. Before [`init`] every fault is fatal.
///
/// # Errors
/// As for [`MemoryManager::page_fault`].
pub fn page_fault(mm: &KernelMm, addr: VirtualAddress, code: PageFaultErrorCode) -> Result<FaultResolution, FaultError> {
    match memory() {
        Some(m) => m.page_fault(mm, addr, code),
        None => Err(FaultError::KernelFault(addr)),
    }
}

/// Whether `mm` may perform `access` on `[addr, addr + len)`.
#[must_use]
pub fn access_ok(mm: &KernelMm, addr: VirtualAddress, len: u64, access: AccessKind) -> bool {
    memory().is_some_and(|m| m.access_ok(mm, addr, len, access))
}

/// [`GlobalAlloc`] on top of the kernel heap, for `alloc::` collections.
///
/// The kernel binary installs it with `#[global_allocator]`. Alignments above
/// a page are not supported and fail like an out-of-memory condition.
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    /// # Safety
    /// The `GlobalAlloc` contract applies. Caller must handle a null return (OOM).
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > PAGE_SIZE as usize {
            return ptr::null_mut();
        }
        memory()
            .and_then(|m| m.kmalloc_aligned(layout.size(), layout.align()))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies. `ptr` and `layout` must match a prior allocation.
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { kfree(NonNull::new(ptr)) };
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies.
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies.
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= MIN_ALIGN {
            return unsafe { krealloc(NonNull::new(ptr), new_size) }.map_or(ptr::null_mut(), NonNull::as_ptr);
        }
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        let new = unsafe { self.alloc(new_layout) };
        if !new.is_null() {
            unsafe {
                ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
        }
        new
    }
}

//! # Virtual Memory Support
//!
//! x86-64 4-level paging for the kernel's page table manager.
//!
//! ## What you get
//! - An [`AddressSpace`] owning one `PML4`-rooted translation tree, with
//!   map / unmap / translate over page-aligned ranges, rollback on failure,
//!   and kernel-half sharing between spaces.
//! - [`PageEntryBits`], a bitfield view of a page table entry including the
//!   two OS-available bits the memory manager uses (copy-on-write, unmanaged).
//! - A 4 KiB-aligned [`PageTable`] and typed [`TableIndex`] helpers.
//! - The seams to the rest of the kernel: [`FrameAlloc`] (physical frames),
//!   [`PhysMapper`] (touching physical memory) and [`TlbFlush`] (translation
//!   cache invalidation).
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each level containing 512 (2⁹) entries of 8 bytes (64 bits) each.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Frame
//!   │        │        │        │
//!   │        │        │        └───► PTE   (Page Table Entry)  → maps 4 KiB page
//!   │        │        └────────────► PDE   (Page Directory Entry)
//!   │        └─────────────────────► PDPTE (Page Directory Pointer Table Entry)
//!   └──────────────────────────────► PML4E (Page Map Level 4 Entry)
//! ```
//!
//! Only 4 KiB leaves are ever created: every PML4E, PDPTE and PDE written by
//! this crate points to a next-level table, and every PTE is a leaf.
//!
//! ### Kernel half
//!
//! PML4 slots `256..512` cover the upper canonical half. Every address space
//! copies those slots from the kernel space when it is created, so the
//! kernel's text, data, direct map and heap stay reachable while a user space
//! is active. Tables below those slots are shared and never freed by a user
//! space.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod page_entry_bits;
mod page_table;
pub mod phys_mapper;
pub mod tlb;

#[cfg(test)]
pub(crate) mod test_support;

pub use crate::address_space::{AddressSpace, VmemError};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{PageTable, TableIndex, TableLevel, split_indices};
pub use crate::phys_mapper::HhdmPhysMapper;
pub use crate::tlb::{LocalTlb, TlbFlush};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalFrame};

/// Source of physical 4 KiB frames for page tables and mapped pages.
///
/// Frames come back with one reference owned by the caller. Installing a
/// frame in a page table hands that reference to the table; unmapping gives
/// it back through [`release_4k`](Self::release_4k).
pub trait FrameAlloc {
    /// Allocate one frame with a reference count of one.
    ///
    /// Returns `None` on out-of-memory.
    fn alloc_4k(&self) -> Option<PhysicalFrame>;

    /// Add a reference to an already allocated frame.
    fn share_4k(&self, frame: PhysicalFrame);

    /// Drop one reference; the frame is reclaimed once unreferenced.
    fn release_4k(&self, frame: PhysicalFrame);
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &A {
    #[inline]
    fn alloc_4k(&self) -> Option<PhysicalFrame> {
        (**self).alloc_4k()
    }

    #[inline]
    fn share_4k(&self, frame: PhysicalFrame) {
        (**self).share_4k(frame);
    }

    #[inline]
    fn release_4k(&self, frame: PhysicalFrame) {
        (**self).release_4k(frame);
    }
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space (e.g., via identity map or a higher-half direct map, HHDM).
///
/// Typical patterns:
/// - **Kernel**: uses HHDM; adds a constant offset before returning a pointer.
/// - **Tests**: back "physical memory" with a host buffer.
///
/// Implementations must map physically contiguous ranges to virtually
/// contiguous ones; the frame table and heap arenas rely on it.
pub trait PhysMapper {
    /// Pointer through which the byte at `pa` can be accessed.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// Convert a *physical* address to a typed mutable reference.
    ///
    /// # Safety
    /// - `pa` must be mapped writable through this mapper for `'a`.
    /// - The bytes at `pa` must be a valid `T` and must not be aliased.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T
    where
        Self: Sized,
    {
        unsafe { &mut *self.phys_to_ptr(pa).cast::<T>() }
    }

    /// Fill a frame with zeroes.
    ///
    /// # Safety
    /// No live reference may point into the frame.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn zero_frame(&self, frame: PhysicalFrame) {
        unsafe { core::ptr::write_bytes(self.phys_to_ptr(frame.base()), 0, PAGE_SIZE as usize) }
    }

    /// Copy the contents of `src` into `dst`.
    ///
    /// # Safety
    /// The frames must differ and no live mutable reference may point into either.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn copy_frame(&self, src: PhysicalFrame, dst: PhysicalFrame) {
        debug_assert_ne!(src, dst);
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.phys_to_ptr(src.base()),
                self.phys_to_ptr(dst.base()),
                PAGE_SIZE as usize,
            );
        }
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (**self).phys_to_ptr(pa)
    }
}

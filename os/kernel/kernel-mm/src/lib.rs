//! # Kernel Memory Management
//!
//! Physical frames, process address spaces, page fault resolution and the
//! kernel heap, built on the page table primitives of `kernel-vmem`.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        MemoryManager / global entry points          │
//! │    • Boot bring-up, kmalloc, page_fault, fork       │
//! └───────┬──────────────────┬──────────────────┬───────┘
//!         │                  │                  │
//! ┌───────▼───────┐  ┌───────▼───────┐  ┌───────▼───────┐
//! │  Mm (per      │  │  Kernel heap  │  │ Kernel space  │
//! │  process)     │  │  free list in │  │ (AddressSpace)│
//! │  VMAs + PTs   │  │  frame arenas │  │               │
//! └───────┬───────┘  └───────┬───────┘  └───────┬───────┘
//!         │                  │                  │
//! ┌───────▼──────────────────▼──────────────────▼───────┐
//! │              Physical Frame Allocator               │
//! │    • One record per 4 KiB frame                     │
//! │    • Address-ordered free list, first fit           │
//! │    • Atomic reference counts for shared frames      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Physical Frame Allocator ([`frames`])
//!
//! Hands out runs of physically contiguous frames and tracks a reference
//! count per frame so copy-on-write pages can be shared between address
//! spaces. Its bookkeeping table lives in RAM it carves out for itself.
//!
//! ### Virtual Memory Areas ([`vma`])
//!
//! A sorted, non-overlapping, merged list of the regions a process may touch,
//! with their permissions and backing (anonymous or file).
//!
//! ### Address Spaces ([`mm`]) and Faults ([`fault`])
//!
//! [`Mm`] pairs page tables with a [`VmaList`]. Pages are populated on first
//! access: [`Mm::handle_fault`] demand-pages, breaks copy-on-write sharing,
//! grows stacks downward and rejects everything else with a [`FaultError`].
//!
//! ### Kernel Heap ([`heap`])
//!
//! A first-fit free list over direct-mapped arenas. [`AtomicHeap`] is the
//! non-blocking view for interrupt context.
//!
//! ### Bring-up ([`manager`], [`global`])
//!
//! [`MemoryManager`] owns all of the above. [`global`] keeps the kernel's one
//! instance and exposes `kmalloc`-style free functions.
//!
//! ## Memory Layout Integration
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  unmapped (USER_MMAP_MIN)       │
//!                       │  User Space: program, heap,     │
//! USER_MMAP_BASE        │  mmap areas, stack              │
//! USERSPACE_END         ├─────────────────────────────────┤
//!                       │  non-canonical hole             │
//! HHDM_BASE             ├─────────────────────────────────┤
//!                       │  Direct map of physical memory  │
//! KERNEL_VMAP_BASE      ├─────────────────────────────────┤
//!                       │  Kernel vmap window             │
//! KERNEL_BASE           ├─────────────────────────────────┤
//!                       │  Kernel image                   │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Every kernel-half PML4 slot in use is populated at boot and copied into
//! each new user space, so kernel mappings are visible everywhere.
//!
//! ## Locking
//!
//! Locks nest in one order only: `Mm`, kernel space, heap, frames. The heap
//! and frame locks mask interrupts while held.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

extern crate alloc;

pub mod fault;
pub mod frames;
pub mod global;
pub mod heap;
pub mod manager;
pub mod mm;
pub mod vma;

pub use crate::fault::{AccessKind, FaultError, FaultResolution, PageFaultErrorCode};
pub use crate::frames::{FrameAllocator, FrameError, FrameState, FrameStats};
pub use crate::heap::{AtomicHeap, HeapError, HeapStats, KernelHeap, MIN_ALIGN};
pub use crate::manager::{BootError, MemoryConfig, MemoryManager};
pub use crate::mm::{Mm, MmError, Placement};
pub use crate::vma::{Backing, BackingError, BackingFile, Vma, VmaError, VmaFlags, VmaList};

//! # Kernel Memory Layout and Boot Memory Interface
//!
//! Constants and data structures shared between the boot path and the memory
//! manager.
//!
//! ## Architecture
//!
//! ### Boot Memory Information ([`boot`])
//! * **Memory Map**: usable and reserved physical regions as reported by firmware
//! * **Kernel Image**: physical extent of the loaded kernel, never allocatable
//! * **Extra Reservations**: anything else the boot path still needs
//!
//! ### Memory Layout ([`memory`])
//! * **User Half**: `0x0000_0000_0000_0000 .. USERSPACE_END`
//! * **Kernel Half**: shared by every address space through PML4 slots 256..512
//! * **Direct Map**: all managed RAM mapped at [`HHDM_BASE`](memory::HHDM_BASE)
//! * **Kernel Image**: executing at [`KERNEL_BASE`](memory::KERNEL_BASE)
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   null guard (< USER_MMAP_MIN)  │
//!                       │         User Space              │
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │   non-canonical hole            │
//! KERNEL_SPACE_START    ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │   Guard Region                  │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │   Kernel Text & Data            │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! All layout values are `const` and cross-checked by compile-time
//! assertions.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;

//! # Kernel synchronization primitives
//!
//! * [`SpinLock`]: data-owning spin lock with RAII guards, plus an
//!   interrupt-masking acquisition ([`SpinLock::lock_irq`]).
//! * [`IrqGuard`]: scoped `cli`/`sti` with state restore.
//! * [`SyncOnceCell`]: write-once cell for boot-initialized singletons.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use irq::IrqGuard;
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;

//! # Page-Fault Classification Types
//!
//! The `#PF` handler hands the faulting address (CR2) and the error code the
//! CPU pushed to [`Mm::handle_fault`](crate::Mm::handle_fault), which decides
//! between one of the recoverable [`FaultResolution`]s and a fatal
//! [`FaultError`].

use crate::vma::BackingError;
use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::VmemError;

/// Page-fault error code layout (x86-64).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15.1 “Page-Fault Exception (#PF)”.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultErrorCode {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64, // reserved / ignored bits
}

impl PageFaultErrorCode {
    /// Kind of access that faulted.
    #[must_use]
    pub const fn access(&self) -> AccessKind {
        if self.instruction_fetch() {
            AccessKind::Execute
        } else if self.write() || self.shadow_stack() {
            AccessKind::Write
        } else {
            AccessKind::Read
        }
    }

    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page (page not mapped yet)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// What an access wants to do with a page.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// How a fault was resolved; the faulting instruction can be retried.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultResolution {
    /// A fresh page was allocated and filled (zeroes or file content).
    DemandPaged,
    /// A shared copy-on-write page was copied into a private one.
    CopiedOnWrite,
    /// A copy-on-write page had no other user and was made writable in place.
    Reused,
    /// The mapping already permits the access, e.g. a stale TLB entry on
    /// another core.
    Spurious,
}

/// A fault that cannot be resolved; the faulting task must be killed (or the
/// kernel must panic for supervisor faults).
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    #[error("no area covers {0:?}")]
    NoMapping(VirtualAddress),
    #[error("{access:?} access to {addr:?} is not permitted")]
    AccessDenied {
        addr: VirtualAddress,
        access: AccessKind,
    },
    #[error("reserved bit set in a paging structure for {0:?}")]
    ReservedBit(VirtualAddress),
    #[error("fault on kernel address {0:?}")]
    KernelFault(VirtualAddress),
    #[error("out of memory resolving a fault")]
    OutOfMemory,
    #[error("backing object: {0}")]
    Backing(#[from] BackingError),
    #[error(transparent)]
    Vmem(#[from] VmemError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_access_kind() {
        let read = PageFaultErrorCode::new().with_user(true);
        assert_eq!(read.access(), AccessKind::Read);
        let write = PageFaultErrorCode::from_bits(0b110);
        assert!(write.write() && write.user() && !write.present());
        assert_eq!(write.access(), AccessKind::Write);
        let exec = PageFaultErrorCode::from_bits(0b1_0101);
        assert_eq!(exec.access(), AccessKind::Execute);
        assert!(exec.explain().contains("instruction fetch"));
    }

    #[test]
    fn reserved_bit_is_reported_first() {
        let e = PageFaultErrorCode::new().with_present(true).with_reserved_bit(true);
        assert!(e.explain().starts_with("Reserved"));
    }
}

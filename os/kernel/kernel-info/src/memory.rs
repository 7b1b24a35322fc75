//! # Memory Layout

/// Exclusive end of the user half of the address space (lower canonical half).
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// First address of the kernel half (upper canonical half).
pub const KERNEL_SPACE_START: u64 = 0xffff_8000_0000_0000;

/// First PML4 slot belonging to the kernel half.
///
/// Slots `KERNEL_PML4_FIRST_SLOT..512` are shared by every address space.
pub const KERNEL_PML4_FIRST_SLOT: usize = 256;

/// Lowest user address handed out by the mapper; keeps the null page and its
/// neighbourhood unmapped.
pub const USER_MMAP_MIN: u64 = 0x0000_0000_0001_0000;

/// Where searches for a free user region (non-fixed mappings) start.
pub const USER_MMAP_BASE: u64 = 0x0000_1000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Start of the window for kernel mappings of arbitrary frames (MMIO,
/// non-contiguous buffers).
pub const KERNEL_VMAP_BASE: u64 = 0xffff_c900_0000_0000;

/// Size of the kernel mapping window; two PML4 slots.
pub const KERNEL_VMAP_SIZE: u64 = 1 << 40;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// How far below a grows-down region a fault may land and still extend it.
pub const STACK_GROWTH_WINDOW: u64 = 64 * 1024;

/// Upper bound on the size of a grows-down region.
pub const STACK_MAX_SIZE: u64 = 8 * 1024 * 1024;

const _: () = {
    assert!(USER_MMAP_MIN < USER_MMAP_BASE);
    assert!(USER_MMAP_BASE < USERSPACE_END);
    assert!(HHDM_BASE >= KERNEL_SPACE_START);
    assert!(KERNEL_VMAP_BASE > HHDM_BASE);
    assert!(KERNEL_VMAP_BASE + KERNEL_VMAP_SIZE <= KERNEL_BASE);
    assert!(KERNEL_VMAP_BASE.is_multiple_of(1 << 39));
    assert!(STACK_GROWTH_WINDOW.is_multiple_of(4096));
    assert!(STACK_MAX_SIZE.is_multiple_of(4096));
    // PML4 slot of the first kernel-half address.
    assert!(((KERNEL_SPACE_START >> 39) & 0x1ff) as usize == KERNEL_PML4_FIRST_SLOT);
};

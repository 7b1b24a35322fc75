//! Translation lookaside buffer maintenance.
//!
//! Page table edits only become visible once stale translations are dropped.
//! [`TlbFlush`] is the seam: the kernel uses [`LocalTlb`] (this core only),
//! tests substitute a recorder.

use kernel_memory_addresses::VirtualPage;

/// Invalidate cached translations after a page table change.
pub trait TlbFlush {
    /// Drop the translation for one page on this core.
    fn flush_page(&self, page: VirtualPage);

    /// Drop all non-global translations on this core.
    fn flush_all(&self);
}

impl<T: TlbFlush + ?Sized> TlbFlush for &T {
    #[inline]
    fn flush_page(&self, page: VirtualPage) {
        (**self).flush_page(page);
    }

    #[inline]
    fn flush_all(&self) {
        (**self).flush_all();
    }
}

/// `invlpg` / CR3 reload on the executing core.
///
/// On the host these are no-ops so the page table code can be tested.
#[derive(Copy, Clone, Debug, Default)]
pub struct LocalTlb;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl TlbFlush for LocalTlb {
    #[inline]
    fn flush_page(&self, page: VirtualPage) {
        unsafe {
            core::arch::asm!(
                "invlpg [{}]",
                in(reg) page.base().as_u64(),
                options(nostack, preserves_flags)
            );
        }
    }

    #[inline]
    fn flush_all(&self) {
        unsafe {
            let cr3: u64;
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
impl TlbFlush for LocalTlb {
    #[inline]
    fn flush_page(&self, page: VirtualPage) {
        log::trace!("invlpg {page:?} (host no-op)");
    }

    #[inline]
    fn flush_all(&self) {}
}

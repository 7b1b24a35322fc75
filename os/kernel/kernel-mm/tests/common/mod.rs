//! Simulated physical memory shared by the integration tests.

#![allow(dead_code)]

use kernel_info::boot::{BootMemoryInfo, MemoryRegion};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalRange, VirtualPage};
use kernel_mm::{MemoryConfig, MemoryManager, Mm};
use kernel_vmem::{HhdmPhysMapper, LocalTlb, TlbFlush};
use std::sync::Mutex;

/// First simulated physical address; everything below it is a hole.
pub const PHYS_START: u64 = 0x10_0000;

pub const MIB: u64 = 0x10_0000;

#[repr(C, align(4096))]
struct Frame([u8; 4096]);

/// `size` bytes of RAM at [`PHYS_START`] holding a kernel image of
/// `kernel` bytes at its very beginning. The buffer is leaked.
pub struct Ram {
    mapper: HhdmPhysMapper,
    regions: &'static [MemoryRegion],
    kernel: PhysicalRange,
}

impl Ram {
    pub fn new(size: u64, kernel: u64) -> Self {
        let frames = (size / PAGE_SIZE) as usize;
        let mut v = Vec::with_capacity(frames);
        v.resize_with(frames, || Frame([0; 4096]));
        let buf: &'static mut [Frame] = v.leak();
        let host = buf.as_mut_ptr().expose_provenance() as u64;
        let mapper = unsafe { HhdmPhysMapper::with_base(host.wrapping_sub(PHYS_START)) };
        let regions = Vec::leak(vec![MemoryRegion::usable(PHYS_START, size)]);
        Self {
            mapper,
            regions,
            kernel: PhysicalRange::new(PhysicalAddress::new(PHYS_START), kernel),
        }
    }

    pub const fn mapper(&self) -> HhdmPhysMapper {
        self.mapper
    }

    pub const fn kernel(&self) -> PhysicalRange {
        self.kernel
    }

    pub fn boot(&self) -> BootMemoryInfo<'static> {
        BootMemoryInfo::new(self.regions, self.kernel)
    }

    pub const fn end(&self) -> u64 {
        self.regions[0].start + self.regions[0].len
    }
}

pub type Manager = MemoryManager<HhdmPhysMapper, LocalTlb>;

pub type UserMm = Mm<HhdmPhysMapper>;

/// 16 MiB of RAM, 1 MiB kernel, small heap.
pub fn manager() -> (Ram, Manager) {
    manager_with(MemoryConfig {
        initial_heap_pages: 16,
        heap_growth_pages: 16,
        ..MemoryConfig::new()
    })
}

pub fn manager_with(config: MemoryConfig) -> (Ram, Manager) {
    let ram = Ram::new(16 * MIB, MIB);
    let mm = unsafe { MemoryManager::init(&ram.boot(), ram.mapper(), LocalTlb, config) }
        .expect("memory bring-up");
    (ram, mm)
}

/// Records flushed pages.
#[derive(Default)]
pub struct RecordingTlb {
    pub pages: Mutex<Vec<VirtualPage>>,
}

impl RecordingTlb {
    pub fn flushed(&self, page: VirtualPage) -> bool {
        self.pages.lock().unwrap().contains(&page)
    }
}

impl TlbFlush for RecordingTlb {
    fn flush_page(&self, page: VirtualPage) {
        self.pages.lock().unwrap().push(page);
    }

    fn flush_all(&self) {}
}

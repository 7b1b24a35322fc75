//! Simulated physical memory for host tests.

use crate::{FrameAlloc, HhdmPhysMapper, TlbFlush};
use core::cell::{Cell, RefCell};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalFrame, VirtualPage};
use std::collections::BTreeMap;

/// First simulated physical address.
pub const PHYS_START: u64 = 0x10_0000;

#[repr(C, align(4096))]
struct Frame([u8; 4096]);

/// `frames` 4 KiB frames starting at [`PHYS_START`], leaked for `'static`.
pub struct TestPhys {
    frames: u64,
    mapper: HhdmPhysMapper,
}

impl TestPhys {
    pub fn new(frames: usize) -> Self {
        let mut v = Vec::with_capacity(frames);
        v.resize_with(frames, || Frame([0; 4096]));
        let buf: &'static mut [Frame] = v.leak();
        let host = buf.as_mut_ptr().expose_provenance() as u64;
        let mapper = unsafe { HhdmPhysMapper::with_base(host.wrapping_sub(PHYS_START)) };
        Self {
            frames: frames as u64,
            mapper,
        }
    }

    pub const fn mapper(&self) -> HhdmPhysMapper {
        self.mapper
    }

    pub const fn end(&self) -> u64 {
        PHYS_START + self.frames * PAGE_SIZE
    }
}

/// Bump allocator with reference counting and injectable failure.
pub struct TestAlloc {
    next: Cell<u64>,
    end: u64,
    refs: RefCell<BTreeMap<u64, u32>>,
    recycled: RefCell<Vec<u64>>,
    fail_after: Cell<Option<usize>>,
}

impl TestAlloc {
    pub fn new(phys: &TestPhys) -> Self {
        Self {
            next: Cell::new(PHYS_START),
            end: phys.end(),
            refs: RefCell::new(BTreeMap::new()),
            recycled: RefCell::new(Vec::new()),
            fail_after: Cell::new(None),
        }
    }

    /// Let `n` more allocations succeed, then fail.
    pub fn fail_after(&self, n: usize) {
        self.fail_after.set(Some(n));
    }

    /// Frames currently referenced.
    pub fn live(&self) -> usize {
        self.refs.borrow().len()
    }

    pub fn refcount(&self, frame: PhysicalFrame) -> u32 {
        self.refs
            .borrow()
            .get(&frame.number())
            .copied()
            .unwrap_or(0)
    }
}

impl FrameAlloc for TestAlloc {
    fn alloc_4k(&self) -> Option<PhysicalFrame> {
        if let Some(n) = self.fail_after.get() {
            if n == 0 {
                return None;
            }
            self.fail_after.set(Some(n - 1));
        }
        let number = if let Some(n) = self.recycled.borrow_mut().pop() {
            n
        } else {
            let pa = self.next.get();
            if pa >= self.end {
                return None;
            }
            self.next.set(pa + PAGE_SIZE);
            pa / PAGE_SIZE
        };
        self.refs.borrow_mut().insert(number, 1);
        Some(PhysicalFrame::from_number(number))
    }

    fn share_4k(&self, frame: PhysicalFrame) {
        *self
            .refs
            .borrow_mut()
            .get_mut(&frame.number())
            .expect("sharing an unallocated frame") += 1;
    }

    fn release_4k(&self, frame: PhysicalFrame) {
        let mut refs = self.refs.borrow_mut();
        let count = refs
            .get_mut(&frame.number())
            .expect("releasing an unallocated frame");
        *count -= 1;
        if *count == 0 {
            refs.remove(&frame.number());
            self.recycled.borrow_mut().push(frame.number());
        }
    }
}

/// Records flushed pages.
#[derive(Default)]
pub struct CountingTlb {
    pub pages: RefCell<Vec<VirtualPage>>,
    pub full: Cell<usize>,
}

impl TlbFlush for CountingTlb {
    fn flush_page(&self, page: VirtualPage) {
        self.pages.borrow_mut().push(page);
    }

    fn flush_all(&self) {
        self.full.set(self.full.get() + 1);
    }
}

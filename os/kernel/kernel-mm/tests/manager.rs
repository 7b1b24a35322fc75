mod common;

use common::{MIB, PHYS_START, RecordingTlb, Ram, manager, manager_with};
use kernel_info::boot::BootMemoryInfo;
use kernel_info::memory::{HHDM_BASE, KERNEL_BASE, KERNEL_SPACE_START, KERNEL_VMAP_BASE, USER_MMAP_MIN};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalRange, VirtualAddress, VirtualRange};
use kernel_mm::{
    Backing, BootError, FrameError, FrameState, HeapError, MemoryConfig, MemoryManager, MmError, Placement,
    VmaError, VmaFlags,
};
use kernel_vmem::{LocalTlb, PageEntryBits};

fn va(addr: u64) -> VirtualAddress {
    VirtualAddress::new(addr)
}

#[test]
fn bring_up_maps_kernel_image_and_direct_map() {
    let (_ram, mem) = manager();
    assert_eq!(
        mem.get_physaddr(va(KERNEL_BASE + 0x123)),
        Some(PhysicalAddress::new(PHYS_START + 0x123))
    );
    let pa = PHYS_START + 5 * MIB + 0x40;
    assert_eq!(mem.get_physaddr(va(HHDM_BASE + pa)), Some(PhysicalAddress::new(pa)));
    assert_eq!(mem.get_physaddr(va(KERNEL_VMAP_BASE)), None);

    let stats = mem.frame_stats();
    assert_eq!(stats.free + stats.in_use, stats.usable);
    assert!(mem.heap_stats().arena_bytes >= 16 * PAGE_SIZE as usize);
}

#[test]
fn direct_map_can_be_skipped() {
    let (_ram, mem) = manager_with(MemoryConfig {
        direct_map: false,
        map_kernel_image: false,
        initial_heap_pages: 1,
        ..MemoryConfig::new()
    });
    assert_eq!(mem.get_physaddr(va(HHDM_BASE + PHYS_START)), None);
    assert_eq!(mem.get_physaddr(va(KERNEL_BASE)), None);
}

#[test]
fn bring_up_without_usable_memory_fails() {
    let ram = Ram::new(MIB, 0);
    let boot = BootMemoryInfo::new(&[], PhysicalRange::new(PhysicalAddress::new(PHYS_START), 0));
    let err = unsafe { MemoryManager::init(&boot, ram.mapper(), LocalTlb, MemoryConfig::new()) }
        .err()
        .unwrap();
    assert_eq!(err, BootError::Frames(FrameError::NoUsableMemory));
}

#[test]
fn oversized_initial_heap_fails() {
    let ram = Ram::new(4 * MIB, 0);
    let config = MemoryConfig {
        initial_heap_pages: 4096,
        ..MemoryConfig::new()
    };
    let err = unsafe { MemoryManager::init(&ram.boot(), ram.mapper(), LocalTlb, config) }
        .err()
        .unwrap();
    assert_eq!(err, BootError::HeapExhausted { pages: 4096 });
}

#[test]
fn kernel_mappings_are_visible_in_every_space() {
    let (_ram, mem) = manager();
    let mm = mem.new_mm().unwrap();
    let run = mem.alloc_frames(2).unwrap();

    // mapped after the user space was created
    let range = mem
        .map_pages(va(KERNEL_VMAP_BASE), run, PageEntryBits::kernel_rw())
        .unwrap();
    assert_eq!(range.page_count(), 2);
    let second = va(KERNEL_VMAP_BASE + PAGE_SIZE + 8);
    let expected = PhysicalAddress::new(run.start().base().as_u64() + PAGE_SIZE + 8);
    assert_eq!(mem.get_physaddr(second), Some(expected));
    assert_eq!(mm.translate(second), Some(expected));

    assert_eq!(mem.unmap_pages(range), Ok(2));
    assert_eq!(mem.get_physaddr(second), None);
    assert_eq!(mem.frames().state(run.start()), Some(FrameState::Free));
    mem.destroy_mm(mm);
}

#[test]
fn map_pages_rejects_non_kernel_ranges() {
    let (_ram, mem) = manager();
    let run = mem.alloc_frames(1).unwrap();
    let user = va(0x40_0000);
    let expect = |addr: VirtualAddress| {
        Err(MmError::NotKernelRange(VirtualRange::covering(addr, PAGE_SIZE).unwrap()))
    };
    assert_eq!(mem.map_pages(user, run, PageEntryBits::kernel_rw()), expect(user));
    // kernel half, but no top-level table was set up there
    let hole = va(KERNEL_SPACE_START);
    assert_eq!(mem.map_pages(hole, run, PageEntryBits::kernel_rw()), expect(hole));
    assert_eq!(
        mem.map_pages(va(KERNEL_VMAP_BASE + 1), run, PageEntryBits::kernel_rw()),
        Err(MmError::Misaligned(va(KERNEL_VMAP_BASE + 1)))
    );
    mem.free_frames(run).unwrap();
}

#[test]
fn new_spaces_start_empty_and_are_freed() {
    let (_ram, mem) = manager();
    let free = mem.frames().free_count();
    let mm = mem.new_mm().unwrap();
    assert_ne!(mm.root(), mem.kernel_root());
    assert_eq!(mm.vma_count(), 0);
    assert_eq!(mm.translate(va(KERNEL_BASE)), Some(PhysicalAddress::new(PHYS_START)));
    mem.destroy_mm(mm);
    assert_eq!(mem.frames().free_count(), free);
}

#[test]
fn fixed_placement_rules() {
    let (_ram, mem) = manager();
    let tlb = RecordingTlb::default();
    let mm = mem.new_mm().unwrap();
    let map = |addr: u64, len: u64, replace: bool| {
        mm.map(
            mem.frames(),
            &tlb,
            Placement::Fixed { addr: va(addr), replace },
            len,
            VmaFlags::rw(),
            Backing::Anonymous,
        )
    };

    assert_eq!(map(0x40_0000, 2 * PAGE_SIZE, false), Ok(va(0x40_0000)));
    assert_eq!(map(0x40_0010, PAGE_SIZE, false), Err(MmError::Misaligned(va(0x40_0010))));
    assert_eq!(map(0x40_0000, 0, false), Err(MmError::InvalidLength(0)));
    let overlap = VirtualRange::covering(va(0x40_1000), PAGE_SIZE).unwrap();
    assert_eq!(map(0x40_1000, 1, false), Err(MmError::Vma(VmaError::Overlap(overlap))));
    let low = VirtualRange::covering(va(USER_MMAP_MIN - PAGE_SIZE), PAGE_SIZE).unwrap();
    assert_eq!(
        map(USER_MMAP_MIN - PAGE_SIZE, PAGE_SIZE, false),
        Err(MmError::Vma(VmaError::OutsideUserSpace(low)))
    );

    // replacing drops the pages already faulted in
    mm.copy_to_user(mem.frames(), &tlb, va(0x40_1000), b"old").unwrap();
    assert_eq!(mm.mapped_pages(), 1);
    assert_eq!(map(0x40_1000, PAGE_SIZE, true), Ok(va(0x40_1000)));
    assert_eq!(mm.mapped_pages(), 0);
    assert!(tlb.flushed(va(0x40_1000).page()));
    // same flags and backing: still one area
    assert_eq!(mm.vma_count(), 1);
}

#[test]
fn anywhere_placement_fills_gaps() {
    let (_ram, mem) = manager();
    let tlb = RecordingTlb::default();
    let mm = mem.new_mm().unwrap();
    let anywhere = |len: u64, flags: VmaFlags| {
        mm.map(mem.frames(), &tlb, Placement::Anywhere, len, flags, Backing::Anonymous)
            .unwrap()
    };
    let a = anywhere(PAGE_SIZE, VmaFlags::rw());
    let b = anywhere(PAGE_SIZE, VmaFlags::ro());
    let c = anywhere(PAGE_SIZE, VmaFlags::rw());
    assert_eq!(b.as_u64(), a.as_u64() + PAGE_SIZE);
    assert_eq!(c.as_u64(), b.as_u64() + PAGE_SIZE);
    assert_eq!(mm.unmap(mem.frames(), &tlb, b, PAGE_SIZE), Ok(0));
    assert_eq!(anywhere(PAGE_SIZE, VmaFlags::rx()), b);
    assert!(mm.with_vmas(|v| v.check_invariants()));
}

#[test]
fn program_break_grows_and_shrinks() {
    let (_ram, mem) = manager();
    let tlb = RecordingTlb::default();
    let mm = mem.new_mm().unwrap();
    assert_eq!(mm.brk(mem.frames(), &tlb, None), Err(MmError::NoBreak));

    let start = va(0x60_0000);
    mm.init_brk(start).unwrap();
    assert_eq!(mm.brk(mem.frames(), &tlb, None), Ok(start));
    let end = va(start.as_u64() + 3 * PAGE_SIZE + 10);
    assert_eq!(mm.brk(mem.frames(), &tlb, Some(end)), Ok(end));
    mm.copy_to_user(mem.frames(), &tlb, va(start.as_u64() + 3 * PAGE_SIZE), b"top").unwrap();
    assert_eq!(mm.with_vmas(|v| v.iter().map(|v| v.range().page_count()).sum::<u64>()), 4);

    assert_eq!(mm.brk(mem.frames(), &tlb, Some(start)), Ok(start));
    assert_eq!(mm.vma_count(), 0);
    assert_eq!(mm.mapped_pages(), 0);
    assert_eq!(
        mm.brk(mem.frames(), &tlb, Some(va(start.as_u64() - PAGE_SIZE))),
        Err(MmError::InvalidLength(start.as_u64() - PAGE_SIZE))
    );
}

#[test]
fn map_frames_installs_leaves_eagerly() {
    let (_ram, mem) = manager();
    let mm = mem.new_mm().unwrap();
    let run = mem.alloc_frames(2).unwrap();
    let range = mm
        .map_frames(mem.frames(), va(0x80_0000), run, VmaFlags::rw().with_shared(true))
        .unwrap();
    assert_eq!(range.page_count(), 2);
    assert_eq!(mm.mapped_pages(), 2);
    assert_eq!(mm.translate(va(0x80_1000)), Some(run.start().base().checked_add(PAGE_SIZE).unwrap()));

    let again = mm.map_frames(mem.frames(), va(0x80_1000), run, VmaFlags::rw());
    assert!(matches!(again, Err(MmError::Vma(VmaError::Overlap(_)))));

    mem.destroy_mm(mm);
    assert_eq!(mem.frames().state(run.start()), Some(FrameState::Free));
}

#[test]
fn krealloc_to_zero_frees_the_block() {
    let (_ram, mem) = manager();
    let before = mem.heap_stats().allocated_bytes;
    let p = mem.kmalloc(64).unwrap();
    assert!(mem.heap_stats().allocated_bytes > before);

    assert_eq!(unsafe { mem.krealloc(Some(p), 0) }, None);
    assert_eq!(mem.heap_stats().allocated_bytes, before);
    assert_eq!(unsafe { mem.kfree(Some(p)) }, Err(HeapError::DoubleFree));
}

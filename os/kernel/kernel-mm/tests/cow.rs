mod common;

use common::{RecordingTlb, manager};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_mm::{Backing, FaultResolution, PageFaultErrorCode, Placement, VmaFlags};

fn write() -> PageFaultErrorCode {
    PageFaultErrorCode::new()
        .with_user(true)
        .with_present(true)
        .with_write(true)
}

fn read(mem: &common::Manager, mm: &common::UserMm, tlb: &RecordingTlb, at: VirtualAddress) -> u8 {
    let mut b = [0u8];
    mm.copy_from_user(mem.frames(), tlb, &mut b, at).unwrap();
    b[0]
}

#[test]
fn fork_shares_frames_until_written() {
    let (_ram, mem) = manager();
    let tlb = RecordingTlb::default();
    let parent = mem.new_mm().unwrap();
    let addr = parent
        .map(mem.frames(), &tlb, Placement::Anywhere, 2 * PAGE_SIZE, VmaFlags::rw(), Backing::Anonymous)
        .unwrap();
    parent.copy_to_user(mem.frames(), &tlb, addr, b"A").unwrap();
    let frame = parent.translate(addr).unwrap().frame();

    let child = parent.fork(mem.frames(), &tlb).unwrap();
    assert_eq!(child.translate(addr).unwrap().frame(), frame);
    assert_eq!(mem.frames().refcount(frame), 2);
    assert_eq!(child.mapped_pages(), 1);
    assert_eq!(child.vma_count(), parent.vma_count());
    assert!(tlb.flushed(addr.page()), "parent leaf was write-protected");

    // the child writes: it gets a private copy, the parent keeps the original
    assert_eq!(
        mem.page_fault(&child, addr, write()),
        Ok(FaultResolution::CopiedOnWrite)
    );
    let copy = child.translate(addr).unwrap().frame();
    assert_ne!(copy, frame);
    assert_eq!(mem.frames().refcount(frame), 1);
    assert_eq!(mem.frames().refcount(copy), 1);
    assert_eq!(read(&mem, &child, &tlb, addr), b'A');

    child.copy_to_user(mem.frames(), &tlb, addr, b"B").unwrap();
    assert_eq!(read(&mem, &child, &tlb, addr), b'B');
    assert_eq!(read(&mem, &parent, &tlb, addr), b'A');

    // the parent is the last user of its frame and writes in place
    assert_eq!(
        mem.page_fault(&parent, addr, write()),
        Ok(FaultResolution::Reused)
    );
    assert_eq!(parent.translate(addr).unwrap().frame(), frame);

    mem.destroy_mm(child);
    mem.destroy_mm(parent);
}

#[test]
fn frame_is_reused_after_the_other_side_exits() {
    let (_ram, mem) = manager();
    let tlb = RecordingTlb::default();
    let parent = mem.new_mm().unwrap();
    let addr = parent
        .map(mem.frames(), &tlb, Placement::Anywhere, PAGE_SIZE, VmaFlags::rw(), Backing::Anonymous)
        .unwrap();
    parent.copy_to_user(mem.frames(), &tlb, addr, b"x").unwrap();
    let frame = parent.translate(addr).unwrap().frame();

    let child = mem.fork(&parent).unwrap();
    mem.destroy_mm(child);
    assert_eq!(mem.frames().refcount(frame), 1);

    assert_eq!(
        mem.page_fault(&parent, addr, write()),
        Ok(FaultResolution::Reused)
    );
    assert_eq!(read(&mem, &parent, &tlb, addr), b'x');
}

#[test]
fn shared_areas_stay_shared_and_writable() {
    let (_ram, mem) = manager();
    let tlb = RecordingTlb::default();
    let parent = mem.new_mm().unwrap();
    let addr = parent
        .map(
            mem.frames(),
            &tlb,
            Placement::Anywhere,
            PAGE_SIZE,
            VmaFlags::rw().with_shared(true),
            Backing::Anonymous,
        )
        .unwrap();
    parent.copy_to_user(mem.frames(), &tlb, addr, b"s").unwrap();

    let child = mem.fork(&parent).unwrap();
    assert_eq!(
        mem.page_fault(&child, addr, write()),
        Ok(FaultResolution::Spurious)
    );
    child.copy_to_user(mem.frames(), &tlb, addr, b"t").unwrap();
    assert_eq!(read(&mem, &parent, &tlb, addr), b't');
}

#[test]
fn shared_areas_forked_before_first_touch_are_shared() {
    let (_ram, mem) = manager();
    let tlb = RecordingTlb::default();
    let parent = mem.new_mm().unwrap();
    let addr = parent
        .map(
            mem.frames(),
            &tlb,
            Placement::Anywhere,
            2 * PAGE_SIZE,
            VmaFlags::rw().with_shared(true),
            Backing::Anonymous,
        )
        .unwrap();
    assert_eq!(parent.mapped_pages(), 0);

    let child = mem.fork(&parent).unwrap();
    assert_eq!(parent.mapped_pages(), 2);
    assert_eq!(child.mapped_pages(), 2);
    let second = VirtualAddress::new(addr.as_u64() + PAGE_SIZE);
    assert_eq!(child.translate(second), parent.translate(second));

    child.copy_to_user(mem.frames(), &tlb, addr, b"S").unwrap();
    assert_eq!(read(&mem, &parent, &tlb, addr), b'S');
    parent.copy_to_user(mem.frames(), &tlb, second, b"P").unwrap();
    assert_eq!(read(&mem, &child, &tlb, second), b'P');

    mem.destroy_mm(child);
    mem.destroy_mm(parent);
}

#[test]
fn revoking_access_in_one_space_leaves_the_other_alone() {
    let (_ram, mem) = manager();
    let tlb = RecordingTlb::default();
    let parent = mem.new_mm().unwrap();
    let addr = parent
        .map(
            mem.frames(),
            &tlb,
            Placement::Anywhere,
            PAGE_SIZE,
            VmaFlags::rw().with_shared(true),
            Backing::Anonymous,
        )
        .unwrap();
    parent.copy_to_user(mem.frames(), &tlb, addr, b"k").unwrap();
    let child = mem.fork(&parent).unwrap();

    parent
        .protect(mem.frames(), &tlb, addr, PAGE_SIZE, VmaFlags::new().with_shared(true))
        .unwrap();
    child.copy_to_user(mem.frames(), &tlb, addr, b"c").unwrap();
    parent
        .protect(mem.frames(), &tlb, addr, PAGE_SIZE, VmaFlags::rw().with_shared(true))
        .unwrap();
    assert_eq!(read(&mem, &parent, &tlb, addr), b'c');

    mem.destroy_mm(child);
    mem.destroy_mm(parent);
}

#[test]
fn destroying_both_spaces_returns_every_frame() {
    let (_ram, mem) = manager();
    let tlb = RecordingTlb::default();
    let free = mem.frames().free_count();

    let parent = mem.new_mm().unwrap();
    let addr = parent
        .map(mem.frames(), &tlb, Placement::Anywhere, 8 * PAGE_SIZE, VmaFlags::rw(), Backing::Anonymous)
        .unwrap();
    parent.copy_to_user(mem.frames(), &tlb, addr, &[7u8; 8 * 4096]).unwrap();
    let child = mem.fork(&parent).unwrap();
    child.copy_to_user(mem.frames(), &tlb, addr, &[9u8; 3 * 4096]).unwrap();

    mem.destroy_mm(parent);
    mem.destroy_mm(child);
    assert_eq!(mem.frames().free_count(), free);
}

#[test]
fn unmap_releases_shared_references() {
    let (_ram, mem) = manager();
    let tlb = RecordingTlb::default();
    let parent = mem.new_mm().unwrap();
    let addr = parent
        .map(mem.frames(), &tlb, Placement::Anywhere, PAGE_SIZE, VmaFlags::rw(), Backing::Anonymous)
        .unwrap();
    parent.copy_to_user(mem.frames(), &tlb, addr, b"u").unwrap();
    let frame = parent.translate(addr).unwrap().frame();
    let child = mem.fork(&parent).unwrap();

    assert_eq!(child.unmap(mem.frames(), &tlb, addr, PAGE_SIZE), Ok(1));
    assert_eq!(mem.frames().refcount(frame), 1);
    assert_eq!(child.vma_count(), 0);
    assert!(child.translate(addr).is_none());
    assert_eq!(read(&mem, &parent, &tlb, addr), b'u');
}

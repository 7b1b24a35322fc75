mod common;

use common::{MIB, PHYS_START, Ram};
use kernel_memory_addresses::{FrameRange, PAGE_SIZE, PhysicalAddress, PhysicalFrame};
use kernel_mm::{FrameAllocator, FrameError, FrameState};
use std::sync::{Arc, Barrier};
use std::thread;

fn allocator(ram: &Ram) -> FrameAllocator {
    unsafe { FrameAllocator::init(&ram.boot(), &ram.mapper()) }.expect("frame table")
}

#[test]
fn allocations_avoid_kernel_and_table() {
    let ram = Ram::new(16 * MIB, MIB);
    let frames = allocator(&ram);
    let before = frames.free_count();

    let run = frames.alloc(4).expect("four frames");
    assert_eq!(run.count(), 4);
    assert!(run.start().base().as_u64() >= PHYS_START + MIB);
    for f in run.iter() {
        assert!(!frames.table_frames().contains(f));
        assert_eq!(frames.state(f), Some(FrameState::InUse));
        assert_eq!(frames.refcount(f), 1);
    }
    assert_eq!(frames.free_count(), before - 4);

    frames.free(run).unwrap();
    assert_eq!(frames.free_count(), before);
    assert_eq!(frames.state(run.start()), Some(FrameState::Free));
}

#[test]
fn kernel_image_and_holes_are_reserved() {
    let ram = Ram::new(16 * MIB, MIB);
    let frames = allocator(&ram);
    let kernel = PhysicalFrame::containing(PhysicalAddress::new(PHYS_START));
    assert_eq!(frames.state(kernel), Some(FrameState::Reserved));
    assert_eq!(frames.state(PhysicalFrame::from_number(0)), Some(FrameState::Reserved));
    assert_eq!(frames.state(frames.table_frames().start()), Some(FrameState::Reserved));
    assert_eq!(frames.state(PhysicalFrame::containing(PhysicalAddress::new(ram.end()))), None);
}

#[test]
fn counts_are_conserved() {
    let ram = Ram::new(4 * MIB, 0);
    let frames = allocator(&ram);
    let stats = frames.stats();
    assert_eq!(stats.free + stats.in_use, stats.usable);
    assert_eq!(stats.usable + stats.reserved, stats.total);

    let a = frames.alloc(3).unwrap();
    let b = frames.alloc(1).unwrap();
    let stats = frames.stats();
    assert_eq!(stats.in_use, 4);
    assert_eq!(stats.free + stats.in_use, stats.usable);

    frames.free(a).unwrap();
    frames.free(b).unwrap();
    assert_eq!(frames.stats().in_use, 0);
}

#[test]
fn live_runs_never_overlap() {
    let ram = Ram::new(4 * MIB, 0);
    let frames = allocator(&ram);
    let mut runs: Vec<FrameRange> = (1..=8).filter_map(|n| frames.alloc(n)).collect();
    frames.free(runs.remove(2)).unwrap();
    frames.free(runs.remove(4)).unwrap();
    runs.extend(frames.alloc(2));
    runs.extend(frames.alloc(5));
    for (i, a) in runs.iter().enumerate() {
        for b in &runs[i + 1..] {
            assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
        }
    }
}

#[test]
fn freed_runs_are_reused_first_fit() {
    let ram = Ram::new(4 * MIB, 0);
    let frames = allocator(&ram);
    let a = frames.alloc(2).unwrap();
    let _b = frames.alloc(2).unwrap();
    frames.free(a).unwrap();
    assert_eq!(frames.alloc(1).unwrap().start(), a.start());
}

#[test]
fn zero_count_is_empty_and_oversized_fails() {
    let ram = Ram::new(4 * MIB, 0);
    let frames = allocator(&ram);
    assert!(frames.try_alloc(0).unwrap().is_empty());
    let too_many = frames.total_count() + 1;
    assert_eq!(frames.try_alloc(too_many), Err(FrameError::CountOutOfBounds(too_many)));
    let free = frames.free_count();
    assert_eq!(frames.try_alloc(free + 1), Err(FrameError::Exhausted(free + 1)));
    assert!(frames.alloc(free + 1).is_none());
}

#[test]
fn exhaustion_and_recovery() {
    let ram = Ram::new(MIB, 0);
    let frames = allocator(&ram);
    let mut all = Vec::new();
    while let Some(f) = frames.alloc(1) {
        all.push(f);
    }
    assert_eq!(frames.free_count(), 0);
    assert_eq!(all.len(), frames.usable_count());
    frames.free(all.pop().unwrap()).unwrap();
    assert!(frames.alloc(1).is_some());
}

#[test]
fn shared_frames_are_freed_by_the_last_reference() {
    let ram = Ram::new(4 * MIB, 0);
    let frames = allocator(&ram);
    let f = frames.alloc(1).unwrap().start();
    assert_eq!(frames.incref(f), Ok(2));
    assert_eq!(frames.decref(f), Ok(1));
    assert_eq!(frames.state(f), Some(FrameState::InUse));
    assert_eq!(frames.decref(f), Ok(0));
    assert_eq!(frames.state(f), Some(FrameState::Free));
    assert_eq!(frames.incref(f), Err(FrameError::NotAllocated(f)));
}

#[test]
fn frames_outside_the_table_are_rejected() {
    let ram = Ram::new(MIB, 0);
    let frames = allocator(&ram);
    let outside = PhysicalFrame::containing(PhysicalAddress::new(ram.end() + 16 * PAGE_SIZE));
    assert_eq!(frames.incref(outside), Err(FrameError::OutOfTable(outside)));
    assert_eq!(frames.refcount(outside), 0);
}

#[test]
#[cfg_attr(debug_assertions, should_panic(expected = "freeing"))]
fn double_free_is_rejected() {
    let ram = Ram::new(MIB, 0);
    let frames = allocator(&ram);
    let run = frames.alloc(1).unwrap();
    frames.free(run).unwrap();
    let before = frames.free_count();
    assert_eq!(frames.free(run), Err(FrameError::NotAllocated(run.start())));
    assert_eq!(frames.free_count(), before);
}

#[test]
fn concurrent_decref_frees_once() {
    const THREADS: usize = 8;
    let ram = Ram::new(4 * MIB, 0);
    let frames = Arc::new(allocator(&ram));
    let before = frames.free_count();
    let run = frames.alloc(16).unwrap();
    for f in run.iter() {
        for _ in 1..THREADS {
            frames.incref(f).unwrap();
        }
    }

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let frames = Arc::clone(&frames);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for f in run.iter() {
                    frames.decref(f).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(frames.free_count(), before);
    assert!(run.iter().all(|f| frames.state(f) == Some(FrameState::Free)));
    // the free list is still address ordered and complete
    let again = frames.alloc(16).unwrap();
    assert_eq!(again.start(), run.start());
}

#[test]
fn scattered_frees_keep_the_list_ordered() {
    let ram = Ram::new(16 * MIB, MIB);
    let frames = allocator(&ram);
    let usable = frames.free_count();
    let all: Vec<PhysicalFrame> = (0..usable).map(|_| frames.alloc(1).unwrap().start()).collect();
    assert_eq!(frames.free_count(), 0);

    // high frames first, then every third from the bottom, then the rest
    let order = all
        .iter()
        .rev()
        .step_by(7)
        .chain(all.iter().step_by(3))
        .chain(all.iter());
    for &f in order {
        if frames.state(f) == Some(FrameState::InUse) {
            frames.free(FrameRange::single(f)).unwrap();
        }
    }
    assert_eq!(frames.free_count(), usable);

    // first fit hands the frames back lowest first
    let again: Vec<PhysicalFrame> = (0..usable).map(|_| frames.alloc(1).unwrap().start()).collect();
    assert_eq!(again, all);
}

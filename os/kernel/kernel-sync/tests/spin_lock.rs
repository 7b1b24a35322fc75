use kernel_sync::SpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let free_frames = SpinLock::new(vec![3u64, 2, 1]);
    let top = free_frames.lock().pop();
    assert_eq!(top, Some(1));

    // the temporary guard above is gone
    let mut g = free_frames.lock();
    g.push(9);
    assert_eq!(g.as_slice(), &[3, 2, 9]);
}

#[test]
fn try_lock_fails_fast_while_held() {
    let heap = SpinLock::new(0usize);
    let held = heap.lock();
    assert!(heap.try_lock().is_none());
    assert!(heap.is_locked());
    drop(held);

    let mut g = heap.try_lock().expect("lock is free again");
    *g += 16;
    drop(g);
    assert_eq!(heap.with_lock(|v| *v), 16);
}

#[test]
fn exclusive_access_needs_no_locking() {
    let mut l = SpinLock::new([0u8; 4]);
    l.get_mut()[2] = 7;
    assert!(!l.is_locked());
    assert_eq!(l.into_inner(), [0, 0, 7, 0]);
}

#[test]
fn refcount_updates_are_serialized() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 5_000;

    let counts = Arc::new(SpinLock::new(vec![0u32; 4]));
    let inside = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let counts = Arc::clone(&counts);
            let inside = Arc::clone(&inside);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for i in 0..ROUNDS {
                    counts.with_lock(|c| {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "two holders");
                        c[(t + i) % 4] += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let total: u32 = counts.with_lock(|c| c.iter().sum());
    assert_eq!(total as usize, THREADS * ROUNDS);
}

#[test]
fn panicking_holder_still_unlocks() {
    let l = SpinLock::new(1u32);
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let mut g = l.lock();
        *g = 2;
        panic!("holder died");
    }));
    assert!(res.is_err());
    assert!(!l.is_locked());
    assert_eq!(*l.lock(), 2);
}

#[test]
fn lock_irq_guards_data_and_releases() {
    let l = SpinLock::new(7u32);
    {
        let mut g = l.lock_irq();
        *g += 1;
        assert!(l.is_locked());
        assert!(l.try_lock().is_none());
    }
    assert!(!l.is_locked());
    assert_eq!(l.into_inner(), 8);
}

#[test]
fn irq_guard_nests_without_reenabling() {
    use kernel_sync::irq::{IrqGuard, interrupts_enabled};

    // Hosted builds cannot enable interrupts, so no guard may claim to restore them.
    let outer = IrqGuard::new();
    let inner = IrqGuard::new();
    assert!(!inner.restores());
    drop(inner);
    assert!(!interrupts_enabled());
    drop(outer);
}

#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    takes_sync(&SpinLock::new(0u8));
}

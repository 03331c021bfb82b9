//! Wakeup behavior of parked transactions
//!
//! A transaction parked in `retry` may only be woken by a commit to a lock
//! slot it has read. Commits from other tests would wake it legitimately
//! whenever their atoms share a slot, so these tests run one at a time in
//! their own binary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use trade::collections::Queue;
use trade::*;

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn unrelated_commit_does_not_wake() {
    let _serial = serial();

    let watched = Arc::new(Atom::new(0u32));
    let candidates: Vec<Atom<u32>> = (0..4).map(|_| Atom::new(0)).collect();
    let other = candidates
        .iter()
        .find(|atom| atom.lock_index() != watched.lock_index())
        .unwrap();
    assert_ne!(other.lock_index(), watched.lock_index());

    let attempts = Arc::new(AtomicUsize::new(0));
    let waiter = {
        let watched = watched.clone();
        let attempts = attempts.clone();
        thread::spawn(move || {
            atomically(Heap::default(), |tx| {
                attempts.fetch_add(1, Ordering::SeqCst);
                let x = watched.load(tx)?;
                guard(x != 0)?;
                Ok(x)
            })
        })
    };

    // Let the waiter park.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    for i in 1..=50 {
        atomically(Stack::<128>, |tx| other.store(tx, i));
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    atomically(Stack::<128>, |tx| watched.store(tx, 7));
    assert_eq!(waiter.join().unwrap(), 7);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn empty_pops_do_not_wake() {
    let _serial = serial();

    let queue: Arc<Queue<u32>> = Arc::new(Queue::new());
    let attempts = Arc::new(AtomicUsize::new(0));
    let waiter = {
        let queue = queue.clone();
        let attempts = attempts.clone();
        thread::spawn(move || {
            atomically(Heap::default(), |tx| {
                attempts.fetch_add(1, Ordering::SeqCst);
                queue.pop_front(tx)
            })
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    for _ in 0..50 {
        let popped = atomically(Heap::default(), |tx| queue.try_pop_front(tx));
        assert_eq!(popped, None);
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    atomically(Heap::default(), |tx| queue.push_back(tx, 9));
    assert_eq!(waiter.join().unwrap(), 9);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

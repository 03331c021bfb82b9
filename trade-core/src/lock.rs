// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The striped lock table and the global commit clock.
//!
//! Every atom maps to one of `LOCK_COUNT` slots by its address. A slot holds
//! a version word: an unlocked slot stores the clock value of the last commit
//! that wrote one of its atoms, a locked slot stores the bitwise complement
//! of that version. Complemented versions have the top bit set, so a locked
//! slot always compares greater than any transaction start time.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use super::backoff::Backoff;
use super::transaction::control_block::ControlBlock;

pub type Clock = u64;

/// Number of slots. A prime spreads aligned addresses evenly.
pub const LOCK_COUNT: usize = 251;

const LOCKED_BIT: Clock = 1 << 63;

/// The global clock. It is advanced once per successful writing commit.
static CLOCK: CachePadded<AtomicU64> = CachePadded::new(AtomicU64::new(0));

#[allow(clippy::declare_interior_mutable_const)]
const UNLOCKED: CachePadded<Lock> = CachePadded::new(Lock::new());

static LOCKS: [CachePadded<Lock>; LOCK_COUNT] = [UNLOCKED; LOCK_COUNT];

/// Snapshot of the global clock.
pub fn now() -> Clock {
    CLOCK.load(Ordering::Acquire)
}

/// Advance the global clock and return its previous value.
pub fn tick() -> Clock {
    CLOCK.fetch_add(1, Ordering::AcqRel)
}

/// Slot index for the atom at `address`.
pub fn index_of(address: usize) -> u16 {
    (address % LOCK_COUNT) as u16
}

pub fn lock(index: u16) -> &'static Lock {
    &LOCKS[index as usize]
}

pub fn is_locked(version: Clock) -> bool {
    version & LOCKED_BIT != 0
}

/// One slot of the lock table.
pub struct Lock {
    version: AtomicU64,

    /// Parked transactions waiting for a commit to this slot.
    ///
    /// Only touched by the holder of the slot.
    waiters: UnsafeCell<Vec<Arc<ControlBlock>>>,
}

// The waiter list is guarded by the version word.
unsafe impl Sync for Lock {}

impl Lock {
    pub const fn new() -> Lock {
        Lock {
            version: AtomicU64::new(0),
            waiters: UnsafeCell::new(Vec::new()),
        }
    }

    /// The current version word. Locked slots return a complemented value
    /// that is greater than every clock value.
    pub fn version(&self) -> Clock {
        self.version.load(Ordering::Acquire)
    }

    /// Try once to lock the slot, provided its version is not newer than
    /// `max`. Fails if the slot is locked or has advanced.
    pub fn try_lock(&self, max: Clock) -> bool {
        let version = self.version.load(Ordering::Relaxed);
        max >= version
            && self
                .version
                .compare_exchange(version, !version, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    /// Lock the slot, spinning while someone else holds it, unless its
    /// version advances past `max`.
    pub fn lock_at_most(&self, max: Clock) -> Option<SlotGuard<'_>> {
        let mut backoff = Backoff::new();
        loop {
            let version = self.version.load(Ordering::Relaxed);
            if is_locked(version) {
                backoff.spin();
                continue;
            }
            if max < version {
                return None;
            }
            if self
                .version
                .compare_exchange_weak(version, !version, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(SlotGuard { lock: self, prior: version });
            }
            backoff.spin();
        }
    }

    /// Lock the slot whatever its version is.
    pub fn lock(&self) -> SlotGuard<'_> {
        loop {
            if let Some(guard) = self.lock_at_most(!LOCKED_BIT) {
                return guard;
            }
        }
    }

    /// Take over a slot that was locked with `try_lock`.
    ///
    /// # Safety
    ///
    /// The caller must hold the slot and give up its own claim to it.
    pub unsafe fn held(&self) -> SlotGuard<'_> {
        let prior = !self.version.load(Ordering::Relaxed);
        SlotGuard { lock: self, prior }
    }
}

/// Exclusive access to a locked slot.
///
/// Dropping the guard restores the version the slot had before it was
/// locked. `release_at` publishes a new version instead.
pub struct SlotGuard<'a> {
    lock: &'a Lock,
    prior: Clock,
}

impl<'a> SlotGuard<'a> {
    /// The version the slot had before it was locked.
    #[cfg(test)]
    pub fn prior(&self) -> Clock {
        self.prior
    }

    pub fn waiters(&mut self) -> &mut Vec<Arc<ControlBlock>> {
        // The guard proves that we hold the slot.
        unsafe { &mut *self.lock.waiters.get() }
    }

    /// Wake all parked waiters and unlock the slot at `version`.
    pub fn release_at(mut self, version: Clock) {
        for waiter in self.waiters().drain(..) {
            waiter.set_changed();
        }
        self.lock.version.store(version, Ordering::Release);
        mem::forget(self);
    }
}

impl<'a> Drop for SlotGuard<'a> {
    fn drop(&mut self) {
        self.lock.version.store(self.prior, Ordering::Release);
    }
}

/// Set of slot indices, used to track the slots a transaction holds or
/// waits on.
#[derive(Clone, Default, Debug)]
pub struct SlotSet {
    bits: [u64; (LOCK_COUNT + 63) / 64],
}

impl SlotSet {
    pub fn new() -> SlotSet {
        SlotSet::default()
    }

    /// Add `index`, returning `true` if it was not yet present.
    pub fn insert(&mut self, index: u16) -> bool {
        let (word, bit) = (index as usize / 64, index as usize % 64);
        let fresh = self.bits[word] & (1 << bit) == 0;
        self.bits[word] |= 1 << bit;
        fresh
    }

    pub fn contains(&self, index: u16) -> bool {
        let (word, bit) = (index as usize / 64, index as usize % 64);
        self.bits[word] & (1 << bit) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&word| word == 0)
    }

    /// Indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..LOCK_COUNT as u16).filter(move |&index| self.contains(index))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // The global table is shared by all tests running in parallel, so
    // these tests work on private locks.

    #[test]
    fn index_in_range() {
        for address in [0usize, 8, 250, 251, 4096, usize::MAX] {
            assert!((index_of(address) as usize) < LOCK_COUNT);
        }
        assert_eq!(index_of(251), 0);
        assert_eq!(index_of(252), 1);
    }

    #[test]
    fn locked_compares_newer() {
        assert!(is_locked(!0));
        assert!(is_locked(!12345));
        assert!(!is_locked(12345));
        assert!(!12345u64 > now() + 1_000_000);
    }

    #[test]
    fn guard_restores_version() {
        let lock = Lock::new();
        lock.version.store(7, Ordering::Relaxed);
        {
            let guard = lock.lock();
            assert_eq!(guard.prior(), 7);
            assert!(is_locked(lock.version()));
            assert!(!lock.try_lock(Clock::MAX >> 1));
        }
        assert_eq!(lock.version(), 7);
    }

    #[test]
    fn lock_at_most_rejects_newer() {
        let lock = Lock::new();
        lock.version.store(10, Ordering::Relaxed);
        assert!(lock.lock_at_most(9).is_none());
        assert!(lock.lock_at_most(10).is_some());
        assert_eq!(lock.version(), 10);
    }

    #[test]
    fn release_wakes_waiters() {
        let lock = Lock::new();
        let ctrl = Arc::new(ControlBlock::new());
        {
            let mut guard = lock.lock();
            guard.waiters().push(ctrl.clone());
        }
        assert!(!ctrl.is_changed());

        assert!(lock.try_lock(0));
        let mut guard = unsafe { lock.held() };
        assert_eq!(guard.prior(), 0);
        assert_eq!(guard.waiters().len(), 1);
        guard.release_at(3);

        assert!(ctrl.is_changed());
        assert_eq!(lock.version(), 3);
        assert!(lock.lock().waiters().is_empty());
    }

    #[test]
    fn slot_set() {
        let mut set = SlotSet::new();
        assert!(set.is_empty());
        assert!(set.insert(250));
        assert!(set.insert(3));
        assert!(!set.insert(3));
        assert!(set.contains(250));
        assert!(!set.contains(4));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 250]);
    }
}

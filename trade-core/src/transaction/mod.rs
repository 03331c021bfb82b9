// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

pub mod control_block;
pub mod log;

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use self::control_block::ControlBlock;
use self::log::{Log, INITIAL, READ, WRITTEN};
use super::atom::{Atom, AtomValue};
use super::backoff::Backoff;
use super::config::{Buffer, Config};
use super::lock::{self, Clock, SlotSet};
use super::result::*;

thread_local!(static TRANSACTION_RUNNING: Cell<bool> = Cell::new(false));

/// `TransactionGuard` checks against nested STM calls.
///
/// Use guard, so that it correctly marks the Transaction as finished.
struct TransactionGuard;

impl TransactionGuard {
    pub fn new() -> TransactionGuard {
        TRANSACTION_RUNNING.with(|t| {
            assert!(!t.get(), "STM: Nested Transaction");
            t.set(true);
        });
        TransactionGuard
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        TRANSACTION_RUNNING.with(|t| {
            t.set(false);
        });
    }
}

/// Transaction tracks all the read and written atoms of one attempt.
///
/// It is handed to the action of `atomically` and has to be passed on to
/// every function that takes part in the transaction. Atoms used with it
/// must outlive the whole `atomically` call.
pub struct Transaction<'a> {
    log: Log,

    /// Global clock at the start of the attempt.
    start: Clock,

    /// First engine failure of the attempt.
    ///
    /// It overrides whatever the action returns, so an action that swallows
    /// an error can not commit.
    failure: Option<StmError>,

    /// Set once any record has been written.
    dirty: bool,

    // Invariant in 'a, neither Send nor Sync.
    _marker: PhantomData<(fn(&'a ()) -> &'a (), *mut ())>,
}

impl<'a> Transaction<'a> {
    fn new() -> Transaction<'a> {
        Transaction {
            log: Log::new(),
            start: 0,
            failure: None,
            dirty: false,
            _marker: PhantomData,
        }
    }

    /// Run `f` until it commits.
    ///
    /// The log lives in the buffer of `config`. Conflicts restart the
    /// attempt, retries park until a read atom changes.
    pub(crate) fn run<C, T, E, F>(config: C, f: F) -> Result<T, Error<E>>
    where
        C: Config,
        F: Fn(&mut Transaction<'a>) -> TransactionResult<T, E>,
    {
        let _guard = TransactionGuard::new();

        let mut buffer = config.into_buffer();
        // Declared after the buffer, so the log is destroyed first.
        let mut transaction = Transaction::new();
        let mut backoff = Backoff::new();

        loop {
            let (base, capacity) = buffer.region();
            transaction.begin(base, capacity);

            let result = f(&mut transaction);
            let signal = match (result, transaction.failure.take()) {
                (_, Some(failure)) => failure,
                (Ok(value), None) => {
                    if transaction.commit() {
                        return Ok(value);
                    }
                    StmError::Conflict
                }
                (Err(TransactionError::Abort(error)), None) => return Err(Error::Aborted(error)),
                (Err(TransactionError::Stm(signal)), None) => signal,
            };

            match signal {
                StmError::Conflict => {
                    trace!(start = transaction.start, "transaction conflict, restarting");
                    transaction.log.destroy();
                    backoff.spin();
                }
                StmError::Retry if transaction.log.is_logging() => {
                    transaction.wait_for_change();
                    backoff.reset();
                }
                StmError::Retry | StmError::LogExhausted => {
                    transaction.log.destroy();
                    if !buffer.grow() {
                        return Err(Error::LogExhausted {
                            capacity: buffer.capacity(),
                        });
                    }
                    if capacity == 0 {
                        debug!(capacity = buffer.capacity(), "read-only transaction needs a log");
                    } else {
                        debug!(capacity = buffer.capacity(), "transaction log grown");
                    }
                }
            }
        }
    }

    /// Start a new attempt in the given region.
    fn begin(&mut self, base: *mut u8, capacity: usize) {
        self.log.reset(base, capacity);
        self.start = lock::now();
        self.failure = None;
        self.dirty = false;
    }

    /// Remember the first failure of the attempt.
    fn fail(&mut self, error: StmError) -> StmError {
        *self.failure.get_or_insert(error)
    }

    fn check(&self) -> StmResult<()> {
        match self.failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Read an atom.
    ///
    /// The first read of an atom is validated against the start of the
    /// attempt, later reads return the logged value. A pending write is
    /// returned as is.
    pub fn load<V: AtomValue>(&mut self, atom: &'a Atom<V>) -> StmResult<V> {
        self.check()?;
        if !self.log.is_logging() {
            return atom.load_at(self.start).map_err(|e| self.fail(e));
        }

        let link = self.log.insert(atom).map_err(|e| self.fail(e))?;
        // Safety: `link` belongs to this atom.
        let record = unsafe { self.log.record::<V>(link) };
        if record.state() == INITIAL {
            match atom.load_at(self.start) {
                Ok(value) => {
                    record.set(value);
                    record.mark(READ);
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
        Ok(record.get().clone())
    }

    /// Write an atom.
    ///
    /// The write is not visible to other threads until the transaction
    /// commits.
    pub fn store<V: AtomValue>(&mut self, atom: &'a Atom<V>, value: V) -> StmResult<()> {
        self.check()?;
        if !self.log.is_logging() {
            return Err(self.fail(StmError::LogExhausted));
        }

        let link = self.log.insert(atom).map_err(|e| self.fail(e))?;
        self.dirty = true;
        // Safety: `link` belongs to this atom.
        let record = unsafe { self.log.record::<V>(link) };
        record.set(value);
        record.mark(WRITTEN);
        Ok(())
    }

    /// Get a mutable reference to the pending value of an atom.
    ///
    /// The atom is read first unless it was already accessed, and the read
    /// stays part of the validation at commit.
    pub fn ref_mut<'t, V: AtomValue>(&'t mut self, atom: &'a Atom<V>) -> StmResult<&'t mut V> {
        self.check()?;
        if !self.log.is_logging() {
            return Err(self.fail(StmError::LogExhausted));
        }

        let link = self.log.insert(atom).map_err(|e| self.fail(e))?;
        // Safety: `link` belongs to this atom.
        if unsafe { self.log.record::<V>(link) }.state() == INITIAL {
            let value = atom.load_at(self.start).map_err(|e| self.fail(e))?;
            let record = unsafe { self.log.record::<V>(link) };
            record.set(value);
            record.mark(READ);
        }
        self.dirty = true;
        let record = unsafe { self.log.record::<V>(link) };
        record.mark(WRITTEN);
        Ok(record.get())
    }

    /// Write the log back to the atoms.
    ///
    /// Return true for success and false, if a read atom has changed.
    fn commit(&mut self) -> bool {
        // Readers validated every load against `start` already.
        if !self.log.is_logging() || !self.dirty {
            return true;
        }

        // First phase: lock the written slots in ascending order.
        let head = self.log.drain();
        let start = self.start;
        let mut held = SlotSet::new();
        let mut valid = true;
        for header in self.log.chain(head) {
            // Safety: chain entries are live records.
            let header = unsafe { &*header };
            if !header.is_written() || held.contains(header.lock_index()) {
                continue;
            }
            if !lock::lock(header.lock_index()).try_lock(start) {
                valid = false;
                break;
            }
            held.insert(header.lock_index());
        }

        if valid {
            let commit = lock::tick();
            // Somebody committed since we started. Check the reads again.
            if commit != start {
                valid = self.log.chain(head).all(|header| {
                    let header = unsafe { &*header };
                    !header.is_read()
                        || held.contains(header.lock_index())
                        || lock::lock(header.lock_index()).version() <= start
                });
            }

            if valid {
                // Second phase: publish and release.
                for header in self.log.chain(head) {
                    let header = unsafe { &mut *header };
                    if header.is_written() {
                        // Safety: we hold the slot.
                        unsafe { header.publish() };
                    }
                }
                for index in held.iter() {
                    // Safety: locked above.
                    unsafe { lock::lock(index).held() }.release_at(commit + 1);
                }
                trace!(start, version = commit + 1, records = self.log.len(), "transaction committed");
                return true;
            }
        }

        for index in held.iter() {
            drop(unsafe { lock::lock(index).held() });
        }
        false
    }

    /// Wait for any read atom to change,
    /// because the change may lead to a new calculation result.
    fn wait_for_change(&mut self) {
        // Create control block for waiting.
        let ctrl = Arc::new(ControlBlock::new());

        let head = self.log.drain();
        let start = self.start;
        let mut watched = SlotSet::new();
        let mut changed = false;
        for header in self.log.chain(head) {
            let header = unsafe { &*header };
            let index = header.lock_index();
            if !header.is_read() || watched.contains(index) {
                continue;
            }
            match lock::lock(index).lock_at_most(start) {
                Some(mut guard) => {
                    guard.waiters().push(ctrl.clone());
                    watched.insert(index);
                }
                // Already changed, no need to sleep.
                None => {
                    changed = true;
                    break;
                }
            }
        }
        self.log.destroy();

        if !changed {
            if watched.is_empty() {
                warn!("retry without any read atom, blocking forever");
            }
            ctrl.wait();
        }

        // Let others know that ctrl is dead.
        for index in watched.iter() {
            let mut guard = lock::lock(index).lock();
            guard.waiters().retain(|waiter| !Arc::ptr_eq(waiter, &ctrl));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{Heap, Stack, ASSUME_READONLY};

    fn run<'a, T, F>(f: F) -> T
    where
        F: Fn(&mut Transaction<'a>) -> StmResult<T>,
    {
        match Transaction::run::<_, T, std::convert::Infallible, _>(Heap::default(), |tx| {
            f(tx).map_err(TransactionError::from)
        }) {
            Ok(t) => t,
            Err(e) => panic!("{}", e),
        }
    }

    #[test]
    fn load() {
        let atom = Atom::new(vec![1, 2, 3, 4]);

        // The atom can be read.
        assert_eq!(run(|tx| tx.load(&atom)), [1, 2, 3, 4]);
    }

    #[test]
    fn store_load() {
        let atom = Atom::new(vec![1, 2]);

        let x = run(|tx| {
            tx.store(&atom, vec![1, 2, 3, 4])?;

            // Consecutive reads get the updated version.
            let x = tx.load(&atom)?;

            // The original value is still preserved.
            assert_eq!(atom.unsafe_load(), [1, 2]);
            Ok(x)
        });
        assert_eq!(x, [1, 2, 3, 4]);
    }

    #[test]
    fn transaction_simple() {
        let x = run(|_| Ok(42));
        assert_eq!(x, 42);
    }

    #[test]
    fn transaction_store() {
        let atom = Atom::new(42);

        run(|tx| tx.store(&atom, 0));

        assert_eq!(atom.unsafe_load(), 0);
    }

    #[test]
    fn transaction_copy() {
        let read = Atom::new(42);
        let write = Atom::new(0);

        run(|tx| {
            let r = tx.load(&read)?;
            tx.store(&write, r)
        });

        assert_eq!(write.unsafe_load(), 42);
    }

    #[test]
    fn ref_mut_keeps_read() {
        let atom = Atom::new(String::from("trade"));

        run(|tx| {
            tx.ref_mut(&atom)?.push_str("-core");
            assert_eq!(tx.load(&atom)?, "trade-core");
            Ok(())
        });

        assert_eq!(atom.unsafe_load(), "trade-core");
    }

    #[test]
    fn commit_advances_clock() {
        let atom = Atom::new(7u64);
        let before = lock::now();
        run(|tx| tx.store(&atom, 8));
        assert!(lock::now() > before);
        assert_eq!(atom.unsafe_load(), 8);
    }

    #[test]
    fn swallowed_failure_does_not_commit() {
        let atom = Atom::new(1);
        let attempts = Cell::new(0);

        let x = Transaction::run::<_, _, (), _>(Stack::<0>, |tx| {
            attempts.set(attempts.get() + 1);
            // The store fails without a log. Ignoring that must not help.
            let _ = tx.store(&atom, 2);
            Ok(5)
        });

        assert_eq!(x, Err(Error::LogExhausted { capacity: 0 }));
        assert_eq!(attempts.get(), 1);
        assert_eq!(atom.unsafe_load(), 1);
    }

    #[test]
    fn readonly_escalates_on_store() {
        let atom = Atom::new(1);
        let attempts = Cell::new(0);

        let x = Transaction::run::<_, _, (), _>(ASSUME_READONLY, |tx| {
            attempts.set(attempts.get() + 1);
            let x = tx.load(&atom)?;
            tx.store(&atom, x + 1)?;
            Ok(x)
        });

        assert_eq!(x, Ok(1));
        assert_eq!(attempts.get(), 2);
        assert_eq!(atom.unsafe_load(), 2);
    }

    #[test]
    fn heap_grows() {
        let atoms: Vec<Atom<usize>> = (0..100).map(Atom::new).collect();

        let sum = run(|tx| {
            let mut sum = 0;
            for atom in &atoms {
                sum += tx.load(atom)?;
                tx.store(atom, 0)?;
            }
            Ok(sum)
        });

        assert_eq!(sum, 4950);
        assert!(atoms.iter().all(|atom| atom.unsafe_load() == 0));
    }

    #[test]
    fn abort_discards_writes() {
        let atom = Atom::new(1);

        let x = Transaction::run(Heap::default(), |tx| {
            tx.store(&atom, 2)?;
            abort::<(), _>("no")
        });

        assert_eq!(x, Err(Error::Aborted("no")));
        assert_eq!(atom.unsafe_load(), 1);
    }

    /// Test if nested transactions are correctly detected.
    #[test]
    #[should_panic]
    fn transaction_nested_fail() {
        run(|_| {
            run(|_| Ok(42));
            Ok(1)
        });
    }
}

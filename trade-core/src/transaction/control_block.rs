// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

/// A control block for a parked transaction.
///
/// On `retry` the transaction links one control block into the waiter list
/// of every lock slot it has read. The first commit to any of those slots
/// flags it and wakes the thread.
pub struct ControlBlock {
    /// `true` once some watched slot has changed.
    ///
    /// It is checked before taking the mutex, so that a committer releasing
    /// several slots does not lock the same block twice.
    changed: AtomicBool,

    /// A lock needed for the condition variable.
    lock: Mutex<()>,

    /// Condition variable that is used for pausing and
    /// waking the thread.
    wait_cvar: Condvar,
}

impl ControlBlock {
    /// Create a new, unsignaled control block.
    pub fn new() -> ControlBlock {
        ControlBlock {
            changed: AtomicBool::new(false),
            lock: Mutex::new(()),
            wait_cvar: Condvar::new(),
        }
    }

    /// Inform the control block that a watched slot has changed.
    ///
    /// Signaling is idempotent: only the first call wakes the thread.
    pub fn set_changed(&self) {
        if self.changed.load(Ordering::Acquire) {
            return;
        }
        {
            let _guard = self.lock.lock();
            self.changed.store(true, Ordering::Release);
        }
        self.wait_cvar.notify_all();
    }

    #[cfg(test)]
    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    /// Block until a watched slot has changed.
    ///
    /// `wait` returns immediately if that already happened.
    pub fn wait(&self) {
        let mut guard = self.lock.lock();
        while !self.changed.load(Ordering::Acquire) {
            self.wait_cvar.wait(&mut guard);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::{terminates, terminates_async};
    use std::sync::Arc;

    /// Test if ControlBlock correctly blocks on `wait`.
    #[test]
    fn blocked() {
        let ctrl = ControlBlock::new();
        assert!(!terminates(100, move || ctrl.wait()));
    }

    /// A ControlBlock does immediately return,
    /// when it was set to changed before calling waiting.
    ///
    /// This can occur, when a slot changes while the
    /// transaction is still registering on other slots.
    #[test]
    fn wait_after_change() {
        let ctrl = ControlBlock::new();
        ctrl.set_changed();
        assert!(terminates(50, move || ctrl.wait()));
    }

    /// Test calling `set_changed` multiple times.
    #[test]
    fn wait_after_multiple_changes() {
        let ctrl = ControlBlock::new();
        ctrl.set_changed();
        ctrl.set_changed();
        ctrl.set_changed();
        assert!(ctrl.is_changed());
        assert!(terminates(50, move || ctrl.wait()));
    }

    /// Perform a wakeup from another thread.
    #[test]
    fn wait_threaded_wakeup() {
        let ctrl = Arc::new(ControlBlock::new());
        let ctrl2 = ctrl.clone();
        let terminated = terminates_async(500, move || ctrl.wait(), move || ctrl2.set_changed());

        assert!(terminated);
    }
}

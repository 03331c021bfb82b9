// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use trade_core::*;

use super::List;

// Queue is implemented using two lists (`front` and `back`).
// `push_back` writes to the beginning of `back` and `pop_front` reads from
// the beginning of `front`. If `front` is empty, the reversed list `back`
// is used as a new list. This way all operations are amortized constant time.

/// `Queue` is a threadsafe FIFO queue.
///
/// It is similar to channels, but undoes operations in
/// case of aborted transactions.
///
/// # Example
///
/// ```
/// use trade::*;
/// use trade::collections::Queue;
///
/// let queue = Queue::new();
/// let x = atomically(Heap::default(), |tx| {
///     queue.push_back(tx, 42)?;
///     queue.pop_front(tx)
/// });
/// assert_eq!(x, 42);
/// ```
#[derive(Debug)]
pub struct Queue<T: Clone + Send + Sync + 'static> {
    front: Atom<List<T>>,
    back: Atom<List<T>>,
    len: Atom<usize>,
}

impl<T: Clone + Send + Sync + 'static> Queue<T> {
    /// Create a new queue.
    pub fn new() -> Queue<T> {
        Queue {
            front: Atom::new(List::new()),
            back: Atom::new(List::new()),
            len: Atom::new(0),
        }
    }

    /// Create a queue holding the values in iteration order.
    pub fn from_values<I: IntoIterator<Item = T>>(values: I) -> Queue<T> {
        let back: List<T> = values.into_iter().collect();
        let len = back.len();
        Queue {
            front: Atom::new(List::new()),
            back: Atom::new(back),
            len: Atom::new(len),
        }
    }

    /// Add a new element to the end of the queue.
    pub fn push_back<'a>(&'a self, tx: &mut Transaction<'a>, value: T) -> StmResult<()> {
        self.back.modify(tx, |back| back.prepend(value))?;
        self.len.modify(tx, |n| n + 1)
    }

    /// Push a value to the front of the queue. Next call to `pop_front`
    /// will return `value`.
    pub fn push_front<'a>(&'a self, tx: &mut Transaction<'a>, value: T) -> StmResult<()> {
        self.front.modify(tx, |front| front.prepend(value))?;
        self.len.modify(tx, |n| n + 1)
    }

    /// Remove the first element, if any.
    pub fn try_pop_front<'a>(&'a self, tx: &mut Transaction<'a>) -> StmResult<Option<T>> {
        let (value, front) = match self.front.load(tx)?.into_split() {
            Some(split) => split,
            // Only take `back` over when it has something, an empty pop
            // must stay read-only.
            None => match self.back.load(tx)?.reverse().into_split() {
                Some(split) => {
                    self.back.store(tx, List::new())?;
                    split
                }
                None => return Ok(None),
            },
        };
        self.front.store(tx, front)?;
        self.len.modify(tx, |n| n - 1)?;
        Ok(Some(value))
    }

    /// Remove the first element. Retries while the queue is empty.
    pub fn pop_front<'a>(&'a self, tx: &mut Transaction<'a>) -> StmResult<T> {
        unwrap_or_retry(self.try_pop_front(tx)?)
    }

    /// Number of elements in the queue.
    pub fn len<'a>(&'a self, tx: &mut Transaction<'a>) -> StmResult<usize> {
        self.len.load(tx)
    }

    /// Check if a queue is empty.
    pub fn is_empty<'a>(&'a self, tx: &mut Transaction<'a>) -> StmResult<bool> {
        Ok(self.len(tx)? == 0)
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Queue<T> {
    fn default() -> Queue<T> {
        Queue::new()
    }
}

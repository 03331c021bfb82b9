// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Storage for the transaction log.
//!
//! Every call to `atomically` picks where its log lives:
//!
//! * `Stack::<N>` keeps the log in an inline buffer of `N` bytes. Nothing is
//!   allocated, but a transaction touching too many atoms fails with
//!   `Error::LogExhausted`.
//! * `Heap::new(n)` starts with `n` bytes on the heap and doubles whenever
//!   an attempt runs out of space.
//! * `ASSUME_READONLY` starts without a log at all. Reads are validated on
//!   the fly; the first write or `retry` restarts the attempt with a log.

use std::mem::{self, MaybeUninit};

use super::transaction::log::Record;

/// Smallest heap log. Room for a handful of small records.
pub const MIN_HEAP: usize = 8 * mem::size_of::<Record<usize>>();

/// Selects the log storage of a transaction.
pub trait Config {
    type Buffer: Buffer;

    fn into_buffer(self) -> Self::Buffer;
}

/// Memory region backing a transaction log.
///
/// The region must stay in place until the next call to `region` or
/// `grow`.
pub trait Buffer {
    /// Start and length of the usable region.
    fn region(&mut self) -> (*mut u8, usize);

    fn capacity(&self) -> usize;

    /// Make the region larger. Returns `false` if the size is fixed.
    fn grow(&mut self) -> bool;
}

/// Fixed log of `N` bytes, kept inline.
///
/// ```
/// # use trade_core::*;
/// let atom = Atom::new(1);
/// atomically(Stack::<512>, |tx| atom.store(tx, 2));
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct Stack<const N: usize>;

#[repr(C, align(16))]
pub struct Inline<const N: usize>([MaybeUninit<u8>; N]);

impl<const N: usize> Config for Stack<N> {
    type Buffer = Inline<N>;

    fn into_buffer(self) -> Inline<N> {
        Inline([MaybeUninit::uninit(); N])
    }
}

impl<const N: usize> Buffer for Inline<N> {
    fn region(&mut self) -> (*mut u8, usize) {
        (self.0.as_mut_ptr() as *mut u8, N)
    }

    fn capacity(&self) -> usize {
        N
    }

    fn grow(&mut self) -> bool {
        false
    }
}

/// Growable log on the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Heap(usize);

/// Start without a log, for transactions that most likely only read.
pub const ASSUME_READONLY: Heap = Heap(0);

impl Heap {
    /// A heap log starting with `capacity` bytes.
    pub const fn new(capacity: usize) -> Heap {
        Heap(capacity)
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap(MIN_HEAP)
    }
}

pub struct HeapBuffer(Vec<MaybeUninit<u8>>);

impl Config for Heap {
    type Buffer = HeapBuffer;

    fn into_buffer(self) -> HeapBuffer {
        HeapBuffer(vec![MaybeUninit::uninit(); self.0])
    }
}

impl Buffer for HeapBuffer {
    fn region(&mut self) -> (*mut u8, usize) {
        (self.0.as_mut_ptr() as *mut u8, self.0.len())
    }

    fn capacity(&self) -> usize {
        self.0.len()
    }

    fn grow(&mut self) -> bool {
        let capacity = (2 * self.0.len()).max(MIN_HEAP);
        self.0 = vec![MaybeUninit::uninit(); capacity];
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stack_is_fixed() {
        let mut buffer = Stack::<64>.into_buffer();
        let (base, len) = buffer.region();
        assert_eq!(len, 64);
        assert_eq!(base as usize % 16, 0);
        assert!(!buffer.grow());
        assert_eq!(buffer.capacity(), 64);
    }

    #[test]
    fn heap_doubles() {
        let mut buffer = ASSUME_READONLY.into_buffer();
        assert_eq!(buffer.region().1, 0);
        assert!(buffer.grow());
        assert_eq!(buffer.capacity(), MIN_HEAP);
        assert!(buffer.grow());
        assert_eq!(buffer.capacity(), 2 * MIN_HEAP);
    }
}

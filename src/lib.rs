// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! This library implements
//! [software transactional memory](https://en.wikipedia.org/wiki/Software_transactional_memory),
//! often abbreviated with STM.
//!
//! The engine lives in `trade-core` and is re-exported here. This crate
//! adds transactional data structures in [`collections`].
//!
//! # Usage
//!
//! Shared state is kept in `Atom`s and changed inside `atomically`:
//!
//! ```
//! use trade::*;
//!
//! let from = Atom::new(100);
//! let to = Atom::new(0);
//!
//! atomically(Stack::<1024>, |tx| {
//!     let amount = from.load(tx)?;
//!     from.store(tx, 0)?;
//!     to.modify(tx, |x| x + amount)
//! });
//!
//! assert_eq!(to.unsafe_load(), 100);
//! ```
//!
//! Blocking is expressed with `retry`. The transaction sleeps until one of
//! the atoms it has read changes and then runs again:
//!
//! ```
//! use trade::*;
//! use trade::collections::Queue;
//!
//! let queue = Queue::from_values(vec![1, 2, 3]);
//! let first = atomically(Heap::default(), |tx| queue.pop_front(tx));
//! assert_eq!(first, 1);
//! ```
//!
//! See the documentation of `trade-core` for the rules of transaction
//! safety.

pub use trade_core::*;

pub mod collections;

// Copyright 2015-2018 rust-stm Developers
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
//! With locks the sequential composition of two
//! two threadsafe actions is no longer threadsafe because
//! other threads may interfer in between of these actions.
//! Applying a third lock to protect both may lead to common sources of errors
//! like deadlocks or race conditions.
//!
//! Unlike locks Software transactional memory is composable.
//! Every access to an `Atom` inside a transaction is recorded in a log.
//! Reads are checked against a global commit clock as they happen, and
//! when the action has finished, the written atoms are locked in a fixed
//! order, the reads are validated once more and the writes are published
//! as a single atomic step.
//! Otherwise the computation repeats. This may lead to starvation,
//! but avoids common sources of bugs.
//!
//! Panicing within STM does not poison the `Atom`s. STM ensures consistency by
//! never committing on panic.
//!
//! # Usage
//!
//! You can run the top-level atomic operation by calling `atomically`.
//! The first argument selects where the transaction log lives, see
//! [`Stack`], [`Heap`] and [`ASSUME_READONLY`].
//!
//! ```
//! # use trade_core::*;
//! atomically(Stack::<256>, |tx| {
//!     // some action
//!     // return value as `Result`, for example
//!     Ok(42)
//! });
//! ```
//!
//! Nested calls to `atomically` are not allowed. A run-time check prevents this.
//! Instead of using atomically internally, add a `&mut Transaction` parameter and
//! return `StmResult`.
//!
//! Use ? on `StmResult`, to propagate a transaction error through the system.
//! Do not handle the error yourself.
//!
//! ```
//! # use trade_core::*;
//! let atom = Atom::new(0);
//!
//! let x = atomically(Heap::default(), |tx| {
//!     atom.store(tx, 42)?; // Pass failure to parent.
//!     atom.load(tx) // Return the value saved in atom.
//! });
//!
//! println!("atom = {}", x);
//! // atom = 42
//! ```
//!
//! Atoms used in a transaction have to outlive the call to `atomically`.
//! Atoms created inside the action are rejected by the borrow checker.
//!
//! # Transaction safety
//!
//! Software transactional memory is completely safe in the rust sense, so
//! undefined behavior will never occur.
//! Still there are multiple rules that
//! you should obey when dealing with software transactional memory.
//!
//! * Don't run code with side effects, especially no IO-code.
//! Transactions repeat in failure cases. Using IO would repeat this IO-code.
//! Return a closure if you have to.
//! * Don't handle `StmResult` yourself. Always use `?` and
//! never ignore a `StmResult`. Errors you swallow still fail the attempt.
//! * Don't run `atomically` inside of another.
//! Nested calls are detected at runtime and handled with panicking.
//! When you use STM in the inner of a function, then
//! express it in the public interface, by taking `&mut Transaction` as parameter and
//! returning `StmResult<T>`. Callers can safely compose it into
//! larger blocks.
//! * Don't mix locks and transactions. Your code will easily deadlock or slow
//! down unpredictably.
//! * Don't use inner mutability to change the content of an `Atom`.
//!
//! Panicking in a transaction is transaction-safe. The transaction aborts and
//! all changes are discarded. No poisoning or half written transactions happen.
//!
//! # Speed
//!
//! Generally keep your atomic blocks as small as possible, because
//! the more time you spend, the more likely it is, to collide with
//! other threads. Atoms share a fixed number of lock slots, so unrelated
//! atoms may collide as well.
//! Reads of primitive types are lock-free, other values are cloned out of
//! their atom on every first read.

mod atom;
mod backoff;
mod config;
mod lock;
mod result;
mod transaction;


pub use atom::{Atom, AtomValue, Guarded, Native, NativeAtomic, Storage};
pub use config::{Buffer, Config, Heap, HeapBuffer, Inline, Stack, ASSUME_READONLY, MIN_HEAP};
pub use lock::LOCK_COUNT;
pub use result::*;
pub use transaction::Transaction;

#[inline]
/// Call `retry` to abort an operation and run the whole transaction again.
///
/// Semantically `retry` allows spin-lock-like behavior, but the library
/// blocks until one of the read `Atom`s has changed, to keep CPU-usage low.
///
/// A transaction that read nothing has nothing to wait for and blocks
/// forever.
///
/// # Examples
///
/// ```no_run
/// # use trade_core::*;
/// let infinite_retry: i32 = atomically(Heap::default(), |_| retry());
/// ```
pub fn retry<T>() -> StmResult<T> {
    Err(StmError::Retry)
}

/// Run a function atomically by using Software Transactional Memory.
///
/// The action is repeated until it commits. Use `try_atomically` to abort
/// with an error.
///
/// Nesting is expressed through the type system instead of at run time:
/// a function that wants to join its caller's transaction takes
/// `&mut Transaction` and returns `StmResult`, and its body then runs inline
/// in the caller's attempt. Calling `atomically` again from inside the
/// action would start an independent transaction whose atoms might not
/// outlive the outer commit, so it panics.
///
/// ```
/// # use trade_core::*;
/// fn transfer<'a>(from: &'a Atom<i32>, to: &'a Atom<i32>, tx: &mut Transaction<'a>) -> StmResult<()> {
///     let amount = from.replace(tx, 0)?;
///     to.modify(tx, |x| x + amount)
/// }
///
/// let (a, b) = (Atom::new(3), Atom::new(4));
/// atomically(Heap::default(), |tx| {
///     transfer(&a, &b, tx)?;
///     transfer(&b, &a, tx)
/// });
/// assert_eq!((a.unsafe_load(), b.unsafe_load()), (7, 0));
/// ```
///
/// # Panics
///
/// If the log of a `Stack` configuration is too small for the transaction,
/// or if called inside another transaction.
pub fn atomically<'a, C, T, F>(config: C, f: F) -> T
where
    C: Config,
    F: Fn(&mut Transaction<'a>) -> StmResult<T>,
{
    let result: Result<T, Error> = transaction::Transaction::run(config, |tx| Ok(f(tx)?));
    match result {
        Ok(t) => t,
        Err(e) => panic!("{}", e),
    }
}

/// Log configuration used by `atomically_default`.
pub type DefaultConfig = Stack<1024>;

/// Run a function atomically with the default log, an inline buffer of 1024
/// bytes.
///
/// ```
/// # use trade_core::*;
/// let atom = Atom::new(1);
/// let x = atomically_default(|tx| {
///     atom.modify(tx, |x| x * 2)?;
///     atom.load(tx)
/// });
/// assert_eq!(x, 2);
/// ```
///
/// # Panics
///
/// Like `atomically`, in particular if the transaction needs more than 1024
/// bytes of log.
pub fn atomically_default<'a, T, F>(f: F) -> T
where
    F: Fn(&mut Transaction<'a>) -> StmResult<T>,
{
    atomically(DefaultConfig::default(), f)
}

/// Run a function atomically, allowing it to give up with `abort`.
///
/// ```
/// # use trade_core::*;
/// let balance = Atom::new(10);
///
/// let result = try_atomically(Heap::default(), |tx| {
///     let b = balance.load(tx)?;
///     if b < 20 {
///         return abort("insufficient funds");
///     }
///     balance.store(tx, b - 20)?;
///     Ok(())
/// });
///
/// assert_eq!(result, Err(Error::Aborted("insufficient funds")));
/// assert_eq!(balance.unsafe_load(), 10);
/// ```
pub fn try_atomically<'a, C, T, E, F>(config: C, f: F) -> Result<T, Error<E>>
where
    C: Config,
    F: Fn(&mut Transaction<'a>) -> TransactionResult<T, E>,
{
    transaction::Transaction::run(config, f)
}

#[inline]
/// Unwrap `Option` or call retry if it is `None`.
///
/// # Example
///
/// ```
/// # use trade_core::*;
/// let x = Atom::new(Some(42));
///
/// atomically(Heap::default(), |tx| {
///         let inner = unwrap_or_retry(x.load(tx)?)?;
///         assert_eq!(inner, 42); // inner is always 42.
///         Ok(inner)
///     }
/// );
/// ```
pub fn unwrap_or_retry<T>(option: Option<T>) -> StmResult<T> {
    match option {
        Some(x) => Ok(x),
        None => retry(),
    }
}

#[inline]
/// Retry until `cond` is true.
///
/// # Example
///
/// ```
/// # use trade_core::*;
/// let atom = Atom::new(42);
///
/// let x = atomically(Heap::default(), |tx| {
///     let v = atom.load(tx)?;
///     guard(v == 42)?;
///     // v is now always 42.
///     Ok(v)
/// });
/// assert_eq!(x, 42);
/// ```
pub fn guard(cond: bool) -> StmResult<()> {
    if cond {
        Ok(())
    } else {
        retry()
    }
}

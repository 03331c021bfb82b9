// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::convert::Infallible;

use thiserror::Error;

/// Control signal produced inside a transaction.
///
/// None of these ever escape `atomically`. The runner interprets them:
/// conflicts restart the attempt, retries park first, and an exhausted log
/// either grows or is reported through [`Error::LogExhausted`].
#[derive(Eq, PartialEq, Clone, Copy, Debug, Error)]
pub enum StmError {
    /// The call failed, because a variable, the computation
    /// depends on, has changed or is being committed right now.
    #[error("transaction conflict")]
    Conflict,

    /// `retry` was called.
    ///
    /// It blocks until at least one read atom has changed.
    #[error("transaction retry")]
    Retry,

    /// The transaction log ran out of space.
    #[error("transaction log exhausted")]
    LogExhausted,
}

/// `StmResult` is a result of a single step of a STM calculation.
///
/// It informs of success or the type of failure. Use `?` to pass the
/// failure on and never recover from it yourself.
pub type StmResult<T> = Result<T, StmError>;

/// Error type of actions run by `try_atomically`.
///
/// It either carries an engine signal or a user error that aborts the
/// whole transaction.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Error)]
pub enum TransactionError<E> {
    /// An engine signal, passed on with `?`.
    #[error(transparent)]
    Stm(#[from] StmError),

    /// The action gave up with a user error.
    #[error("transaction aborted by its action")]
    Abort(E),
}

pub type TransactionResult<T, E> = Result<T, TransactionError<E>>;

/// Failure visible to the caller of `try_atomically`.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Error)]
pub enum Error<E = Infallible> {
    /// A fixed-capacity log overflowed. Use a bigger `Stack` or a `Heap`.
    #[error("transaction log exceeded its fixed capacity of {capacity} bytes")]
    LogExhausted { capacity: usize },

    /// The action called `abort`. None of its writes were committed.
    #[error("transaction aborted by its action")]
    Aborted(E),
}

/// Abort the transaction with a user error.
///
/// The current attempt is discarded and `try_atomically` returns
/// `Error::Aborted(error)`.
pub fn abort<T, E>(error: E) -> TransactionResult<T, E> {
    Err(TransactionError::Abort(error))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stm_error_converts_into_transaction_error() {
        fn step() -> TransactionResult<(), &'static str> {
            Err(StmError::Conflict)?;
            Ok(())
        }
        assert_eq!(step(), Err(TransactionError::Stm(StmError::Conflict)));
    }

    #[test]
    fn exhausted_message_names_capacity() {
        let err: Error = Error::LogExhausted { capacity: 128 };
        assert_eq!(
            err.to_string(),
            "transaction log exceeded its fixed capacity of 128 bytes"
        );
    }
}

// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{self, Debug};
use std::sync::atomic::{self, Ordering};
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicIsize};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize};
use std::sync::Arc;

use parking_lot::RwLock;

use super::backoff::Backoff;
use super::lock::{self, Clock, Lock};
use super::result::*;
use super::Transaction;

/// How an atom keeps its value.
///
/// The strategy is fixed per value type through [`AtomValue::Storage`].
/// Storage is only written by a committing transaction that holds the
/// atom's lock slot.
pub trait Storage<V>: Send + Sync {
    /// `true` if loads are single lock-free atomic operations.
    const NATIVE: bool;

    fn new(value: V) -> Self;

    fn load(&self) -> V;

    fn store(&self, value: V);

    fn into_inner(self) -> V;
}

/// Values that fit into one lock-free std atomic.
pub trait NativeAtomic: Copy + Send + Sync + 'static {
    type Atomic: Send + Sync;

    fn into_atomic(self) -> Self::Atomic;

    fn load(atomic: &Self::Atomic) -> Self;

    fn store(atomic: &Self::Atomic, value: Self);

    fn from_atomic(atomic: Self::Atomic) -> Self;
}

/// Storage in a native atomic.
pub struct Native<V: NativeAtomic>(V::Atomic);

impl<V: NativeAtomic> Storage<V> for Native<V> {
    const NATIVE: bool = true;

    fn new(value: V) -> Self {
        Native(value.into_atomic())
    }

    fn load(&self) -> V {
        V::load(&self.0)
    }

    fn store(&self, value: V) {
        V::store(&self.0, value)
    }

    fn into_inner(self) -> V {
        V::from_atomic(self.0)
    }
}

/// Plain storage for everything else.
///
/// Visibility is governed by the slot version like for native atoms. The
/// read-write lock only keeps a clone from overlapping with a commit.
pub struct Guarded<V>(RwLock<V>);

impl<V: Clone + Send + Sync> Storage<V> for Guarded<V> {
    const NATIVE: bool = false;

    fn new(value: V) -> Self {
        Guarded(RwLock::new(value))
    }

    fn load(&self) -> V {
        self.0.read().clone()
    }

    fn store(&self, value: V) {
        let old = std::mem::replace(&mut *self.0.write(), value);
        drop(old);
    }

    fn into_inner(self) -> V {
        self.0.into_inner()
    }
}

/// A type that can live inside an [`Atom`].
///
/// Primitive numbers, `bool` and `char` are stored natively, common std
/// types are guarded. Implement it for your own types with
/// [`guarded_value!`](crate::guarded_value) or by hand:
///
/// ```
/// # use trade_core::*;
/// #[derive(Clone)]
/// struct Account { balance: i64 }
///
/// impl AtomValue for Account {
///     type Storage = Guarded<Account>;
/// }
/// ```
pub trait AtomValue: Clone + Send + Sync + 'static {
    type Storage: Storage<Self>;
}

macro_rules! native_value {
    ($($ty:ty => $atomic:ty),* $(,)?) => {
        $(
            impl NativeAtomic for $ty {
                type Atomic = $atomic;

                fn into_atomic(self) -> $atomic {
                    <$atomic>::new(self)
                }

                fn load(atomic: &$atomic) -> Self {
                    atomic.load(Ordering::Acquire)
                }

                fn store(atomic: &$atomic, value: Self) {
                    atomic.store(value, Ordering::Release)
                }

                fn from_atomic(atomic: $atomic) -> Self {
                    atomic.into_inner()
                }
            }

            impl AtomValue for $ty {
                type Storage = Native<$ty>;
            }
        )*
    };
}

native_value! {
    bool => AtomicBool,
    u8 => AtomicU8,
    u16 => AtomicU16,
    u32 => AtomicU32,
    u64 => AtomicU64,
    usize => AtomicUsize,
    i8 => AtomicI8,
    i16 => AtomicI16,
    i32 => AtomicI32,
    i64 => AtomicI64,
    isize => AtomicIsize,
}

macro_rules! native_bits {
    ($($ty:ty => $atomic:ty, $to:expr, $from:expr);* $(;)?) => {
        $(
            impl NativeAtomic for $ty {
                type Atomic = $atomic;

                fn into_atomic(self) -> $atomic {
                    <$atomic>::new($to(self))
                }

                fn load(atomic: &$atomic) -> Self {
                    $from(atomic.load(Ordering::Acquire))
                }

                fn store(atomic: &$atomic, value: Self) {
                    atomic.store($to(value), Ordering::Release)
                }

                fn from_atomic(atomic: $atomic) -> Self {
                    $from(atomic.into_inner())
                }
            }

            impl AtomValue for $ty {
                type Storage = Native<$ty>;
            }
        )*
    };
}

native_bits! {
    f32 => AtomicU32, f32::to_bits, f32::from_bits;
    f64 => AtomicU64, f64::to_bits, f64::from_bits;
    // Only ever fed with bits of a valid char.
    char => AtomicU32, u32::from, |bits| char::from_u32(bits).unwrap_or_default();
}

/// Store the listed types in guarded storage.
///
/// ```
/// # use trade_core::*;
/// #[derive(Clone, Default)]
/// struct Point { x: f64, y: f64 }
///
/// guarded_value!(Point);
///
/// let p = Atom::new(Point::default());
/// # assert!(!Atom::<Point>::is_native());
/// ```
#[macro_export]
macro_rules! guarded_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::AtomValue for $ty {
                type Storage = $crate::Guarded<$ty>;
            }
        )*
    };
}

guarded_value!(String, &'static str, ());

impl<T: Clone + Send + Sync + 'static> AtomValue for Option<T> {
    type Storage = Guarded<Self>;
}

impl<T: Clone + Send + Sync + 'static> AtomValue for Vec<T> {
    type Storage = Guarded<Self>;
}

impl<T: Clone + Send + Sync + 'static> AtomValue for VecDeque<T> {
    type Storage = Guarded<Self>;
}

impl<T: Clone + Send + Sync + 'static> AtomValue for Box<T> {
    type Storage = Guarded<Self>;
}

impl<T: ?Sized + Send + Sync + 'static> AtomValue for Arc<T> {
    type Storage = Guarded<Self>;
}

impl<T: Clone + Ord + Send + Sync + 'static> AtomValue for BTreeSet<T> {
    type Storage = Guarded<Self>;
}

impl<K, V> AtomValue for BTreeMap<K, V>
where
    K: Clone + Ord + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Storage = Guarded<Self>;
}

impl<T: Clone + Send + Sync + 'static, const N: usize> AtomValue for [T; N] {
    type Storage = Guarded<Self>;
}

macro_rules! tuple_value {
    ($(($($name:ident),+)),* $(,)?) => {
        $(
            impl<$($name: Clone + Send + Sync + 'static),+> AtomValue for ($($name,)+) {
                type Storage = Guarded<Self>;
            }
        )*
    };
}

tuple_value! {
    (A),
    (A, B),
    (A, B, C),
    (A, B, C, D),
}

/// A transactional memory cell.
///
/// An atom's address is its identity: it selects the lock slot guarding it
/// and keys its record in the transaction log. Atoms can not be cloned; share
/// them by reference or put them inside an `Arc`.
pub struct Atom<V: AtomValue> {
    storage: V::Storage,
}

impl<V: AtomValue> Atom<V> {
    /// Create a new `Atom`.
    pub fn new(value: V) -> Atom<V> {
        Atom {
            storage: V::Storage::new(value),
        }
    }

    /// `true` if values of type `V` are stored in a lock-free atomic.
    pub fn is_native() -> bool {
        <V::Storage as Storage<V>>::NATIVE
    }

    /// The normal way to access an atom.
    ///
    /// It is equivalent to `transaction.load(&atom)`.
    pub fn load<'a>(&'a self, transaction: &mut Transaction<'a>) -> StmResult<V> {
        transaction.load(self)
    }

    /// Read the latest committed value without a transaction.
    ///
    /// Native atoms are read with one atomic load. Guarded atoms spin until
    /// their slot is not being committed to.
    ///
    /// Reading several atoms this way does not give a consistent snapshot.
    pub fn unsafe_load(&self) -> V {
        if Self::is_native() {
            return self.storage.load();
        }

        let lock = lock::lock(self.lock_index());
        let mut backoff = Backoff::new();
        loop {
            let version = lock.version();
            if !lock::is_locked(version) {
                let value = self.storage.load();
                atomic::fence(Ordering::Acquire);
                if version == lock.version() {
                    return value;
                }
            }
            backoff.spin();
        }
    }

    /// The normal way to write an atom.
    ///
    /// It is equivalent to `transaction.store(&atom, value)`.
    pub fn store<'a>(&'a self, transaction: &mut Transaction<'a>, value: V) -> StmResult<()> {
        transaction.store(self, value)
    }

    /// Get a mutable reference to the value inside the transaction.
    ///
    /// It is roughly `atom.store(tx, atom.load(tx)?)`, but touches the log
    /// only once and keeps the read for validation.
    pub fn ref_mut<'a, 't>(
        &'a self,
        transaction: &'t mut Transaction<'a>,
    ) -> StmResult<&'t mut V> {
        transaction.ref_mut(self)
    }

    /// Modify the content of an `Atom` with the function f.
    ///
    /// ```
    /// # use trade_core::*;
    /// let atom = Atom::new(21);
    /// atomically(Stack::<256>, |tx| atom.modify(tx, |x| x * 2));
    ///
    /// assert_eq!(atom.unsafe_load(), 42);
    /// ```
    pub fn modify<'a, F>(&'a self, transaction: &mut Transaction<'a>, f: F) -> StmResult<()>
    where
        F: FnOnce(V) -> V,
    {
        let old = self.load(transaction)?;
        self.store(transaction, f(old))
    }

    /// Replaces the value of an `Atom` with a new one, returning
    /// the old one.
    pub fn replace<'a>(&'a self, transaction: &mut Transaction<'a>, value: V) -> StmResult<V> {
        let old = self.load(transaction)?;
        self.store(transaction, value)?;
        Ok(old)
    }

    /// Take the value out of an atom nobody else can see anymore.
    pub fn into_inner(self) -> V {
        self.storage.into_inner()
    }

    /// Read the value on behalf of a transaction that started at `start`.
    ///
    /// Fails if the slot was committed to after `start`, or is being
    /// committed to right now.
    pub(crate) fn load_at(&self, start: Clock) -> StmResult<V> {
        self.load_guarded_by(lock::lock(self.lock_index()), start)
    }

    fn load_guarded_by(&self, lock: &Lock, start: Clock) -> StmResult<V> {
        let version = lock.version();
        if start < version {
            return Err(StmError::Conflict);
        }
        let value = self.storage.load();
        atomic::fence(Ordering::Acquire);
        if version != lock.version() {
            return Err(StmError::Conflict);
        }
        Ok(value)
    }

    /// Write a committed value. The caller holds the slot.
    pub(crate) fn publish(&self, value: V) {
        self.storage.store(value)
    }

    pub(crate) fn address(&self) -> usize {
        self as *const Atom<V> as usize
    }

    /// Index of the lock slot this atom maps to.
    ///
    /// Atoms sharing a slot conflict with each other, and a commit to one
    /// of them wakes transactions waiting on any of them.
    pub fn lock_index(&self) -> u16 {
        lock::index_of(self.address())
    }
}

impl<V: AtomValue + Default> Default for Atom<V> {
    fn default() -> Atom<V> {
        Atom::new(V::default())
    }
}

impl<V: AtomValue> From<V> for Atom<V> {
    fn from(value: V) -> Atom<V> {
        Atom::new(value)
    }
}

/// Debug output an atom.
///
/// The value is read with `unsafe_load`, so printing several atoms does
/// not show a consistent state.
impl<V: AtomValue + Debug> Debug for Atom<V> {
    #[inline(never)]
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Atom")
            .field("value", &self.unsafe_load())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unsafe_load() {
        let atom = Atom::new(42);
        assert_eq!(42, atom.unsafe_load());

        let atom = Atom::new(String::from("trade"));
        assert_eq!("trade", atom.unsafe_load());
    }

    #[test]
    fn storage_selection() {
        assert!(Atom::<i32>::is_native());
        assert!(Atom::<bool>::is_native());
        assert!(Atom::<f64>::is_native());
        assert!(!Atom::<String>::is_native());
        assert!(!Atom::<Option<i32>>::is_native());
        assert!(!Atom::<(i32, f32)>::is_native());
    }

    #[test]
    fn native_bits_round_trip() {
        assert_eq!(Atom::new(2.5f32).unsafe_load(), 2.5);
        assert_eq!(Atom::new('λ').unsafe_load(), 'λ');
        assert_eq!(Atom::new(-3i8).into_inner(), -3);
    }

    #[test]
    fn default_and_debug() {
        let atom: Atom<Vec<u8>> = Atom::default();
        assert!(atom.unsafe_load().is_empty());
        assert_eq!(format!("{:?}", Atom::new(7u16)), "Atom { value: 7 }");
    }

    #[test]
    fn load_rejects_newer_slot() {
        let atom = Atom::new(1u64);
        let lock = Lock::new();
        lock.lock().release_at(5);

        assert_eq!(atom.load_guarded_by(&lock, 4), Err(StmError::Conflict));
        assert_eq!(atom.load_guarded_by(&lock, 5), Ok(1));
        assert_eq!(atom.load_guarded_by(&lock, 6), Ok(1));
    }

    #[test]
    fn load_rejects_locked_slot() {
        let atom = Atom::new(String::from("x"));
        let lock = Lock::new();
        let guard = lock.lock();

        assert_eq!(atom.load_guarded_by(&lock, Clock::MAX >> 1), Err(StmError::Conflict));
        drop(guard);
        assert_eq!(atom.load_guarded_by(&lock, 0), Ok(String::from("x")));
    }
}

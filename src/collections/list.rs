// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::Arc;

use trade_core::{AtomValue, Guarded};

/// `List` is a threadsafe, persistent singly linked list.
///
/// Prepending and splitting never touch the shared tail, so a list can be
/// loaded from an atom, changed and stored back while other transactions
/// still hold the old version.
///
/// Cloning a `List` gives a reference to the same nodes.
#[derive(Debug)]
pub struct List<T> {
    head: Option<Arc<Node<T>>>,
}

#[derive(Debug)]
struct Node<T> {
    value: T,
    tail: List<T>,
}

// Cloning is always possible, even if T is not `Clone`.
impl<T> Clone for List<T> {
    fn clone(&self) -> Self {
        List {
            head: self.head.clone(),
        }
    }
}

impl<T> Default for List<T> {
    fn default() -> Self {
        List::new()
    }
}

impl<T: Clone + Send + Sync + 'static> AtomValue for List<T> {
    type Storage = Guarded<Self>;
}

impl<T> List<T> {
    /// Create a new, empty list.
    #[inline]
    pub fn new() -> Self {
        List { head: None }
    }

    /// Prepend a value to the existing list.
    #[inline]
    pub fn prepend(self, value: T) -> Self {
        List {
            head: Some(Arc::new(Node { value, tail: self })),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// First element of the list.
    #[inline]
    pub fn head(&self) -> Option<&T> {
        self.head.as_ref().map(|node| &node.value)
    }

    /// Iterate over the elements of the list.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { list: self }
    }

    /// Number of elements. Takes O(n).
    pub fn len(&self) -> usize {
        self.iter().count()
    }
}

impl<T: Clone> List<T> {
    /// Split the list into head and tail.
    ///
    /// The value is moved out if this list holds the only reference to the
    /// first node, and cloned otherwise.
    pub fn into_split(mut self) -> Option<(T, List<T>)> {
        self.head.take().map(|node| match Arc::try_unwrap(node) {
            Ok(mut node) => (node.value, node.tail.take()),
            Err(shared) => (shared.value.clone(), shared.tail.clone()),
        })
    }

    /// Reverse the list. Takes O(n).
    pub fn reverse(self) -> Self {
        let mut reversed = List::new();
        let mut rest = self;
        while let Some((value, tail)) = rest.into_split() {
            reversed = reversed.prepend(value);
            rest = tail;
        }
        reversed
    }

    fn take(&mut self) -> Self {
        List {
            head: self.head.take(),
        }
    }
}

impl<T> FromIterator<T> for List<T> {
    /// Collect into a list. The last element of the iterator ends up first.
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        iter.into_iter().fold(List::new(), List::prepend)
    }
}

// Unlink uniquely owned nodes one by one, so long lists don't overflow the
// stack.
impl<T> Drop for List<T> {
    fn drop(&mut self) {
        let mut head = self.head.take();
        while let Some(node) = head {
            match Arc::try_unwrap(node) {
                Ok(mut node) => head = node.tail.head.take(),
                Err(_) => return,
            }
        }
    }
}

/// Iterator over the items of a `List` by reference.
pub struct Iter<'a, T> {
    list: &'a List<T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    #[inline]
    fn next(&mut self) -> Option<&'a T> {
        let node = self.list.head.as_ref()?;
        self.list = &node.tail;
        Some(&node.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepend() {
        let list = List::new().prepend(1).prepend(2).prepend(3);

        assert_eq!(Some(&3), list.head());
        assert_eq!(list.len(), 3);
    }

    /// Test if the destructor runs correctly.
    /// The naive implementation of linked lists creates stack overflows.
    #[test]
    fn long_list() {
        let list: List<u32> = (0..100_000).collect();
        assert_eq!(list.head(), Some(&99_999));
    }

    #[test]
    fn reverse() {
        let list = List::new().prepend(1).prepend(2).prepend(3).reverse();

        assert_eq!(list.iter().copied().collect::<Vec<_>>(), [1, 2, 3]);
    }

    #[test]
    fn split_shared() {
        let list = List::new().prepend(String::from("b")).prepend(String::from("a"));
        let copy = list.clone();

        let (head, tail) = list.into_split().unwrap();
        assert_eq!(head, "a");
        assert_eq!(tail.head().map(String::as_str), Some("b"));
        // The shared nodes are untouched.
        assert_eq!(copy.len(), 2);
    }
}

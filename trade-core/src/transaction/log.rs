// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The access log of a single transaction attempt.
//!
//! Records are bump-allocated from the buffer selected by the `Config` and
//! kept in a splay tree ordered by `(lock slot, atom address)`. Commit
//! flattens the tree into an ordered chain, so write locks are always taken
//! in ascending slot order.
//!
//! Links are byte offsets into the buffer. Every record also sits on an
//! allocation chain, which is used to destroy the records no matter what
//! state the tree is in.

use std::mem::{self, MaybeUninit};
use std::ptr;

use crate::atom::{Atom, AtomValue};
use crate::result::{StmError, StmResult};

pub type Link = usize;

pub const NIL: Link = usize::MAX;

pub const INITIAL: u8 = 0;
pub const READ: u8 = 1;
pub const WRITTEN: u8 = 2;

type Key = (u16, usize);

/// Type-erased operations of a record.
pub struct RecordVTable {
    publish: unsafe fn(*mut Header),
    destroy: unsafe fn(*mut Header),
}

#[repr(C)]
pub struct Header {
    children: [Link; 2],
    /// Successor on the ordered chain built by `drain`.
    next: Link,
    /// Previously allocated record.
    older: Link,
    atom: usize,
    lock_index: u16,
    state: u8,
    live: bool,
    vtable: &'static RecordVTable,
}

impl Header {
    fn key(&self) -> Key {
        (self.lock_index, self.atom)
    }

    pub fn lock_index(&self) -> u16 {
        self.lock_index
    }

    pub fn is_read(&self) -> bool {
        self.state & READ != 0
    }

    pub fn is_written(&self) -> bool {
        self.state & WRITTEN != 0
    }

    /// Move the pending value into the atom.
    ///
    /// # Safety
    ///
    /// The record must be written and the caller must hold its slot.
    pub unsafe fn publish(&mut self) {
        (self.vtable.publish)(self)
    }
}

/// Log entry for one atom.
#[repr(C)]
pub struct Record<V> {
    header: Header,
    /// The value read or about to be written. Valid if `header.live`.
    current: MaybeUninit<V>,
}

impl<V: AtomValue> Record<V> {
    fn vtable() -> &'static RecordVTable {
        &RecordVTable {
            publish: Self::publish,
            destroy: Self::destroy,
        }
    }

    unsafe fn publish(header: *mut Header) {
        let record = &mut *(header as *mut Record<V>);
        debug_assert!(record.header.live);
        record.header.live = false;
        let value = record.current.assume_init_read();
        let atom = &*(record.header.atom as *const Atom<V>);
        atom.publish(value);
    }

    unsafe fn destroy(header: *mut Header) {
        let record = &mut *(header as *mut Record<V>);
        if record.header.live {
            record.header.live = false;
            record.current.assume_init_drop();
        }
    }

    pub fn state(&self) -> u8 {
        self.header.state
    }

    pub fn mark(&mut self, state: u8) {
        self.header.state |= state;
    }

    /// Replace the current value.
    pub fn set(&mut self, value: V) {
        if self.header.live {
            // Safety: live values are initialized.
            unsafe { self.current.assume_init_drop() };
        }
        self.current.write(value);
        self.header.live = true;
    }

    /// The current value. Only valid after `set`.
    pub fn get(&mut self) -> &mut V {
        assert!(self.header.live, "log record without value");
        // Safety: checked above.
        unsafe { self.current.assume_init_mut() }
    }
}

/// Where the next node of a splay side tree is attached.
#[derive(Clone, Copy)]
enum Slot {
    Side(usize),
    Child(Link, usize),
}

/// The transaction log. See the module documentation.
pub struct Log {
    base: *mut u8,
    capacity: usize,
    cursor: usize,
    root: Link,
    newest: Link,
    len: usize,
}

impl Log {
    pub const fn new() -> Log {
        Log {
            base: ptr::null_mut(),
            capacity: 0,
            cursor: 0,
            root: NIL,
            newest: NIL,
            len: 0,
        }
    }

    /// Destroy all records and start over in the given region.
    pub fn reset(&mut self, base: *mut u8, capacity: usize) {
        self.destroy();
        self.base = base;
        self.capacity = capacity;
    }

    /// `false` for a log without storage, which can not record anything.
    pub fn is_logging(&self) -> bool {
        self.capacity > 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn header(&self, link: Link) -> *mut Header {
        debug_assert!(link < self.capacity);
        // Safety: links are offsets of records inside the region.
        unsafe { self.base.add(link) as *mut Header }
    }

    fn children(&mut self, link: Link) -> &mut [Link; 2] {
        // Safety: links are valid and the log is borrowed mutably.
        unsafe { &mut (*self.header(link)).children }
    }

    fn key(&self, link: Link) -> Key {
        // Safety: links are valid.
        unsafe { (*self.header(link)).key() }
    }

    /// The record behind `link`.
    ///
    /// # Safety
    ///
    /// `link` must have been returned by `insert` for an `Atom<V>` since the
    /// last reset.
    pub unsafe fn record<V>(&mut self, link: Link) -> &mut Record<V> {
        &mut *(self.header(link) as *mut Record<V>)
    }

    /// Bump-allocate `size` bytes.
    fn alloc(&mut self, size: usize, align: usize) -> Option<Link> {
        let address = (self.base as usize).checked_add(self.cursor)?;
        let padding = address.wrapping_neg() & (align - 1);
        let start = self.cursor.checked_add(padding)?;
        let end = start.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        self.cursor = end;
        Some(start)
    }

    fn attach(&mut self, sides: &mut [Link; 2], slot: Slot, link: Link) {
        match slot {
            Slot::Side(side) => sides[side] = link,
            Slot::Child(node, dir) => self.children(node)[dir] = link,
        }
    }

    /// Top-down splay for `key`. The closest node becomes the root.
    fn splay(&mut self, key: Key) {
        let mut t = self.root;
        if t == NIL {
            return;
        }

        let mut sides = [NIL, NIL];
        let mut hooks = [Slot::Side(0), Slot::Side(1)];
        loop {
            let dir = match key.cmp(&self.key(t)) {
                std::cmp::Ordering::Equal => break,
                std::cmp::Ordering::Less => 0,
                std::cmp::Ordering::Greater => 1,
            };
            let mut child = self.children(t)[dir];
            if child == NIL {
                break;
            }
            // zig-zig: rotate before linking
            let deeper = if dir == 0 {
                key < self.key(child)
            } else {
                key > self.key(child)
            };
            if deeper {
                let inner = self.children(child)[1 - dir];
                self.children(t)[dir] = inner;
                self.children(child)[1 - dir] = t;
                t = child;
                child = self.children(t)[dir];
                if child == NIL {
                    break;
                }
            }
            // t and everything on its far side belong to the opposite side tree
            let side = 1 - dir;
            self.attach(&mut sides, hooks[side], t);
            hooks[side] = Slot::Child(t, dir);
            t = child;
        }

        let [left, right] = *self.children(t);
        self.attach(&mut sides, hooks[0], left);
        self.attach(&mut sides, hooks[1], right);
        *self.children(t) = sides;
        self.root = t;
    }

    /// Find or create the record for `atom`.
    ///
    /// Repeated calls for the same atom return the same link. Fails with
    /// `LogExhausted` if the region is too small; the log must be reset
    /// afterwards.
    pub fn insert<V: AtomValue>(&mut self, atom: &Atom<V>) -> StmResult<Link> {
        let key = (atom.lock_index(), atom.address());
        self.splay(key);
        if self.root != NIL && self.key(self.root) == key {
            return Ok(self.root);
        }

        let link = self
            .alloc(mem::size_of::<Record<V>>(), mem::align_of::<Record<V>>())
            .ok_or(StmError::LogExhausted)?;

        let mut children = [NIL, NIL];
        let root = self.root;
        if root != NIL {
            let dir = if key < self.key(root) { 0 } else { 1 };
            children[dir] = self.children(root)[dir];
            children[1 - dir] = root;
            self.children(root)[dir] = NIL;
        }

        let header = Header {
            children,
            next: NIL,
            older: self.newest,
            atom: key.1,
            lock_index: key.0,
            state: INITIAL,
            live: false,
            vtable: Record::<V>::vtable(),
        };
        // Safety: freshly allocated, correctly aligned and sized.
        unsafe {
            ptr::write(
                self.header(link) as *mut Record<V>,
                Record {
                    header,
                    current: MaybeUninit::uninit(),
                },
            );
        }

        self.newest = link;
        self.root = link;
        self.len += 1;
        Ok(link)
    }

    /// Flatten the tree into a chain in key order and return its head.
    ///
    /// The tree is gone afterwards; the records stay alive until `destroy`.
    pub fn drain(&mut self) -> Link {
        let mut head = NIL;
        let mut tail = NIL;
        let mut t = mem::replace(&mut self.root, NIL);
        while t != NIL {
            let left = self.children(t)[0];
            if left != NIL {
                // rotate right until there is no left child
                self.children(t)[0] = self.children(left)[1];
                self.children(left)[1] = t;
                t = left;
                continue;
            }
            // Safety: valid link.
            unsafe { (*self.header(t)).next = NIL };
            if tail == NIL {
                head = t;
            } else {
                unsafe { (*self.header(tail)).next = t };
            }
            tail = t;
            t = self.children(t)[1];
        }
        head
    }

    /// Iterate a chain returned by `drain`.
    pub fn chain(&self, head: Link) -> Chain<'_> {
        Chain { log: self, link: head }
    }

    /// Drop all records and forget the tree.
    pub fn destroy(&mut self) {
        let mut link = self.newest;
        while link != NIL {
            let header = self.header(link);
            // Safety: every link on the allocation chain is an initialized
            // record, destroyed exactly once.
            unsafe {
                link = (*header).older;
                ((*header).vtable.destroy)(header);
            }
        }
        self.root = NIL;
        self.newest = NIL;
        self.cursor = 0;
        self.len = 0;
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Iterator over an ordered chain of records.
pub struct Chain<'l> {
    log: &'l Log,
    link: Link,
}

impl<'l> Iterator for Chain<'l> {
    type Item = *mut Header;

    fn next(&mut self) -> Option<*mut Header> {
        if self.link == NIL {
            return None;
        }
        let header = self.log.header(self.link);
        // Safety: chain links are valid records.
        self.link = unsafe { (*header).next };
        Some(header)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{Buffer, Config, Heap, Stack};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn keys(log: &mut Log) -> Vec<Key> {
        let head = log.drain();
        log.chain(head)
            .map(|header| unsafe { (*header).key() })
            .collect()
    }

    #[test]
    fn insert_is_idempotent() {
        let mut buffer = Heap::new(4096).into_buffer();
        let mut log = Log::new();
        let (base, capacity) = buffer.region();
        log.reset(base, capacity);

        let a = Atom::new(1u32);
        let b = Atom::new(String::from("b"));
        let la = log.insert(&a).unwrap();
        let lb = log.insert(&b).unwrap();
        assert_ne!(la, lb);
        assert_eq!(log.insert(&a).unwrap(), la);
        assert_eq!(log.insert(&b).unwrap(), lb);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn exhausted() {
        let mut buffer = Stack::<16>.into_buffer();
        let mut log = Log::new();
        let (base, capacity) = buffer.region();
        log.reset(base, capacity);

        let a = Atom::new(1u8);
        assert_eq!(log.insert(&a), Err(StmError::LogExhausted));
        assert!(log.is_empty());
    }

    #[test]
    fn destroy_drops_values() {
        let tracker = Arc::new(());
        let atoms: Vec<_> = (0..10).map(|_| Atom::new(tracker.clone())).collect();
        assert_eq!(Arc::strong_count(&tracker), 11);

        let mut buffer = Heap::new(4096).into_buffer();
        let mut log = Log::new();
        let (base, capacity) = buffer.region();
        log.reset(base, capacity);
        for atom in &atoms {
            let link = log.insert(atom).unwrap();
            unsafe { log.record::<Arc<()>>(link) }.set(atom.unsafe_load());
        }
        assert_eq!(Arc::strong_count(&tracker), 21);

        // Half of the tree is flattened already.
        log.drain();
        log.destroy();
        assert_eq!(Arc::strong_count(&tracker), 11);
        assert!(log.is_empty());
    }

    proptest! {
        #[test]
        fn drain_is_ordered(order in proptest::collection::vec(0usize..64, 1..200)) {
            let atoms: Vec<Atom<u64>> = (0..64).map(Atom::new).collect();
            let mut buffer = Heap::new(64 * 128).into_buffer();
            let mut log = Log::new();
            let (base, capacity) = buffer.region();
            log.reset(base, capacity);

            let mut links = std::collections::HashMap::new();
            for &i in &order {
                let link = log.insert(&atoms[i]).unwrap();
                prop_assert_eq!(*links.entry(i).or_insert(link), link);
            }
            prop_assert_eq!(log.len(), links.len());

            let keys = keys(&mut log);
            prop_assert_eq!(keys.len(), links.len());
            prop_assert!(keys.windows(2).all(|w| w[0] < w[1]));
        }
    }
}

/*
 * This file is part of interlocked_map.
 *
 * interlocked_map is a concurrent associative map realized as a tree of
 * hash-bucket arrays, with per-leaf spinlocks and user-held interlocked
 * access to a key's value slot.
 *
 * Copyright (c) 2024, The interlocked_map Authors
 *
 * Licensed under the Apache License, Version 2.0 or the MIT license, at
 * your option. You may not use this file except in compliance with one of
 * these licenses. Copies of both licenses are provided in the LICENSE-APACHE
 * and LICENSE-MIT files at the root of this repository.
 *
*/

//! The leaf bucket: a fixed-capacity slot array with a top-hash filter.
//!
//! A [`DataNode`] holds up to [`CAPACITY`] key/value pairs. Its `state` word is the leaf-lock: a
//! caller must win a `UNLOCKED -> token` compare-exchange before touching `tophash`/`slots`, and
//! must observe `token` (not `INVALID`) there to safely proceed. See `crate::array` for how a
//! child slot's enum discriminant (not this word) distinguishes a `DataNode` from an `ArrayNode`.

use crate::array::ArrayNode;
use std::array;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Number of (hash, key, value) slots per leaf.
pub(crate) const CAPACITY: usize = 8;

pub(crate) const UNLOCKED: u64 = 0;
pub(crate) const INVALID: u64 = u64::MAX;

/// Outcome of a single acquisition attempt on a [`DataNode`].
pub(crate) enum Acquire {
    /// The calling thread now holds the leaf's lock.
    Locked,
    /// The leaf has been evacuated; reload the parent's child slot.
    Invalid,
    /// Another owner holds the leaf.
    Busy(u64),
}

pub(crate) struct DataNode<K, V> {
    state: AtomicU64,
    count: AtomicUsize,
    parent: *const ArrayNode<K, V>,
    parent_slot: usize,
    tophash: [AtomicU8; CAPACITY],
    // Safety: every read or write of `slots` requires the calling thread to currently hold
    // `state` (i.e. `state == this thread's token`). That invariant is upheld by every `unsafe
    // fn` below being called only from `map.rs`/`interlock.rs`/`iter.rs` while the leaf is held.
    slots: UnsafeCell<[Option<(K, V)>; CAPACITY]>,
}

// Safety: `DataNode` is only ever reached through an `Atomic`/`Shared` behind a `crossbeam-epoch`
// guard, or through a raw `parent` backlink to an `ArrayNode` that outlives every `DataNode`
// pointing at it; all interior mutation is guarded by `state` as documented above.
unsafe impl<K: Send, V: Send> Send for DataNode<K, V> {}
unsafe impl<K: Sync, V: Sync> Sync for DataNode<K, V> {}

impl<K, V> DataNode<K, V> {
    /// Creates a new leaf backed by `parent.children[parent_slot]`, with its lock already set to
    /// `initial_state` (either `UNLOCKED`, for a split-time target leaf that has not yet been
    /// published, or the installing caller's own token, for a leaf being created to immediately
    /// receive an insert).
    pub(crate) fn new(
        parent: *const ArrayNode<K, V>,
        parent_slot: usize,
        initial_state: u64,
    ) -> Self {
        Self {
            state: AtomicU64::new(initial_state),
            count: AtomicUsize::new(0),
            parent,
            parent_slot,
            tophash: array::from_fn(|_| AtomicU8::new(0)),
            slots: UnsafeCell::new([None, None, None, None, None, None, None, None]),
        }
    }

    /// Number of occupied slots. Safe to read without holding the lock (used for the lookup
    /// fast-path pre-check in §4.5).
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn parent(&self) -> &ArrayNode<K, V> {
        // Safety: Array nodes, once installed, live for the lifetime of the map (invariant 1).
        unsafe { &*self.parent }
    }

    pub(crate) fn parent_slot(&self) -> usize {
        self.parent_slot
    }

    /// Attempts to acquire the leaf's lock for `token`. Panics if `token` already holds it
    /// (self-reacquisition is an invariant violation per §4.1/§7).
    pub(crate) fn try_acquire(&self, token: u64) -> Acquire {
        let observed = self.state.load(Ordering::Acquire);
        if observed == token {
            panic!("interlocked_map: thread attempted to reacquire a leaf it already holds");
        }
        if observed == INVALID {
            return Acquire::Invalid;
        }
        if observed != UNLOCKED {
            return Acquire::Busy(observed);
        }
        match self
            .state
            .compare_exchange(UNLOCKED, token, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Acquire::Locked,
            Err(INVALID) => Acquire::Invalid,
            Err(now) => Acquire::Busy(now),
        }
    }

    /// Releases the lock back to `UNLOCKED`. Panics if `token` does not currently hold it.
    pub(crate) fn unlock(&self, token: u64) {
        let prev = self.state.swap(UNLOCKED, Ordering::Release);
        assert_eq!(
            prev, token,
            "interlocked_map: released a leaf not owned by the calling thread"
        );
    }

    /// Marks the leaf terminally `INVALID`. Panics if `token` does not currently hold it.
    pub(crate) fn invalidate(&self, token: u64) {
        let prev = self.state.swap(INVALID, Ordering::Release);
        assert_eq!(
            prev, token,
            "interlocked_map: invalidated a leaf not owned by the calling thread"
        );
    }

    /// Tries to CAS `UNLOCKED -> token` without the self-reacquisition panic check, for the
    /// iterator's "try once, never spin" contact policy (§4.8). Returns `true` on success.
    pub(crate) fn try_acquire_once_for_iteration(&self, token: u64) -> Acquire {
        match self
            .state
            .compare_exchange(UNLOCKED, token, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Acquire::Locked,
            Err(INVALID) => Acquire::Invalid,
            Err(now) => Acquire::Busy(now),
        }
    }

    /// # Safety
    /// The calling thread must currently hold this leaf's lock.
    unsafe fn slots(&self) -> &[Option<(K, V)>; CAPACITY] {
        &*self.slots.get()
    }

    /// # Safety
    /// The calling thread must currently hold this leaf's lock.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slots_mut(&self) -> &mut [Option<(K, V)>; CAPACITY] {
        &mut *self.slots.get()
    }

    /// Scans for a slot whose stored top-hash and key both match, stopping early once every
    /// occupied slot has been examined (§4.2). Requires the lock to be held.
    ///
    /// # Safety
    /// The calling thread must currently hold this leaf's lock.
    pub(crate) unsafe fn find(&self, top: u8, key: &K) -> Option<usize>
    where
        K: Eq,
    {
        let mut remaining = self.count();
        if remaining == 0 {
            return None;
        }
        let slots = self.slots();
        for i in 0..CAPACITY {
            if remaining == 0 {
                break;
            }
            let t = self.tophash[i].load(Ordering::Relaxed);
            if t == 0 {
                continue;
            }
            remaining -= 1;
            if t == top {
                if let Some((k, _)) = &slots[i] {
                    if k == key {
                        return Some(i);
                    }
                }
            }
        }
        None
    }

    /// # Safety
    /// The calling thread must currently hold this leaf's lock.
    pub(crate) unsafe fn first_empty(&self) -> Option<usize> {
        (0..CAPACITY).find(|&i| self.tophash[i].load(Ordering::Relaxed) == 0)
    }

    /// Reads the top-hash byte at `index` without requiring the lock (used by the iterator's
    /// empty-slot skip, which only needs to know "occupied or not").
    pub(crate) fn top_hash_at(&self, index: usize) -> u8 {
        self.tophash[index].load(Ordering::Relaxed)
    }

    /// Writes a new binding into an empty slot.
    ///
    /// # Safety
    /// The calling thread must currently hold this leaf's lock, and `index` must currently be
    /// empty.
    pub(crate) unsafe fn occupy(&self, index: usize, top: u8, key: K, value: V) {
        debug_assert_eq!(self.tophash[index].load(Ordering::Relaxed), 0);
        self.slots_mut()[index] = Some((key, value));
        self.tophash[index].store(top, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Replaces the value of an already-occupied slot, returning the old value.
    ///
    /// # Safety
    /// The calling thread must currently hold this leaf's lock, and `index` must currently be
    /// occupied.
    pub(crate) unsafe fn replace_value(&self, index: usize, value: V) -> V {
        let slot = self.slots_mut()[index]
            .as_mut()
            .expect("interlocked_map: replace_value on an empty slot");
        std::mem::replace(&mut slot.1, value)
    }

    /// Clears an occupied slot, returning its binding.
    ///
    /// # Safety
    /// The calling thread must currently hold this leaf's lock, and `index` must currently be
    /// occupied.
    pub(crate) unsafe fn vacate(&self, index: usize) -> (K, V) {
        self.tophash[index].store(0, Ordering::Relaxed);
        self.count.fetch_sub(1, Ordering::AcqRel);
        self.slots_mut()[index]
            .take()
            .expect("interlocked_map: vacate on an empty slot")
    }

    /// Borrows the value at `index` for as long as the caller continues to hold the lock.
    ///
    /// # Safety
    /// The calling thread must currently hold this leaf's lock, and `index` must currently be
    /// occupied.
    pub(crate) unsafe fn value_at(&self, index: usize) -> &V {
        &self.slots()[index].as_ref().expect("occupied slot").1
    }

    /// Returns every occupied `(key, value)` pair, in slot order, without removing them.
    ///
    /// # Safety
    /// The calling thread must currently hold this leaf's lock.
    pub(crate) unsafe fn occupied_pairs(&self) -> impl Iterator<Item = (usize, &K, &V)> {
        self.slots().iter().enumerate().filter_map(|(i, slot)| {
            slot.as_ref().map(|(k, v)| (i, k, v))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::ArrayNode;

    fn dummy_parent() -> Box<ArrayNode<i32, i32>> {
        Box::new(ArrayNode::new(32))
    }

    #[test]
    fn test_new_leaf_is_empty() {
        let parent = dummy_parent();
        let leaf: DataNode<i32, i32> = DataNode::new(&*parent as *const _, 0, UNLOCKED);
        assert_eq!(leaf.count(), 0);
        unsafe {
            assert!(leaf.find(5, &1).is_none());
            assert_eq!(leaf.first_empty(), Some(0));
        }
    }

    #[test]
    fn test_occupy_and_find_roundtrip() {
        let parent = dummy_parent();
        let leaf: DataNode<i32, i32> = DataNode::new(&*parent as *const _, 0, UNLOCKED);
        unsafe {
            leaf.occupy(0, 9, 1, 100);
            leaf.occupy(1, 9, 2, 200);
            assert_eq!(leaf.count(), 2);
            assert_eq!(leaf.find(9, &2), Some(1));
            assert_eq!(*leaf.value_at(1), 200);
            assert_eq!(leaf.find(9, &3), None);
        }
    }

    #[test]
    fn test_vacate_clears_tophash_and_decrements_count() {
        let parent = dummy_parent();
        let leaf: DataNode<i32, i32> = DataNode::new(&*parent as *const _, 0, UNLOCKED);
        unsafe {
            leaf.occupy(3, 7, 42, 420);
            assert_eq!(leaf.count(), 1);
            let (k, v) = leaf.vacate(3);
            assert_eq!((k, v), (42, 420));
            assert_eq!(leaf.count(), 0);
            assert_eq!(leaf.top_hash_at(3), 0);
            assert!(leaf.find(7, &42).is_none());
        }
    }

    #[test]
    fn test_lock_protocol_acquire_release_invalidate() {
        let parent = dummy_parent();
        let leaf: DataNode<i32, i32> = DataNode::new(&*parent as *const _, 0, UNLOCKED);
        assert!(matches!(leaf.try_acquire(4), Acquire::Locked));
        assert!(matches!(leaf.try_acquire(8), Acquire::Busy(4)));
        leaf.unlock(4);
        assert!(matches!(leaf.try_acquire(8), Acquire::Locked));
        leaf.invalidate(8);
        assert!(matches!(leaf.try_acquire(12), Acquire::Invalid));
    }

    #[test]
    #[should_panic(expected = "reacquire a leaf it already holds")]
    fn test_self_reacquisition_panics() {
        let parent = dummy_parent();
        let leaf: DataNode<i32, i32> = DataNode::new(&*parent as *const _, 0, UNLOCKED);
        assert!(matches!(leaf.try_acquire(4), Acquire::Locked));
        let _ = leaf.try_acquire(4);
    }

    #[test]
    #[should_panic(expected = "not owned by the calling thread")]
    fn test_unlock_by_non_owner_panics() {
        let parent = dummy_parent();
        let leaf: DataNode<i32, i32> = DataNode::new(&*parent as *const _, 0, UNLOCKED);
        assert!(matches!(leaf.try_acquire(4), Acquire::Locked));
        leaf.unlock(8);
    }
}

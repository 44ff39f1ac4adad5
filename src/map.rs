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

//! The public handle: tree descent, lazy leaf creation, splitting, lookup and removal.
//!
//! Every operation pins a `crossbeam-epoch` guard for as long as it needs to walk `Atomic` child
//! pointers, but never holds one across a call back out to user code (`get` hands back a
//! [`ValueRef`] that re-pins on drop instead).

use crate::array::{self, ArrayNode, Resolved, ROOT_FANOUT};
use crate::backoff::Backoff;
use crate::data::{Acquire, DataNode};
use crate::hashing::{seeded_hash, top_hash};
use crate::interlock::{self, Fast, FastDelete, FastGetOutcome};
use crate::token::caller_token;
use crossbeam_epoch::{self as epoch};
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Deepest level pre-expansion will eagerly materialize (§4.9): beyond this, leaves are still
/// created lazily on first insert, just like in a freshly constructed map.
const MAX_PREEXPAND_DEPTH: u32 = 2;

/// A concurrent associative map realized as a tree of hash-bucket leaf arrays.
///
/// `K` must be `Hash + Eq`; both `K` and `V` must be `Send + Sync + 'static` because leaves are
/// reclaimed through `crossbeam-epoch`, which requires that of anything it may later free on
/// another thread's behalf.
pub struct ConcurrentMap<K, V, S = RandomState> {
    root: Box<ArrayNode<K, V>>,
    hash_builder: S,
    len: AtomicUsize,
}

impl<K, V> ConcurrentMap<K, V, RandomState> {
    /// Creates an empty map using the standard library's default hasher.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }

    /// Creates an empty map pre-sized for roughly `size_hint` entries under `concurrency_hint`
    /// concurrent callers, using the standard library's default hasher.
    pub fn with_capacity_and_concurrency(size_hint: usize, concurrency_hint: usize) -> Self {
        Self::with_capacity_concurrency_and_hasher(size_hint, concurrency_hint, RandomState::new())
    }
}

impl<K, V> Default for ConcurrentMap<K, V, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> ConcurrentMap<K, V, S> {
    /// Creates an empty map using `hash_builder` as the base hash function.
    pub fn with_hasher(hash_builder: S) -> Self {
        Self {
            root: Box::new(ArrayNode::new(ROOT_FANOUT)),
            hash_builder,
            len: AtomicUsize::new(0),
        }
    }

    /// Creates an empty map pre-sized for roughly `size_hint` entries under `concurrency_hint`
    /// concurrent callers (clamped to the host's available parallelism), eagerly materializing
    /// internal `ArrayNode`s — never leaves — up to `min(D, 2)` levels deep (§4.9).
    pub fn with_capacity_concurrency_and_hasher(
        size_hint: usize,
        concurrency_hint: usize,
        hash_builder: S,
    ) -> Self {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or_else(|_| num_cpus::get());
        let concurrency = concurrency_hint.clamp(1, available);
        let target = concurrency.max(size_hint / crate::data::CAPACITY.max(1));

        let mut depth = 0u32;
        while depth < MAX_PREEXPAND_DEPTH && fanout_at_depth(depth) < target {
            depth += 1;
        }

        let root = Box::new(ArrayNode::new(ROOT_FANOUT));
        if depth > 0 {
            let guard = epoch::pin();
            preexpand(&root, depth, &guard);
        }
        Self {
            root,
            hash_builder,
            len: AtomicUsize::new(0),
        }
    }

    /// Number of entries currently in the map. May be stale the instant it returns under
    /// concurrent writers (invariant 6 bounds how stale, not whether it can change underfoot).
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn root_ptr(&self) -> usize {
        self.root.as_ref() as *const ArrayNode<K, V> as usize
    }

    pub(crate) fn note_insert(&self) {
        self.len.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn note_remove(&self) {
        self.len.fetch_sub(1, Ordering::AcqRel);
    }
}

fn fanout_at_depth(depth: u32) -> usize {
    ROOT_FANOUT * (1usize << depth)
}

/// Recursively installs empty `ArrayNode`s at every slot, `levels` deep.
fn preexpand<K, V>(array: &ArrayNode<K, V>, levels: u32, guard: &epoch::Guard) {
    if levels == 0 {
        return;
    }
    let child_fanout = array.fanout() * 2;
    for index in 0..array.fanout() {
        let child = ArrayNode::new(child_fanout);
        if let Ok(installed) = array::try_install_array(array, index, child, guard) {
            preexpand(installed, levels - 1, guard);
        }
    }
}

impl<K, V, S> ConcurrentMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    /// Descends to the leaf responsible for `key` (lazily creating it if necessary) and acquires
    /// its lock for the calling thread, restarting the whole descent on contention or on
    /// observing a leaf mid-retirement (`Acquire::Invalid`).
    pub(crate) fn acquire_leaf(&self, key: &K) -> (*const DataNode<K, V>, u64, u8) {
        let token = caller_token();
        let mut backoff = Backoff::new();
        loop {
            let guard = epoch::pin();
            let mut current: &ArrayNode<K, V> = &self.root;
            loop {
                let index = current.index_for(&self.hash_builder, key);
                match array::resolve(current, index, &guard) {
                    Resolved::Empty => {
                        match array::try_install_data(current, index, token, &guard) {
                            Ok(leaf) => {
                                let top =
                                    top_hash(seeded_hash(&self.hash_builder, key, current.seed()));
                                return (leaf as *const _, token, top);
                            }
                            Err(_) => break, // lost the race; restart the whole descent
                        }
                    }
                    Resolved::Array(next) => {
                        // Safety: ArrayNodes never move or get reclaimed once installed.
                        current = unsafe { array::extend_array_lifetime(next) };
                    }
                    Resolved::Data(leaf) => {
                        let top = top_hash(seeded_hash(&self.hash_builder, key, current.seed()));
                        match leaf.try_acquire(token) {
                            Acquire::Locked => return (leaf as *const _, token, top),
                            Acquire::Invalid => break,
                            Acquire::Busy(owner) => {
                                backoff.spin(|| format!("leaf held by token {owner}"));
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Descends without acquiring anything, short-circuiting to `true` the moment the walk hits
    /// an empty child slot or a leaf observed (without locking) to have `count() == 0` (§4.5/§4.6).
    /// A lookup or delete of a key that was never inserted uses this to avoid materializing a
    /// leaf or touching any lock; `false` only means "might be present", not "is present" — the
    /// caller still has to acquire and `find` to be sure.
    fn probably_absent(&self, key: &K) -> bool {
        let guard = epoch::pin();
        let mut current: &ArrayNode<K, V> = &self.root;
        loop {
            let index = current.index_for(&self.hash_builder, key);
            match array::resolve(current, index, &guard) {
                Resolved::Empty => return true,
                Resolved::Array(next) => current = next,
                Resolved::Data(leaf) => return leaf.count() == 0,
            }
        }
    }

    /// Splits a full leaf in place: builds a deeper `ArrayNode`, rehashes every existing entry
    /// into it with a fresh seed, stores `INVALID` into the old leaf's state (it is terminally
    /// dead from this point, per invariant 3 and §4.4), and publishes the new array in place of
    /// the old leaf. Returns the newly installed array so the caller can continue its insert one
    /// level down. `token` must be the token currently holding `leaf`'s lock.
    fn split<'s>(&'s self, leaf: &DataNode<K, V>, token: u64, guard: &epoch::Guard) -> &'s ArrayNode<K, V> {
        let parent = leaf.parent();
        let index = leaf.parent_slot();
        let new_fanout = parent.fanout() * 2;
        let new_array = ArrayNode::new(new_fanout);
        // Safety: we hold `leaf`'s lock, so no one else can be reading or writing its slots
        // concurrently; draining it via `vacate` (rather than copying) also means this rehash
        // needs no `Clone` bound on `K` or `V`. `new_array` is not yet reachable from any other
        // thread, so writing into its freshly created leaves without the lock protocol is sound.
        for slot in 0..crate::data::CAPACITY {
            if leaf.top_hash_at(slot) == 0 {
                continue;
            }
            let (k, v) = unsafe { leaf.vacate(slot) };
            let sub_index = new_array.index_for(&self.hash_builder, &k);
            let sub_top = top_hash(seeded_hash(&self.hash_builder, &k, new_array.seed()));
            let sub_leaf = match array::resolve(&new_array, sub_index, guard) {
                Resolved::Data(d) => d,
                Resolved::Empty => {
                    array::try_install_data(&new_array, sub_index, crate::data::UNLOCKED, guard)
                        .unwrap_or_else(|_| unreachable!("new_array is not yet shared"))
                }
                Resolved::Array(_) => unreachable!("freshly built array has no grandchildren"),
            };
            let sub_empty = unsafe { sub_leaf.first_empty() }
                .expect("a freshly split leaf cannot already be full");
            unsafe { sub_leaf.occupy(sub_empty, sub_top, k, v) };
        }
        leaf.invalidate(token);

        let expected = parent.slot(index).load(Ordering::Acquire, guard);
        match array::try_install_split(parent, index, expected, new_array, guard) {
            // Safety: ArrayNodes live for the map's lifetime once installed (invariant 1), so
            // extending `installed` from the guard's lifetime to `self`'s is sound.
            Ok(installed) => unsafe { array::extend_array_lifetime(installed) },
            Err(_) => unreachable!(
                "only the thread holding a leaf's lock ever splits it, so the CAS cannot race"
            ),
        }
    }

    /// Splits `leaf` (already held by `token`) and resolves/locks the sub-leaf that now owns
    /// `key`, for callers that need to materialize a slot for `key` after a full leaf splits:
    /// `put`'s split branch, and `interlock::fast_put`'s "leaf filled under a hold" case (§4.4,
    /// §4.7).
    pub(crate) fn split_and_lock<'s>(
        &'s self,
        leaf: &DataNode<K, V>,
        token: u64,
        key: &K,
        guard: &epoch::Guard,
    ) -> (&'s DataNode<K, V>, u8) {
        let new_array = self.split(leaf, token, guard);
        let sub_index = new_array.index_for(&self.hash_builder, key);
        let sub_top = top_hash(seeded_hash(&self.hash_builder, key, new_array.seed()));
        let sub_leaf = match array::resolve(new_array, sub_index, guard) {
            Resolved::Data(d) => {
                // Safety: `new_array` is not yet reachable from any other thread, so this leaf's
                // lock cannot be held by anyone else; the initial state left by `split` is
                // `UNLOCKED`, so acquiring it here cannot be a self-reacquisition.
                match d.try_acquire(token) {
                    Acquire::Locked => d,
                    _ => unreachable!("new_array is not yet visible to any other thread"),
                }
            }
            Resolved::Empty => {
                // None of the rehashed entries landed in this sub-slot; `key` is the first, so
                // the freshly installed leaf is already locked for `token`.
                array::try_install_data(new_array, sub_index, token, guard)
                    .unwrap_or_else(|_| unreachable!("new_array is not yet shared"))
            }
            Resolved::Array(_) => unreachable!("freshly built array has no grandchildren"),
        };
        (sub_leaf, sub_top)
    }

    /// Looks up `key`, returning a guard borrowing its value for as long as the guard lives.
    pub fn get(&self, key: &K) -> Option<ValueRef<'_, K, V, S>> {
        match interlock::fast_get(self, key) {
            Some(FastGetOutcome::Absent) => return None,
            Some(FastGetOutcome::Present(leaf_ptr, index, token)) => {
                return Some(ValueRef {
                    map: self,
                    leaf: leaf_ptr,
                    index,
                    token,
                    owns_lock: false,
                });
            }
            None => {}
        }
        if self.probably_absent(key) {
            return None;
        }
        let (leaf_ptr, token, top) = self.acquire_leaf(key);
        // Safety: we just acquired this leaf's lock above.
        let leaf = unsafe { &*leaf_ptr };
        match unsafe { leaf.find(top, key) } {
            Some(index) => Some(ValueRef {
                map: self,
                leaf: leaf_ptr,
                index,
                token,
                owns_lock: true,
            }),
            None => {
                let guard = epoch::pin();
                array::finish_leaf_use(leaf, token, &guard);
                None
            }
        }
    }

    /// Inserts `value` under `key`, returning the previous value if one was present.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let value = match interlock::fast_put(self, &key, value) {
            Fast::Done(old) => return old,
            Fast::NoHold(value) => value,
        };

        let (leaf_ptr, token, top) = self.acquire_leaf(&key);
        let leaf = unsafe { &*leaf_ptr };
        let guard = epoch::pin();
        if let Some(index) = unsafe { leaf.find(top, &key) } {
            let old = unsafe { leaf.replace_value(index, value) };
            array::finish_leaf_use(leaf, token, &guard);
            return Some(old);
        }
        if let Some(index) = unsafe { leaf.first_empty() } {
            unsafe { leaf.occupy(index, top, key, value) };
            self.note_insert();
            array::finish_leaf_use(leaf, token, &guard);
            return None;
        }

        // Leaf is full: split, then redo the insert one level down. The newly split array's
        // leaves are all fresh, so this second attempt cannot itself need to split again.
        let (sub_leaf, sub_top) = self.split_and_lock(leaf, token, &key, &guard);
        let index = unsafe { sub_leaf.first_empty() }.expect("freshly split leaf has room");
        unsafe { sub_leaf.occupy(index, sub_top, key, value) };
        self.note_insert();
        array::finish_leaf_use(sub_leaf, token, &guard);
        None
    }

    /// Removes `key`, returning `true` if it was present.
    pub fn delete(&self, key: &K) -> bool {
        match interlock::fast_delete(self, key) {
            FastDelete::Done(found) => return found,
            FastDelete::NoHold => {}
        }
        if self.probably_absent(key) {
            return false;
        }
        let (leaf_ptr, token, top) = self.acquire_leaf(key);
        let leaf = unsafe { &*leaf_ptr };
        let guard = epoch::pin();
        let found = match unsafe { leaf.find(top, key) } {
            Some(index) => {
                unsafe { leaf.vacate(index) };
                self.note_remove();
                true
            }
            None => false,
        };
        array::finish_leaf_use(leaf, token, &guard);
        found
    }

    /// Begins acquiring an interlocked hold on `key`: every subsequent `get`/`put`/`delete` call
    /// from this thread targeting the same key on this map is routed to a fast path that reuses
    /// the already-held leaf lock, until the returned guard is dropped (§4.7). Calling any of
    /// those operations for a *different* key on this map while the guard is alive panics.
    pub fn acquire(&self, key: K) -> interlock::InterlockedGuard<'_, K, V, S> {
        interlock::acquire(self, key)
    }

    /// A randomized, depth-first walk of every entry, visiting each leaf's children starting at a
    /// random offset and holding at most one leaf lock at a time (§4.8). Yields independent
    /// clones of each key/value pair as a consequence of draining and releasing a leaf before
    /// handing any of its entries back to the caller.
    pub fn iter(&self) -> crate::iter::Iter<'_, K, V, S>
    where
        K: Clone,
        V: Clone,
    {
        crate::iter::Iter::new(self)
    }

    pub(crate) fn hash_builder(&self) -> &S {
        &self.hash_builder
    }

    pub(crate) fn root(&self) -> &ArrayNode<K, V> {
        &self.root
    }
}

impl<K, V, S> fmt::Debug for ConcurrentMap<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentMap")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// An RAII guard borrowing the value bound to a single key, released on drop (§4.5).
pub struct ValueRef<'a, K, V, S = RandomState>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    map: &'a ConcurrentMap<K, V, S>,
    leaf: *const DataNode<K, V>,
    index: usize,
    token: u64,
    /// `false` when this guard was produced by the interlocked fast path, in which case an
    /// outstanding `acquire()` hold — not this guard — owns the leaf's lock.
    owns_lock: bool,
}

impl<K, V, S> Deref for ValueRef<'_, K, V, S>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    type Target = V;

    fn deref(&self) -> &V {
        // Safety: the leaf's lock is held for as long as this guard exists, whether owned
        // directly (`owns_lock`) or transitively through an outstanding `acquire()` hold.
        unsafe { (&*self.leaf).value_at(self.index) }
    }
}

impl<K, V, S> Drop for ValueRef<'_, K, V, S>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.owns_lock {
            let guard = epoch::pin();
            // Safety: see `Deref` above.
            let leaf = unsafe { &*self.leaf };
            array::finish_leaf_use(leaf, self.token, &guard);
        }
        let _ = self.map; // keeps the map borrowed for as long as the guard lives
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_then_get() {
        let map: ConcurrentMap<String, i32> = ConcurrentMap::new();
        assert_eq!(map.put("a".to_string(), 1), None);
        assert_eq!(*map.get(&"a".to_string()).unwrap(), 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_put_overwrites_and_returns_old_value() {
        let map: ConcurrentMap<i32, i32> = ConcurrentMap::new();
        assert_eq!(map.put(1, 10), None);
        assert_eq!(map.put(1, 20), Some(10));
        assert_eq!(*map.get(&1).unwrap(), 20);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_delete_removes_entry_and_updates_len() {
        let map: ConcurrentMap<i32, i32> = ConcurrentMap::new();
        map.put(1, 10);
        assert!(map.delete(&1));
        assert!(map.get(&1).is_none());
        assert_eq!(map.len(), 0);
        assert!(!map.delete(&1));
    }

    #[test]
    fn test_get_missing_key_is_none() {
        let map: ConcurrentMap<i32, i32> = ConcurrentMap::new();
        assert!(map.get(&42).is_none());
    }

    #[test]
    fn test_forces_a_split_beyond_root_leaf_capacity() {
        let map: ConcurrentMap<i32, i32> = ConcurrentMap::with_capacity_and_concurrency(0, 1);
        // Force many keys into the same root bucket's leaf by inserting far more than CAPACITY
        // entries overall; across ROOT_FANOUT buckets this reliably overflows at least one leaf.
        for i in 0..4096 {
            map.put(i, i * 2);
        }
        assert_eq!(map.len(), 4096);
        for i in 0..4096 {
            assert_eq!(*map.get(&i).unwrap(), i * 2);
        }
    }

    #[test]
    fn test_preexpansion_builds_deeper_tree_without_changing_semantics() {
        let map: ConcurrentMap<i32, i32> =
            ConcurrentMap::with_capacity_and_concurrency(10_000, 64);
        for i in 0..500 {
            map.put(i, i);
        }
        assert_eq!(map.len(), 500);
        for i in 0..500 {
            assert_eq!(*map.get(&i).unwrap(), i);
        }
    }
}

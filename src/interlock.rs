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

//! Interlocked access: a thread may hold at most one key's leaf lock per map at a time (§4.7).
//!
//! `acquire(key)` descends and locks the leaf exactly like `get`/`put`/`delete` do, then records
//! the hold in a thread-local table so that subsequent `get`/`put`/`delete` calls on the *same*
//! key reuse the already-held lock instead of trying (and failing, via the self-reacquisition
//! panic in `data.rs`) to lock it again. A call targeting a *different* key on the same map while
//! the hold is outstanding panics outright: the single-hold discipline is what keeps the whole
//! protocol deadlock-free (§9), and silently descending instead of panicking would just turn that
//! invariant violation into a much harder to diagnose hang or livelock.

use crate::array;
use crate::data::DataNode;
use crate::map::ConcurrentMap;
use std::cell::RefCell;
use std::hash::{BuildHasher, Hash};

struct HoldRecord<K, V> {
    map_ptr: usize,
    leaf: *const DataNode<K, V>,
    key: K,
    top: u8,
    index: Option<usize>,
    token: u64,
}

/// Runs `f` against this thread's hold table for the `(K, V)` pair. The `thread_local!` lives
/// inside this generic function so each monomorphization gets its own independent table — a
/// thread holding a `ConcurrentMap<String, i32>` key never contends with one holding a
/// `ConcurrentMap<u64, Widget>` key's bookkeeping.
fn with_holds<K, V, R>(f: impl FnOnce(&mut Vec<HoldRecord<K, V>>) -> R) -> R
where
    K: 'static,
    V: 'static,
{
    thread_local! {
        static HOLDS: RefCell<Vec<HoldRecord<K, V>>> = const { RefCell::new(Vec::new()) };
    }
    HOLDS.with(|cell| f(&mut cell.borrow_mut()))
}

fn find_mismatch_checked<'a, K: Eq, V>(
    holds: &'a mut [HoldRecord<K, V>],
    map_ptr: usize,
    key: &K,
) -> Option<&'a mut HoldRecord<K, V>> {
    let rec = holds.iter_mut().find(|r| r.map_ptr == map_ptr)?;
    if &rec.key != key {
        panic!(
            "interlocked_map: thread touched a different key on a map while holding an \
             interlocked key (single-hold-per-map discipline, §4.7/§9)"
        );
    }
    Some(rec)
}

pub(crate) enum FastGetOutcome<K, V> {
    Absent,
    Present(*const DataNode<K, V>, usize, u64),
}

pub(crate) fn fast_get<K, V, S>(
    map: &ConcurrentMap<K, V, S>,
    key: &K,
) -> Option<FastGetOutcome<K, V>>
where
    K: Eq + 'static,
    V: 'static,
{
    let map_ptr = map.root_ptr();
    with_holds::<K, V, _>(|holds| {
        let rec = find_mismatch_checked(holds, map_ptr, key)?;
        Some(match rec.index {
            None => FastGetOutcome::Absent,
            Some(index) => FastGetOutcome::Present(rec.leaf, index, rec.token),
        })
    })
}

pub(crate) enum Fast<V> {
    NoHold(V),
    Done(Option<V>),
}

pub(crate) fn fast_put<K, V, S>(map: &ConcurrentMap<K, V, S>, key: &K, value: V) -> Fast<V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    let map_ptr = map.root_ptr();
    with_holds::<K, V, _>(|holds| {
        let rec = match find_mismatch_checked(holds, map_ptr, key) {
            Some(rec) => rec,
            None => return Fast::NoHold(value),
        };
        match rec.index {
            Some(index) => {
                // Safety: the outstanding `acquire()` hold owns this leaf's lock.
                let old = unsafe { (&*rec.leaf).replace_value(index, value) };
                Fast::Done(Some(old))
            }
            None => {
                // Safety: see above.
                let leaf = unsafe { &*rec.leaf };
                let index = unsafe { leaf.first_empty() };
                let index = match index {
                    Some(index) => {
                        unsafe { leaf.occupy(index, rec.top, key.clone(), value) };
                        index
                    }
                    None => {
                        // The held leaf filled up under us: split it (§4.4) and rebind the hold
                        // to the sub-leaf that now owns `key`, exactly like `put`'s own split
                        // branch does for an unheld insert (§4.7).
                        let guard = crossbeam_epoch::pin();
                        let (sub_leaf, sub_top) =
                            map.split_and_lock(leaf, rec.token, key, &guard);
                        let index = unsafe { sub_leaf.first_empty() }
                            .expect("interlocked_map: freshly split leaf has room");
                        unsafe { sub_leaf.occupy(index, sub_top, key.clone(), value) };
                        rec.leaf = sub_leaf as *const _;
                        rec.top = sub_top;
                        index
                    }
                };
                rec.index = Some(index);
                map.note_insert();
                Fast::Done(None)
            }
        }
    })
}

pub(crate) enum FastDelete {
    NoHold,
    Done(bool),
}

pub(crate) fn fast_delete<K, V, S>(map: &ConcurrentMap<K, V, S>, key: &K) -> FastDelete
where
    K: Eq + 'static,
    V: 'static,
{
    let map_ptr = map.root_ptr();
    with_holds::<K, V, _>(|holds| {
        let rec = match find_mismatch_checked(holds, map_ptr, key) {
            Some(rec) => rec,
            None => return FastDelete::NoHold,
        };
        match rec.index.take() {
            None => FastDelete::Done(false),
            Some(index) => {
                // Safety: see `fast_put`.
                unsafe { (&*rec.leaf).vacate(index) };
                map.note_remove();
                FastDelete::Done(true)
            }
        }
    })
}

/// Begins an interlocked hold on `key`. See [`ConcurrentMap::acquire`](crate::map::ConcurrentMap::acquire).
pub(crate) fn acquire<'a, K, V, S>(
    map: &'a ConcurrentMap<K, V, S>,
    key: K,
) -> InterlockedGuard<'a, K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    let map_ptr = map.root_ptr();
    let already_held = with_holds::<K, V, _>(|holds| holds.iter().any(|r| r.map_ptr == map_ptr));
    if already_held {
        panic!(
            "interlocked_map: thread attempted a second interlocked acquire() on the same map \
             (single-hold-per-map discipline, §4.7/§9)"
        );
    }

    let (leaf_ptr, token, top) = map.acquire_leaf(&key);
    // Safety: we just acquired this leaf's lock above.
    let leaf = unsafe { &*leaf_ptr };
    let index = unsafe { leaf.find(top, &key) };
    with_holds::<K, V, _>(|holds| {
        holds.push(HoldRecord {
            map_ptr,
            leaf: leaf_ptr,
            key: key.clone(),
            top,
            index,
            token,
        });
    });
    InterlockedGuard {
        map,
        map_ptr,
        released: false,
    }
}

fn release<K, V>(map_ptr: usize)
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let record = with_holds::<K, V, _>(|holds| {
        let position = holds.iter().position(|r| r.map_ptr == map_ptr)?;
        Some(holds.remove(position))
    });
    if let Some(rec) = record {
        let guard = crossbeam_epoch::pin();
        // Safety: this thread has held the lock continuously since `acquire()`.
        let leaf = unsafe { &*rec.leaf };
        array::finish_leaf_use(leaf, rec.token, &guard);
    }
}

/// RAII handle returned by [`ConcurrentMap::acquire`](crate::map::ConcurrentMap::acquire):
/// releases the interlocked hold when dropped.
pub struct InterlockedGuard<'a, K, V, S = std::collections::hash_map::RandomState>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    map: &'a ConcurrentMap<K, V, S>,
    map_ptr: usize,
    released: bool,
}

impl<K, V, S> InterlockedGuard<'_, K, V, S>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Ends the hold early, equivalent to dropping the guard.
    pub fn release(mut self) {
        self.released = true;
        release::<K, V>(self.map_ptr);
    }
}

impl<K, V, S> Drop for InterlockedGuard<'_, K, V, S>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn drop(&mut self) {
        if !self.released {
            release::<K, V>(self.map_ptr);
        }
        let _ = self.map; // keeps the map borrowed for as long as the guard lives
    }
}

#[cfg(test)]
mod tests {
    use crate::map::ConcurrentMap;

    #[test]
    fn test_acquire_then_get_same_key_uses_fast_path() {
        let map: ConcurrentMap<i32, i32> = ConcurrentMap::new();
        map.put(1, 100);
        let hold = map.acquire(1);
        assert_eq!(*map.get(&1).unwrap(), 100);
        drop(hold);
        assert_eq!(*map.get(&1).unwrap(), 100);
    }

    #[test]
    fn test_acquire_put_delete_roundtrip_under_hold() {
        let map: ConcurrentMap<i32, i32> = ConcurrentMap::new();
        let hold = map.acquire(7);
        assert!(map.get(&7).is_none());
        assert_eq!(map.put(7, 1), None);
        assert_eq!(*map.get(&7).unwrap(), 1);
        assert!(map.delete(&7));
        assert!(map.get(&7).is_none());
        drop(hold);
        assert_eq!(map.len(), 0);
    }

    #[test]
    #[should_panic(expected = "single-hold-per-map discipline")]
    fn test_cross_key_access_under_hold_panics() {
        let map: ConcurrentMap<i32, i32> = ConcurrentMap::new();
        let _hold = map.acquire(1);
        let _ = map.get(&2);
    }

    #[test]
    #[should_panic(expected = "second interlocked acquire")]
    fn test_second_acquire_on_same_map_panics() {
        let map: ConcurrentMap<i32, i32> = ConcurrentMap::new();
        let _first = map.acquire(1);
        let _second = map.acquire(2);
    }
}

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

//! The internal tree node: a sized slice of child pointers plus a per-node hash seed.
//!
//! An `ArrayNode`'s identity never changes once installed (invariant 1); only its `children`
//! slots mutate, via `compare_exchange` on a `crossbeam_epoch::Atomic`. The ARRAY/DATA
//! distinction is, here, simply the [`Child`] enum discriminant — inspected once per descent step
//! under an epoch guard.

use crate::data::DataNode;
use crate::hashing::seeded_hash;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Root fanout; doubles at every depth below the root (`32 * 2^depth`).
pub(crate) const ROOT_FANOUT: usize = 32;

/// A child of an [`ArrayNode`]: either a deeper internal node, or a leaf bucket.
pub(crate) enum Child<K, V> {
    Array(ArrayNode<K, V>),
    Data(DataNode<K, V>),
}

pub(crate) struct ArrayNode<K, V> {
    seed: u64,
    children: Box<[Atomic<Child<K, V>>]>,
    count: AtomicUsize,
}

impl<K, V> ArrayNode<K, V> {
    /// Creates a new, empty `ArrayNode` with `fanout` child slots and a freshly drawn seed
    /// (invariant 5: distinct, with high probability, from every ancestor's).
    pub(crate) fn new(fanout: usize) -> Self {
        let children = (0..fanout)
            .map(|_| Atomic::null())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            seed: rand::random(),
            children,
            count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fanout(&self) -> usize {
        self.children.len()
    }

    pub(crate) fn seed(&self) -> u64 {
        self.seed
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn increment_count(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement_count(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    /// `hash(key, self.seed) mod self.fanout()` — the child selection rule used at every depth.
    pub(crate) fn index_for<S: BuildHasher>(&self, hash_builder: &S, key: &K) -> usize
    where
        K: Hash,
    {
        (seeded_hash(hash_builder, key, self.seed) as usize) % self.fanout()
    }

    pub(crate) fn slot(&self, index: usize) -> &Atomic<Child<K, V>> {
        &self.children[index]
    }

    pub(crate) fn raw(&self) -> *const ArrayNode<K, V> {
        self as *const _
    }
}

/// What a child slot currently holds, resolved under an epoch guard.
pub(crate) enum Resolved<'g, K, V> {
    Empty,
    Array(&'g ArrayNode<K, V>),
    Data(&'g DataNode<K, V>),
}

/// Resolves `array.children[index]` under `guard`.
pub(crate) fn resolve<'g, K, V>(
    array: &ArrayNode<K, V>,
    index: usize,
    guard: &'g Guard,
) -> Resolved<'g, K, V> {
    let shared = array.slot(index).load(Ordering::Acquire, guard);
    if shared.is_null() {
        return Resolved::Empty;
    }
    // Safety: a non-null `Shared` loaded under a pinned guard is valid to dereference for the
    // guard's lifetime; the slot is never deallocated without going through this same guard's
    // epoch (reclamation happens via `Guard::defer_destroy`, never a direct free).
    match unsafe { shared.deref() } {
        Child::Array(a) => Resolved::Array(a),
        Child::Data(d) => Resolved::Data(d),
    }
}

/// Attempts to atomically install a brand-new, pre-locked leaf into an empty slot.
///
/// On success, returns the installed leaf and bumps `array.count`. On failure (someone else
/// installed first), returns the `Shared` now occupying the slot so the caller can resolve it.
pub(crate) fn try_install_data<'g, K, V>(
    array: &ArrayNode<K, V>,
    index: usize,
    initial_state: u64,
    guard: &'g Guard,
) -> Result<&'g DataNode<K, V>, Shared<'g, Child<K, V>>> {
    let leaf = Owned::new(Child::Data(DataNode::new(array.raw(), index, initial_state)));
    match array.slot(index).compare_exchange(
        Shared::null(),
        leaf,
        Ordering::AcqRel,
        Ordering::Acquire,
        guard,
    ) {
        Ok(installed) => {
            array.increment_count();
            // Safety: we just installed this value ourselves.
            match unsafe { installed.deref() } {
                Child::Data(d) => Ok(d),
                Child::Array(_) => unreachable!("just installed a Data child"),
            }
        }
        Err(e) => Err(e.current),
    }
}

/// Atomically replaces a full leaf (`expected`) with a freshly built `ArrayNode` (the split
/// result). Retires the old leaf's allocation via `guard.defer_destroy` on success.
///
/// Returns `true` if this caller won the race to publish the split.
pub(crate) fn try_install_split<'g, K, V>(
    array: &ArrayNode<K, V>,
    index: usize,
    expected: Shared<'g, Child<K, V>>,
    new_array: ArrayNode<K, V>,
    guard: &'g Guard,
) -> Result<&'g ArrayNode<K, V>, ArrayNode<K, V>>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let owned = Owned::new(Child::Array(new_array));
    match array
        .slot(index)
        .compare_exchange(expected, owned, Ordering::AcqRel, Ordering::Acquire, guard)
    {
        Ok(installed) => {
            // Safety: `expected` is being unlinked and is unreachable from any future load of
            // this slot; no other code path ever keeps a pointer to a Data child across a
            // `try_acquire`, so it is safe to retire for epoch-based reclamation.
            unsafe { guard.defer_destroy(expected) };
            match unsafe { installed.deref() } {
                Child::Array(a) => Ok(a),
                Child::Data(_) => unreachable!("just installed an Array child"),
            }
        }
        Err(e) => {
            // Recover the `ArrayNode` we built so the caller doesn't leak the rehashed leaves.
            match (*e.new.into_box()).into_array_node() {
                Some(a) => Err(a),
                None => unreachable!("we only ever offer an Array child here"),
            }
        }
    }
}

impl<K, V> Child<K, V> {
    fn into_array_node(self) -> Option<ArrayNode<K, V>> {
        match self {
            Child::Array(a) => Some(a),
            Child::Data(_) => None,
        }
    }
}

/// CAS-clears an occupied child slot back to empty (used when a leaf empties out, §4.6/§4.7).
/// Retires the old leaf via `guard.defer_destroy` on success.
pub(crate) fn try_clear<'g, K, V>(
    array: &ArrayNode<K, V>,
    index: usize,
    expected: Shared<'g, Child<K, V>>,
    guard: &'g Guard,
) -> bool
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let ok = array
        .slot(index)
        .compare_exchange(
            expected,
            Shared::null(),
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        )
        .is_ok();
    if ok {
        array.decrement_count();
        // Safety: see `try_install_split`.
        unsafe { guard.defer_destroy(expected) };
    }
    ok
}

/// Attempts to install a brand-new, empty `ArrayNode` into an empty slot (pre-expansion at
/// construction time, §4.9). Unlike `try_install_split` this never replaces an occupied slot.
pub(crate) fn try_install_array<'g, K, V>(
    array: &ArrayNode<K, V>,
    index: usize,
    new_array: ArrayNode<K, V>,
    guard: &'g Guard,
) -> Result<&'g ArrayNode<K, V>, Shared<'g, Child<K, V>>> {
    let child = Owned::new(Child::Array(new_array));
    match array.slot(index).compare_exchange(
        Shared::null(),
        child,
        Ordering::AcqRel,
        Ordering::Acquire,
        guard,
    ) {
        Ok(installed) => {
            array.increment_count();
            // Safety: we just installed this value ourselves.
            match unsafe { installed.deref() } {
                Child::Array(a) => Ok(a),
                Child::Data(_) => unreachable!("just installed an Array child"),
            }
        }
        Err(e) => Err(e.current),
    }
}

/// A caller that holds `leaf`'s lock (`token`) is done with it: if the leaf is now empty, retire
/// it (invalidate, then unlink from its parent) instead of merely unlocking, so a future descent
/// never has to stop at a dead end (§4.6). Otherwise, a plain unlock.
pub(crate) fn finish_leaf_use<K, V>(leaf: &DataNode<K, V>, token: u64, guard: &Guard)
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    if leaf.count() != 0 {
        leaf.unlock(token);
        return;
    }
    leaf.invalidate(token);
    let parent = leaf.parent();
    let index = leaf.parent_slot();
    let current = parent.slot(index).load(Ordering::Acquire, guard);
    // Safety: while this thread held `leaf`'s lock, no other path could have replaced or cleared
    // this exact slot (`try_install_split`/`try_clear` both require a matching `expected`, and
    // `try_install_data` only targets an already-empty slot); the CAS below is expected to always
    // succeed. If it somehow doesn't, the leaf is left `INVALID` and future descenders simply
    // retry their own descent, which is safe, if momentarily wasteful.
    let unlinked = try_clear(parent, index, current, guard);
    debug_assert!(unlinked, "interlocked_map: failed to unlink an empty leaf we exclusively held");
}

/// Extends an `&ArrayNode` resolved under a transient epoch guard to the map's own lifetime.
///
/// # Safety
/// Sound only because `ArrayNode`s, once installed, are never retired or freed for the lifetime
/// of the map (invariant 1): only `DataNode`s are ever passed to `guard.defer_destroy`.
pub(crate) unsafe fn extend_array_lifetime<'a, 'g, K, V>(
    a: &'g ArrayNode<K, V>,
) -> &'a ArrayNode<K, V> {
    &*(a as *const ArrayNode<K, V>)
}

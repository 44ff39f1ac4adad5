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

//! Seeded hashing and the top-hash filter byte.
//!
//! Each [`ArrayNode`](crate::array::ArrayNode) draws its own `seed` on construction; the child
//! index at that node is `hash(key, seed) mod fanout`. The seed is mixed into the caller-supplied
//! `BuildHasher` rather than into the key bytes directly, so callers keep full control over the
//! base hash function while each node still gets a hash stream that is, with high probability,
//! independent of its ancestors'.

use std::hash::{BuildHasher, Hash, Hasher};

/// Computes `hash(key, seed)` for a node with the given seed, using `hash_builder` as the base
/// hash function.
pub(crate) fn seeded_hash<K, S>(hash_builder: &S, key: &K, seed: u64) -> u64
where
    K: Hash + ?Sized,
    S: BuildHasher,
{
    let mut hasher = hash_builder.build_hasher();
    seed.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish()
}

/// Extracts the top-hash byte from a full hash, remapping `0` to `1` since `0` is reserved to
/// mean "slot empty".
pub(crate) fn top_hash(full_hash: u64) -> u8 {
    let byte = (full_hash >> 56) as u8;
    if byte == 0 {
        1
    } else {
        byte
    }
}

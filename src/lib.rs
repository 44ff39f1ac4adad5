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

//! A concurrent associative map realized as a tree of hash-bucket leaf arrays.
//!
//! Unlike a single-mutex table or a fixed-fanout striped-lock table, [`ConcurrentMap`] grows
//! locally at points of hash collision: each leaf (`DataNode`) holds up to 8 entries behind its
//! own spinlock, and a leaf that fills up splits into a freshly seeded internal node (`ArrayNode`)
//! rather than forcing a global rehash. Mutations and lookups therefore touch at most one leaf
//! lock at a time, and unrelated keys essentially never contend.
//!
//! ```
//! use interlocked_map::ConcurrentMap;
//!
//! let map: ConcurrentMap<String, u32> = ConcurrentMap::new();
//! map.put("clicks".to_string(), 1);
//! assert_eq!(*map.get(&"clicks".to_string()).unwrap(), 1);
//! ```
//!
//! Beyond the plain `get`/`put`/`delete` surface, [`ConcurrentMap::acquire`] gives a caller
//! exclusive, re-entrant-from-the-same-thread access to one key's slot across several operations
//! without re-descending the tree each time, and [`ConcurrentMap::iter`] walks every entry with a
//! randomized traversal order designed to avoid convoying under concurrent iteration.

mod array;
mod backoff;
mod data;
mod hashing;
mod interlock;
mod iter;
mod map;
mod token;

pub use interlock::InterlockedGuard;
pub use iter::Iter;
pub use map::{ConcurrentMap, ValueRef};

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

//! Randomized depth-first iteration with a skip-and-poll backlog (§4.8).
//!
//! At each `ArrayNode` level, children are visited starting from a random offset and wrapping
//! around, so concurrent iterators over the same map don't all contend on the same first slot. A
//! leaf that can't be locked on first contact is set aside in a backlog and retried, with
//! escalating back-off between rounds, only once the depth-first walk itself is exhausted. At most
//! one leaf lock is held at a time, and it is always released — via `array::finish_leaf_use`,
//! same as every other operation — before `next()` returns, so calling `get`/`put`/`delete` (even
//! `acquire`) from inside a `for` loop over an `Iter` never self-deadlocks.

use crate::array::{self, ArrayNode, Resolved};
use crate::backoff::Backoff;
use crate::data::Acquire;
use crate::map::ConcurrentMap;
use crossbeam_epoch as epoch;
use std::collections::VecDeque;
use std::hash::Hash;

struct Frame<'a, K, V> {
    array: &'a ArrayNode<K, V>,
    start: usize,
    visited: usize,
}

/// A snapshot-per-leaf iterator over a [`ConcurrentMap`](crate::map::ConcurrentMap)'s entries.
pub struct Iter<'a, K, V, S> {
    map: &'a ConcurrentMap<K, V, S>,
    stack: Vec<Frame<'a, K, V>>,
    /// Leaves that failed first-contact acquisition, recorded as `(parent, index)` rather than a
    /// direct pointer: a `DataNode` *can* be reclaimed while backlogged (unlike an `ArrayNode`),
    /// so every retry re-resolves the slot fresh instead of risking a dangling reference.
    backlog: Vec<(&'a ArrayNode<K, V>, usize)>,
    queue: VecDeque<(K, V)>,
}

impl<'a, K, V, S> Iter<'a, K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(map: &'a ConcurrentMap<K, V, S>) -> Self {
        let root = map.root();
        let start = if root.fanout() == 0 {
            0
        } else {
            rand::random::<usize>() % root.fanout()
        };
        Self {
            map,
            stack: vec![Frame {
                array: root,
                start,
                visited: 0,
            }],
            backlog: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    fn drain_leaf(&mut self, leaf: &crate::data::DataNode<K, V>, token: u64, guard: &epoch::Guard) {
        for (_, k, v) in unsafe { leaf.occupied_pairs() } {
            self.queue.push_back((k.clone(), v.clone()));
        }
        array::finish_leaf_use(leaf, token, guard);
    }

    fn advance(&mut self) {
        'outer: loop {
            if !self.queue.is_empty() {
                return;
            }
            if let Some(frame) = self.stack.last_mut() {
                if frame.visited >= frame.array.fanout() {
                    self.stack.pop();
                    continue;
                }
                let array_ref = frame.array;
                let index = (frame.start + frame.visited) % array_ref.fanout();
                frame.visited += 1;
                let guard = epoch::pin();
                match array::resolve(array_ref, index, &guard) {
                    Resolved::Empty => continue,
                    Resolved::Array(a) => {
                        // Safety: ArrayNodes live for the map's lifetime once installed.
                        let a = unsafe { array::extend_array_lifetime(a) };
                        let start = if a.fanout() == 0 {
                            0
                        } else {
                            rand::random::<usize>() % a.fanout()
                        };
                        self.stack.push(Frame {
                            array: a,
                            start,
                            visited: 0,
                        });
                    }
                    Resolved::Data(leaf) => {
                        let token = crate::token::caller_token();
                        match leaf.try_acquire_once_for_iteration(token) {
                            Acquire::Locked => {
                                self.drain_leaf(leaf, token, &guard);
                                return;
                            }
                            Acquire::Invalid => continue,
                            Acquire::Busy(_) => self.backlog.push((array_ref, index)),
                        }
                    }
                }
                continue;
            }

            if self.backlog.is_empty() {
                return;
            }

            let mut backoff = Backoff::new();
            loop {
                let mut made_progress = false;
                let mut i = 0;
                while i < self.backlog.len() {
                    let (array_ref, index) = self.backlog[i];
                    let guard = epoch::pin();
                    match array::resolve(array_ref, index, &guard) {
                        Resolved::Empty => {
                            self.backlog.swap_remove(i);
                            made_progress = true;
                        }
                        Resolved::Array(a) => {
                            // Safety: see above.
                            let a = unsafe { array::extend_array_lifetime(a) };
                            self.backlog.swap_remove(i);
                            let start = if a.fanout() == 0 {
                                0
                            } else {
                                rand::random::<usize>() % a.fanout()
                            };
                            self.stack.push(Frame {
                                array: a,
                                start,
                                visited: 0,
                            });
                            made_progress = true;
                        }
                        Resolved::Data(leaf) => {
                            let token = crate::token::caller_token();
                            match leaf.try_acquire_once_for_iteration(token) {
                                Acquire::Locked => {
                                    self.backlog.swap_remove(i);
                                    self.drain_leaf(leaf, token, &guard);
                                    made_progress = true;
                                }
                                Acquire::Invalid => {
                                    self.backlog.swap_remove(i);
                                    made_progress = true;
                                }
                                Acquire::Busy(_) => i += 1,
                            }
                        }
                    }
                    if !self.queue.is_empty() || !self.stack.is_empty() {
                        continue 'outer;
                    }
                }
                if self.backlog.is_empty() {
                    break;
                }
                if !made_progress {
                    backoff.spin(|| {
                        format!("iterator polling {} backlogged leaves", self.backlog.len())
                    });
                }
            }
        }
    }
}

impl<K, V, S> Iterator for Iter<'_, K, V, S>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        if self.queue.is_empty() {
            self.advance();
        }
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use crate::map::ConcurrentMap;
    use std::collections::HashSet;

    #[test]
    fn test_iterate_empty_map_yields_nothing() {
        let map: ConcurrentMap<i32, i32> = ConcurrentMap::new();
        assert_eq!(map.iter().count(), 0);
    }

    #[test]
    fn test_iterate_visits_every_entry_exactly_once() {
        let map: ConcurrentMap<i32, i32> = ConcurrentMap::new();
        for i in 0..2000 {
            map.put(i, i * 10);
        }
        let mut seen = HashSet::new();
        for (k, v) in map.iter() {
            assert_eq!(v, k * 10);
            assert!(seen.insert(k), "key {k} yielded more than once");
        }
        assert_eq!(seen.len(), 2000);
    }

    #[test]
    fn test_iteration_does_not_self_deadlock_on_get() {
        let map: ConcurrentMap<i32, i32> = ConcurrentMap::new();
        for i in 0..50 {
            map.put(i, i);
        }
        for (k, _) in map.iter() {
            assert_eq!(*map.get(&k).unwrap(), k);
        }
    }
}

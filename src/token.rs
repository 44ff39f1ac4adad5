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

//! Per-thread caller identity tokens.
//!
//! A token is a stable, nonzero, 4-aligned word identifying the calling thread to the
//! leaf-lock protocol. Tokens are minted 4 apart starting at 4, so they can never collide
//! with either of the two state sentinels (`UNLOCKED = 0`, `INVALID = u64::MAX`).

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(4);

thread_local! {
    static TOKEN: Cell<u64> = Cell::new(0);
}

/// Returns this thread's stable owner token, minting one on first use.
pub(crate) fn caller_token() -> u64 {
    TOKEN.with(|cell| {
        let existing = cell.get();
        if existing != 0 {
            return existing;
        }
        let minted = NEXT_TOKEN.fetch_add(4, Ordering::Relaxed);
        cell.set(minted);
        minted
    })
}

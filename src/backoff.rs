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

//! Contention back-off: tight spin, then thread-yield, then exponentially doubling sleep.
//!
//! Used whenever an acquisition observes a leaf held by a *different* owner. Never used while a
//! leaf the spinning thread itself owns is held elsewhere in the call stack (the single-leaf
//! discipline in `interlock.rs` makes that impossible).

use std::hint;
use std::thread;
use std::time::Duration;

/// Rounds of tight CPU spin before falling back to `thread::yield_now`.
const GOSCHED_AFTER: u32 = 20;
/// Rounds of `thread::yield_now` before falling back to timed sleep.
const SLEEP_AFTER: u32 = 40;
/// Rounds of escalating sleep before the back-off gives up and escalates to a diagnostic abort.
///
/// Chosen generously: a legitimate interlocked hold (e.g. a slow iterator consumer) should never
/// be mistaken for a stuck thread. This is an observation-window heuristic, not a real waiter
/// graph.
const DEADLOCK_SPIN_THRESHOLD: u32 = 200_000;

const SLEEP_START: Duration = Duration::from_micros(1);
const SLEEP_CAP: Duration = Duration::from_millis(1);

/// One thread's escalation state while contending for a single leaf.
pub(crate) struct Backoff {
    rounds: u32,
    sleep: Duration,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self {
            rounds: 0,
            sleep: SLEEP_START,
        }
    }

    /// Resets the escalation; call whenever the observed owner changes, since that means
    /// progress is happening even though this thread hasn't gotten in yet.
    pub(crate) fn reset(&mut self) {
        self.rounds = 0;
        self.sleep = SLEEP_START;
    }

    /// Spins, yields, or sleeps one round, escalating each call. Panics (after logging) if the
    /// round count crosses [`DEADLOCK_SPIN_THRESHOLD`].
    ///
    /// `describe` is called lazily (only on the abort path) to format a diagnostic.
    pub(crate) fn spin(&mut self, describe: impl FnOnce() -> String) {
        if self.rounds >= DEADLOCK_SPIN_THRESHOLD {
            let msg = describe();
            log::error!(
                "leaf acquisition did not complete after {} back-off rounds: {msg}",
                self.rounds
            );
            panic!("interlocked_map: suspected deadlock acquiring a leaf: {msg}");
        }
        if self.rounds < GOSCHED_AFTER {
            for _ in 0..(1u32 << self.rounds.min(6)) {
                hint::spin_loop();
            }
        } else if self.rounds < SLEEP_AFTER {
            thread::yield_now();
        } else {
            thread::sleep(self.sleep);
            self.sleep = (self.sleep * 2).min(SLEEP_CAP);
        }
        self.rounds += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_restores_initial_state() {
        let mut b = Backoff::new();
        for _ in 0..5 {
            b.spin(|| String::new());
        }
        b.reset();
        assert_eq!(b.rounds, 0);
        assert_eq!(b.sleep, SLEEP_START);
    }

    #[test]
    #[should_panic(expected = "suspected deadlock")]
    fn test_spin_escalates_to_panic_eventually() {
        let mut b = Backoff::new();
        b.rounds = DEADLOCK_SPIN_THRESHOLD;
        b.spin(|| "test probe".to_string());
    }
}

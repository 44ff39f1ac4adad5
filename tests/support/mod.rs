//! A trimmed N-worker harness for scenario and property tests.
//!
//! Grounded on `libstress::Workpool`'s shape (spawn N workers, hand each a closure, join them all)
//! but narrowed to the one pattern these tests need: a fixed worker count known up front, each
//! running the same closure over its own slice of work, joined via `std::thread::scope` rather than
//! `libstress`'s persistent job-channel pool.

use std::thread;

/// Runs `body` on `workers` threads, passing each its 0-based index. Joins all of them before
/// returning, propagating the first panic (if any) like a normal `thread::scope`.
pub fn run_workers<F>(workers: usize, body: F)
where
    F: Fn(usize) + Send + Sync,
{
    thread::scope(|scope| {
        for id in 0..workers {
            let body = &body;
            scope.spawn(move || body(id));
        }
    });
}

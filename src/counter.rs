//! Counter-based synchronization for tracking outstanding work.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

const MAX_BACKOFF_US: u64 = 1000;

/// A thread-safe count of outstanding units of work.
///
/// Clones share the same count. Waiters are woken by polling: callers that
/// are themselves pool workers pass a `help` closure so they keep running
/// queued work instead of sleeping.
#[derive(Clone, Debug)]
pub struct Counter {
    inner: Arc<AtomicUsize>,
}

impl Counter {
    /// Creates a new counter with the specified initial value.
    pub fn new(initial: usize) -> Self {
        Counter {
            inner: Arc::new(AtomicUsize::new(initial)),
        }
    }

    /// Increments the counter by one.
    pub fn increment(&self) {
        self.inner.fetch_add(1, Ordering::AcqRel);
    }

    /// Adds `n` to the counter.
    pub fn add(&self, n: usize) {
        self.inner.fetch_add(n, Ordering::AcqRel);
    }

    /// Decrements the counter by one.
    ///
    /// Returns true if the counter reached zero.
    pub fn decrement(&self) -> bool {
        // Release so that all prior work is visible to whoever sees zero
        let old = self.inner.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "counter decremented below zero");
        old == 1
    }

    /// Returns the current value of the counter.
    pub fn value(&self) -> usize {
        self.inner.load(Ordering::Acquire)
    }

    /// Checks if the counter has reached zero.
    pub fn is_complete(&self) -> bool {
        self.value() == 0
    }

    /// Blocks the calling thread until the counter reaches zero.
    pub fn wait(&self) {
        self.wait_helping(|| false);
    }

    /// Blocks until the counter reaches zero, calling `help` between checks.
    ///
    /// `help` returns true if it made progress (ran a task); the wait then
    /// retries immediately. Otherwise the thread sleeps with exponential
    /// backoff capped at one millisecond.
    pub fn wait_helping<F>(&self, mut help: F)
    where
        F: FnMut() -> bool,
    {
        let mut backoff_us = 1;

        while !self.is_complete() {
            if help() {
                backoff_us = 1;
                continue;
            }
            thread::sleep(Duration::from_micros(backoff_us));
            backoff_us = (backoff_us * 2).min(MAX_BACKOFF_US);
        }
    }
}

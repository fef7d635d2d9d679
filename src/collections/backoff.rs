//! Randomized exponential backoff for CAS retry loops and idle waiting.
//!
//! Each failed attempt doubles the upper bound of the delay, and the actual
//! number of spins is drawn uniformly below that bound so that contending
//! threads fall out of lockstep instead of retrying in waves.

use rand::Rng;
use std::hint;
use std::thread;

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;

/// Backoff state for a single retry loop.
///
/// Create one per loop invocation; it is cheap and not meant to be shared.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    /// Creates a new backoff in its initial (shortest delay) state.
    pub fn new() -> Self {
        Backoff { step: 0 }
    }

    /// Resets the backoff after a successful operation.
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Backs off after a failed CAS.
    ///
    /// Spins a random number of iterations in `[0, 2^step]`. Never yields
    /// to the OS, since the competing thread is making progress.
    pub fn spin(&mut self) {
        let bound = 1u32 << self.step.min(SPIN_LIMIT);
        let spins = rand::rng().random_range(0..=bound);
        for _ in 0..spins {
            hint::spin_loop();
        }

        if self.step <= SPIN_LIMIT {
            self.step += 1;
        }
    }

    /// Backs off while waiting for another thread to produce something.
    ///
    /// Spins like [`spin`](Self::spin) at first and yields the time slice
    /// once spinning has stopped paying off.
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            let bound = 1u32 << self.step;
            let spins = rand::rng().random_range(0..=bound);
            for _ in 0..spins {
                hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }

        if self.step <= YIELD_LIMIT {
            self.step += 1;
        }
    }

    /// Returns true once the caller should block (park or sleep) instead of
    /// continuing to snooze.
    pub fn is_completed(&self) -> bool {
        self.step > YIELD_LIMIT
    }
}

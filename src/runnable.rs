//! Units of work executed directly by pool workers.
//!
//! A [`Runnable`] wraps a closure and an optional counter that is
//! decremented once the closure has finished, whether it returned or
//! panicked.

use crate::counter::Counter;
use crate::error::panic_message;
use std::panic::{self, AssertUnwindSafe};

/// A unit of work to be executed by the thread pool.
pub struct Runnable {
    work: Box<dyn FnOnce() + Send + 'static>,
    counter: Option<Counter>,
}

impl Runnable {
    /// Creates a new runnable with the given work function.
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Runnable {
            work: Box::new(work),
            counter: None,
        }
    }

    /// Creates a new runnable with an associated counter.
    pub fn with_counter<F>(work: F, counter: Counter) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Runnable {
            work: Box::new(work),
            counter: Some(counter),
        }
    }

    /// Runs the work, catching any panic, then decrements the counter.
    ///
    /// Returns the panic message if the work panicked.
    pub fn execute(self) -> Result<(), String> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(self.work));

        if let Some(counter) = self.counter {
            counter.decrement();
        }

        outcome.map_err(|payload| panic_message(payload.as_ref()))
    }
}

//! Work-stealing double-ended queues.
//!
//! The owning thread pushes and pops at one end; any number of thieves steal
//! from the other end through a [`DequeStealer`]. Both variants sit on top of
//! crossbeam's Chase-Lev deque. The bounded variant tracks its length so the
//! owner can detect overflow with [`BoundedDeque::try_add`] and divert work
//! elsewhere instead of stalling.

use super::ConcurrentCollection;
use super::backoff::Backoff;
use crossbeam::deque::{Steal, Stealer, Worker};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// An unbounded owner-side deque.
///
/// `Send` but not `Sync`: only the owning thread may push and pop.
pub struct UnboundedDeque<T> {
    worker: Worker<T>,
}

impl<T> UnboundedDeque<T> {
    /// Creates a deque whose owner pops the most recently pushed item.
    pub fn new_lifo() -> Self {
        UnboundedDeque {
            worker: Worker::new_lifo(),
        }
    }

    /// Creates a deque whose owner pops the oldest item.
    pub fn new_fifo() -> Self {
        UnboundedDeque {
            worker: Worker::new_fifo(),
        }
    }

    pub fn push(&self, item: T) {
        self.worker.push(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.worker.pop()
    }

    pub fn len(&self) -> usize {
        self.worker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.worker.is_empty()
    }

    /// Returns a handle that steals from the opposite end.
    pub fn stealer(&self) -> DequeStealer<T> {
        DequeStealer {
            stealer: self.worker.stealer(),
            len: None,
        }
    }
}

impl<T> ConcurrentCollection<T> for UnboundedDeque<T> {
    fn add(&self, item: T) {
        self.push(item);
    }

    fn remove(&self) -> Option<T> {
        self.pop()
    }

    fn is_empty(&self) -> bool {
        UnboundedDeque::is_empty(self)
    }
}

/// A fixed-capacity owner-side deque.
pub struct BoundedDeque<T> {
    worker: Worker<T>,
    len: Arc<AtomicUsize>,
    capacity: usize,
}

impl<T> BoundedDeque<T> {
    /// Creates a LIFO deque holding at most `capacity` items.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bounded deque capacity must be positive");
        BoundedDeque {
            worker: Worker::new_lifo(),
            len: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.worker.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Pushes `item` unless the deque is full, in which case it is handed
    /// back.
    pub fn try_add(&self, item: T) -> Result<(), T> {
        // The owner is the only producer, so nothing can grow the deque
        // between this check and the increment.
        if self.is_full() {
            return Err(item);
        }
        self.len.fetch_add(1, Ordering::AcqRel);
        self.worker.push(item);
        Ok(())
    }

    /// Pushes `item`, waiting for thieves to make room if the deque is full.
    ///
    /// Only useful when other threads are stealing; the owner popping its own
    /// deque cannot happen while it is blocked here.
    pub fn add_blocking(&self, mut item: T) {
        let mut backoff = Backoff::new();
        loop {
            match self.try_add(item) {
                Ok(()) => return,
                Err(rejected) => {
                    item = rejected;
                    backoff.snooze();
                }
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let item = self.worker.pop()?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(item)
    }

    /// Returns a handle that steals from the opposite end.
    pub fn stealer(&self) -> DequeStealer<T> {
        DequeStealer {
            stealer: self.worker.stealer(),
            len: Some(self.len.clone()),
        }
    }
}

impl<T> ConcurrentCollection<T> for BoundedDeque<T> {
    fn add(&self, item: T) {
        self.add_blocking(item);
    }

    fn remove(&self) -> Option<T> {
        self.pop()
    }

    fn is_empty(&self) -> bool {
        BoundedDeque::is_empty(self)
    }
}

/// The thief side of a deque. Cloneable and shareable across threads.
pub struct DequeStealer<T> {
    stealer: Stealer<T>,
    len: Option<Arc<AtomicUsize>>,
}

impl<T> DequeStealer<T> {
    /// Steals one item from the far end, retrying on contention.
    pub fn steal(&self) -> Option<T> {
        let mut backoff = Backoff::new();
        loop {
            match self.stealer.steal() {
                Steal::Success(item) => {
                    if let Some(len) = &self.len {
                        len.fetch_sub(1, Ordering::AcqRel);
                    }
                    return Some(item);
                }
                Steal::Empty => return None,
                Steal::Retry => backoff.spin(),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stealer.is_empty()
    }
}

impl<T> Clone for DequeStealer<T> {
    fn clone(&self) -> Self {
        DequeStealer {
            stealer: self.stealer.clone(),
            len: self.len.clone(),
        }
    }
}

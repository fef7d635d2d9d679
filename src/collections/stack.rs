//! Treiber stack.

use super::ConcurrentCollection;
use super::backoff::Backoff;
use super::node::Node;
use crossbeam::epoch::{self, Atomic, Owned};
use crossbeam::utils::CachePadded;
use std::sync::atomic::Ordering;

/// A lock-free LIFO stack.
///
/// Push and pop are a single CAS on the head pointer. Popped nodes are
/// retired through crossbeam's epoch collector, so a concurrent reader that
/// still holds the old head never touches freed memory.
pub struct LockFreeStack<T> {
    head: CachePadded<Atomic<Node<T>>>,
}

unsafe impl<T: Send> Send for LockFreeStack<T> {}
unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> LockFreeStack<T> {
    /// Creates an empty stack.
    pub fn new() -> Self {
        LockFreeStack {
            head: CachePadded::new(Atomic::null()),
        }
    }

    /// Pushes a value on top of the stack.
    pub fn push(&self, value: T) {
        let mut node = Owned::new(Node::new(value));
        let guard = epoch::pin();
        let mut backoff = Backoff::new();

        loop {
            let head = self.head.load(Ordering::Relaxed, &guard);
            node.next.store(head, Ordering::Relaxed);

            match self
                .head
                .compare_exchange(head, node, Ordering::Release, Ordering::Relaxed, &guard)
            {
                Ok(_) => return,
                Err(e) => {
                    node = e.new;
                    backoff.spin();
                }
            }
        }
    }

    /// Pops the top value, or returns `None` if the stack is empty.
    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        let mut backoff = Backoff::new();

        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            let node = unsafe { head.as_ref() }?;
            let next = node.next.load(Ordering::Relaxed, &guard);

            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire, &guard)
                .is_ok()
            {
                // Safety: the CAS unlinked `head`, so this thread is the only
                // one that will read its payload. Other pinned readers may
                // still dereference the node until the epoch advances.
                unsafe {
                    let value = node.take();
                    guard.defer_destroy(head);
                    return Some(value);
                }
            }
            backoff.spin();
        }
    }

    /// Returns true if the stack was empty at the time of the call.
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.head.load(Ordering::Acquire, &guard).is_null()
    }
}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<T> ConcurrentCollection<T> for LockFreeStack<T> {
    fn add(&self, item: T) {
        self.push(item);
    }

    fn remove(&self) -> Option<T> {
        self.pop()
    }

    fn is_empty(&self) -> bool {
        LockFreeStack::is_empty(self)
    }
}

//! Michael-Scott lock-free queue.

use super::ConcurrentCollection;
use super::backoff::Backoff;
use super::node::Node;
use crossbeam::epoch::{self, Atomic, Owned, Shared};
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A lock-free, unbounded FIFO queue.
///
/// The list always holds a sentinel node at `head`; the first real element
/// is `head.next`. Producers append with a CAS on the last node's `next`
/// and then swing `tail`; any thread that finds `tail` lagging helps it
/// forward before retrying, so no thread ever waits on another.
pub struct LockFreeQueue<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
    len: AtomicUsize,
}

unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> LockFreeQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let queue = LockFreeQueue {
            head: CachePadded::new(Atomic::null()),
            tail: CachePadded::new(Atomic::null()),
            len: AtomicUsize::new(0),
        };

        // Safety: the queue is not shared yet.
        unsafe {
            let guard = epoch::unprotected();
            let sentinel = Owned::new(Node::sentinel()).into_shared(guard);
            queue.head.store(sentinel, Ordering::Relaxed);
            queue.tail.store(sentinel, Ordering::Relaxed);
        }
        queue
    }

    /// Appends a value at the tail.
    pub fn push(&self, value: T) {
        let guard = epoch::pin();
        let new = Owned::new(Node::new(value)).into_shared(&guard);
        let mut backoff = Backoff::new();
        // Counted before linking so a racing pop can never underflow `len`.
        self.len.fetch_add(1, Ordering::Relaxed);

        loop {
            let tail = self.tail.load(Ordering::Acquire, &guard);
            // Safety: tail is never null and is protected by the guard.
            let last = unsafe { tail.deref() };
            let next = last.next.load(Ordering::Acquire, &guard);

            if !next.is_null() {
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
                continue;
            }

            if last
                .next
                .compare_exchange(
                    Shared::null(),
                    new,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                )
                .is_ok()
            {
                let _ = self.tail.compare_exchange(
                    tail,
                    new,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
                return;
            }
            backoff.spin();
        }
    }

    /// Removes the value at the head, or returns `None` if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        let mut backoff = Backoff::new();

        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            let tail = self.tail.load(Ordering::Acquire, &guard);
            // Safety: head is never null and is protected by the guard.
            let first = unsafe { head.deref() };
            let next = first.next.load(Ordering::Acquire, &guard);
            let node = unsafe { next.as_ref() }?;

            if head == tail {
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
                continue;
            }

            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire, &guard)
                .is_ok()
            {
                // Safety: winning the head CAS makes `next` the new sentinel
                // and gives this thread sole ownership of its payload.
                unsafe {
                    let value = node.take();
                    guard.defer_destroy(head);
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return Some(value);
                }
            }
            backoff.spin();
        }
    }

    /// Returns true if the queue was empty at the time of the call.
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        let head = self.head.load(Ordering::Acquire, &guard);
        unsafe { head.deref() }
            .next
            .load(Ordering::Acquire, &guard)
            .is_null()
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}

        // Safety: &mut self means no other thread can observe the sentinel.
        unsafe {
            let guard = epoch::unprotected();
            let sentinel = self.head.load(Ordering::Relaxed, guard);
            drop(sentinel.into_owned());
        }
    }
}

impl<T> ConcurrentCollection<T> for LockFreeQueue<T> {
    fn add(&self, item: T) {
        self.push(item);
    }

    fn remove(&self) -> Option<T> {
        self.pop()
    }

    fn is_empty(&self) -> bool {
        LockFreeQueue::is_empty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn test_queue_fifo_order() {
        let queue = LockFreeQueue::new();
        assert!(queue.is_empty());

        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 5);

        for i in 0..5 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_queue_multi_producer_multi_consumer() {
        let queue = Arc::new(LockFreeQueue::new());
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let producers = 4;
        let per_producer = 2_500;

        let mut handles = Vec::new();
        for p in 0..producers {
            let queue = queue.clone();
            handles.push(thread::spawn(move || {
                for i in 0..per_producer {
                    queue.push(p * per_producer + i);
                }
            }));
        }
        for _ in 0..producers {
            let queue = queue.clone();
            let seen = seen.clone();
            handles.push(thread::spawn(move || {
                let mut local = Vec::with_capacity(per_producer);
                while local.len() < per_producer {
                    match queue.pop() {
                        Some(v) => local.push(v),
                        None => thread::yield_now(),
                    }
                }
                seen.lock().unwrap().extend(local);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), producers * per_producer);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_per_producer_order_preserved() {
        let queue = Arc::new(LockFreeQueue::new());
        let q1 = queue.clone();
        let q2 = queue.clone();

        let a = thread::spawn(move || (0..1000).for_each(|i| q1.push((0, i))));
        let b = thread::spawn(move || (0..1000).for_each(|i| q2.push((1, i))));
        a.join().unwrap();
        b.join().unwrap();

        let mut last = [None, None];
        while let Some((producer, i)) = queue.pop() {
            if let Some(prev) = last[producer] {
                assert!(i > prev);
            }
            last[producer] = Some(i);
        }
        assert_eq!(last, [Some(999), Some(999)]);
    }

    #[test]
    fn test_queue_drops_remaining_items() {
        let item = Arc::new(());
        {
            let queue = LockFreeQueue::new();
            for _ in 0..10 {
                queue.push(item.clone());
            }
        }
        assert_eq!(Arc::strong_count(&item), 1);
    }
}

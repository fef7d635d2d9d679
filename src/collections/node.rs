//! Singly linked node shared by the lock-free stack and queue.

use crossbeam::epoch::Atomic;
use std::mem::MaybeUninit;

/// A linked cell with an atomically swappable successor.
///
/// The payload is `MaybeUninit` because the queue keeps a sentinel node whose
/// payload was either never written or has already been moved out. Dropping
/// a node never drops its payload; the owning structure does that.
pub(crate) struct Node<T> {
    pub(crate) data: MaybeUninit<T>,
    pub(crate) next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    pub(crate) fn new(value: T) -> Self {
        Node {
            data: MaybeUninit::new(value),
            next: Atomic::null(),
        }
    }

    pub(crate) fn sentinel() -> Self {
        Node {
            data: MaybeUninit::uninit(),
            next: Atomic::null(),
        }
    }

    /// Moves the payload out.
    ///
    /// # Safety
    /// The payload must be initialized and must not be read again.
    pub(crate) unsafe fn take(&self) -> T {
        unsafe { self.data.assume_init_read() }
    }
}

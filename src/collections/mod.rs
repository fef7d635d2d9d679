//! Lock-free collections backing the pool, jobs and pipelines.
//!
//! - [`LockFreeStack`]: Treiber stack (LIFO).
//! - [`LockFreeQueue`]: Michael-Scott queue (FIFO).
//! - [`UnboundedDeque`] / [`BoundedDeque`]: owner/thief work-stealing deques.
//! - [`Backoff`]: randomized exponential backoff for CAS retry loops.

pub mod backoff;
pub mod deque;
mod node;
pub mod queue;
pub mod stack;

pub use backoff::Backoff;
pub use deque::{BoundedDeque, DequeStealer, UnboundedDeque};
pub use queue::LockFreeQueue;
pub use stack::LockFreeStack;

/// Minimal contract shared by every collection a pool can pull work from.
///
/// `remove` never blocks; `None` means the collection was empty when asked.
/// Consumers that want to block do so by waiting with a [`Backoff`].
pub trait ConcurrentCollection<T> {
    /// Inserts an item. Unbounded collections never fail.
    fn add(&self, item: T);

    /// Takes an item out, or returns `None` if there is none.
    fn remove(&self) -> Option<T>;

    fn is_empty(&self) -> bool;
}

//! Thread pool configuration.

use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
    /// Pin to physical cores only (even-numbered logical processors), avoiding SMT contention.
    AvoidSMT,
}

impl PinningStrategy {
    /// Returns the logical core a worker should be pinned to, if any.
    pub(crate) fn core_for(self, worker_id: usize, available: usize) -> Option<usize> {
        let core = match self {
            PinningStrategy::None => return None,
            PinningStrategy::Linear => worker_id,
            PinningStrategy::AvoidSMT => worker_id * 2,
        };
        (core < available).then_some(core)
    }
}

/// Which structure workers pull tasks from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueueStrategy {
    /// One shared lock-free FIFO queue.
    #[default]
    Queue,
    /// One shared lock-free LIFO stack.
    Stack,
    /// A private deque per worker plus a shared injector queue. Tasks spawned
    /// on a worker go to its own deque; idle workers steal.
    WorkStealing,
    /// Like `WorkStealing`, but each private deque holds at most `capacity`
    /// tasks and overflow goes to the injector.
    BoundedWorkStealing { capacity: usize },
}

/// Configuration for a [`ThreadPool`](crate::ThreadPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker threads. Default: one per logical CPU.
    pub num_threads: usize,
    /// Task structure the workers pull from.
    pub strategy: QueueStrategy,
    /// CPU pinning for the workers.
    pub pinning: PinningStrategy,
    /// Prefix for worker thread names; the worker index is appended.
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_threads: num_cpus::get(),
            strategy: QueueStrategy::default(),
            pinning: PinningStrategy::default(),
            thread_name: "rustgrain-worker".to_string(),
        }
    }
}

impl PoolConfig {
    /// Default configuration with a fixed number of workers.
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads,
            ..Self::default()
        }
    }

    pub fn strategy(mut self, strategy: QueueStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn pinning(mut self, pinning: PinningStrategy) -> Self {
        self.pinning = pinning;
        self
    }

    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }
}

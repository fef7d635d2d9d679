//! # rustgrain - In-Process Parallel Task Runtime
//!
//! A small runtime for expressing data and task parallelism on a fixed pool
//! of OS threads. There is no cooperative scheduler and no async: all work is
//! expressed as tasks pulled by worker threads from shared or per-worker
//! structures.
//!
//! ## Architecture
//!
//! - **Thread pool**: an explicit [`ThreadPool`] handle owning N workers that
//!   pull [`Runnable`]s from a configurable structure (shared queue, shared
//!   stack, or per-worker work-stealing deques).
//! - **Jobs**: a [`Job`] groups [`Task`]s into generations. Parallel adds join
//!   the current generation, serial adds open a new one behind a barrier.
//! - **Ranges**: [`Range1D`] and [`Range2D`] partition an iteration domain per
//!   worker and then hand out small grains from each partition.
//! - **Patterns**: [`parallel_for`] and [`parallel_reduce`] build jobs from a
//!   range and a per-grain [`TaskFactory`].
//! - **Pipelines**: a [`Pipeline`] chains stages, each with its own input
//!   queue and worker threads.
//! - **Collections**: lock-free stack, queue and deques in [`collections`].
//!
//! ## Example
//!
//! ```
//! use rustgrain::{parallel_reduce, PoolConfig, Range1D, ReduceTask, ThreadPool};
//!
//! struct Sum { grain: Range1D, total: u64 }
//!
//! impl ReduceTask for Sum {
//!     fn execute(&mut self) {
//!         self.total = self.grain.indices().map(|i| i as u64).sum();
//!     }
//!     fn reduce(mut self, other: Self) -> Self {
//!         self.total += other.total;
//!         self
//!     }
//! }
//!
//! let pool = ThreadPool::start(PoolConfig::with_threads(4)).unwrap();
//! let sum = parallel_reduce(&pool, Range1D::new(1, 10_001, 64), |grain: Range1D| Sum { grain, total: 0 })
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(sum.total, 50_005_000);
//! pool.shutdown().unwrap();
//! ```

pub mod collections;
pub mod config;
pub mod counter;
pub mod error;
pub mod iter;
pub mod job;
pub mod metrics;
pub mod parallel;
pub mod pipeline;
pub mod range;
pub mod runnable;
pub mod thread_pool;
mod worker;

pub use collections::{
    Backoff, BoundedDeque, ConcurrentCollection, DequeStealer, LockFreeQueue, LockFreeStack,
    UnboundedDeque,
};
pub use config::{PinningStrategy, PoolConfig, QueueStrategy};
pub use counter::Counter;
pub use error::{JobError, PipelineError, PoolError};
pub use iter::{ParallelSlice, ParallelSliceMut};
pub use job::{AddMode, FnTask, Job, Task, TaskContext, task_fn};
pub use metrics::MetricsSnapshot;
pub use parallel::{ParallelFor, ParallelReduce, ReduceTask, TaskFactory, parallel_for, parallel_reduce};
pub use pipeline::{Pipeline, StageLogic, StageStats};
pub use range::{Range, Range1D, Range2D};
pub use runnable::Runnable;
pub use thread_pool::ThreadPool;
pub use worker::SharedCollection;

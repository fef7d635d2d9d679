//! Error types for the pool, jobs and pipelines.

use std::any::Any;
use std::io;
use thiserror::Error;

/// Errors raised by [`ThreadPool`](crate::ThreadPool) lifecycle and submission.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("thread pool is already initialized; shut it down before initializing again")]
    AlreadyInitialized,

    #[error("thread pool is not initialized")]
    NotInitialized,

    #[error("thread pool is shutting down and no longer accepts tasks")]
    ShutDown,

    #[error("thread pool size must be at least 1")]
    InvalidPoolSize,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),

    #[error("{count} worker thread(s) panicked")]
    WorkerPanicked { count: usize },
}

/// Errors returned by [`Job::execute`](crate::Job::execute) and the
/// parallel patterns built on it.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Some tasks panicked or could not be scheduled. Every other task ran to
    /// completion, so results derived from the job are partial.
    #[error("{failed} of {total} task(s) failed")]
    TaskFailures { failed: usize, total: usize },
}

/// Errors raised by [`Pipeline`](crate::Pipeline).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is shut down and no longer accepts items")]
    Closed,

    #[error("pipeline has no stages")]
    NoStages,

    #[error("a stage needs at least one worker")]
    InvalidWorkerCount,

    #[error("failed to spawn stage worker: {0}")]
    Spawn(#[from] io::Error),

    #[error("{count} worker thread(s) of stage {stage} panicked")]
    WorkerPanicked { stage: usize, count: usize },
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

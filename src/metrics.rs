use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Performance counters for one running pool.
#[derive(Debug)]
pub(crate) struct Metrics {
    /// Tasks accepted by `submit`.
    pub tasks_submitted: AtomicU64,
    /// Tasks that finished, panicked or not.
    pub tasks_completed: AtomicU64,
    /// Tasks whose closure panicked.
    pub tasks_panicked: AtomicU64,
    /// Pushes to a worker's private deque.
    pub local_pushes: AtomicU64,
    /// Pushes to the shared injector (or shared collection).
    pub injector_pushes: AtomicU64,
    /// Successful steals from other workers.
    pub steals_success: AtomicU64,
    /// Steal attempts that found the victim empty.
    pub steals_failed: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_panicked: AtomicU64::new(0),
            local_pushes: AtomicU64::new(0),
            injector_pushes: AtomicU64::new(0),
            steals_success: AtomicU64::new(0),
            steals_failed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of current metrics values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_panicked: self.tasks_panicked.load(Ordering::Relaxed),
            local_pushes: self.local_pushes.load(Ordering::Relaxed),
            injector_pushes: self.injector_pushes.load(Ordering::Relaxed),
            steals_success: self.steals_success.load(Ordering::Relaxed),
            steals_failed: self.steals_failed.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

/// Snapshot of pool metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_panicked: u64,
    pub local_pushes: u64,
    pub injector_pushes: u64,
    pub steals_success: u64,
    pub steals_failed: u64,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    /// Calculates tasks per second throughput.
    pub fn tasks_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.tasks_completed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Tasks submitted but not yet completed at snapshot time.
    pub fn backlog(&self) -> u64 {
        self.tasks_submitted.saturating_sub(self.tasks_completed)
    }
}

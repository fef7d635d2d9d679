//! Multi-stage processing pipelines.
//!
//! A [`Pipeline`] is a chain of stages linked in the order they were added.
//! Every stage owns a lock-free input queue and a fixed set of worker
//! threads. Each worker runs its own instance of the stage logic, built by
//! the stage's factory, and forwards every output to the next stage's queue.
//! Outputs of the last stage are dropped, so a sink is simply a last stage
//! that stores what it sees and returns `None`.

use crate::collections::{Backoff, LockFreeQueue};
use crate::error::{PipelineError, panic_message};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const IDLE_PARK: Duration = Duration::from_micros(200);

/// Processing logic of one stage worker.
///
/// Returning `None` ends the item's journey at this stage.
pub trait StageLogic<T>: Send + 'static {
    fn process(&mut self, item: T) -> Option<T>;
}

impl<T, F> StageLogic<T> for F
where
    F: FnMut(T) -> Option<T> + Send + 'static,
{
    fn process(&mut self, item: T) -> Option<T> {
        self(item)
    }
}

type LogicFactory<T> = Arc<dyn Fn() -> Box<dyn StageLogic<T>> + Send + Sync>;

/// Per-stage counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub stage: usize,
    pub workers: usize,
    /// Items the logic finished without panicking.
    pub processed: u64,
    /// Items whose logic panicked.
    pub failed: u64,
    /// Items thrown away because no worker was left to take them.
    pub discarded: u64,
    /// Items waiting in the input queue.
    pub queued: usize,
}

struct StageShared<T> {
    index: usize,
    input: LockFreeQueue<T>,
    accepting: AtomicBool,
    stop: AtomicBool,
    next: OnceLock<Arc<StageShared<T>>>,
    processed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

impl<T: Send + 'static> StageShared<T> {
    fn new(index: usize) -> Self {
        StageShared {
            index,
            input: LockFreeQueue::new(),
            accepting: AtomicBool::new(true),
            stop: AtomicBool::new(false),
            next: OnceLock::new(),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    fn offer(&self, item: T) -> Result<(), T> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(item);
        }
        self.input.push(item);
        Ok(())
    }

    fn forward(&self, item: T) {
        let Some(next) = self.next.get() else {
            return;
        };
        if next.offer(item).is_err() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "stage {} no longer accepts input; output of stage {} discarded",
                next.index,
                self.index
            );
        }
    }

    /// Worker loop: drains the input queue until the stage is stopped and the
    /// queue is empty.
    fn run_worker(&self, factory: &LogicFactory<T>, mut logic: Box<dyn StageLogic<T>>) {
        let mut backoff = Backoff::new();

        loop {
            if let Some(item) = self.input.pop() {
                backoff.reset();
                match panic::catch_unwind(AssertUnwindSafe(|| logic.process(item))) {
                    Ok(output) => {
                        self.processed.fetch_add(1, Ordering::Relaxed);
                        if let Some(output) = output {
                            self.forward(output);
                        }
                    }
                    Err(payload) => {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        log::error!(
                            "stage {} logic panicked: {}",
                            self.index,
                            panic_message(payload.as_ref())
                        );
                        // The old instance may be left half-updated.
                        logic = factory();
                    }
                }
                continue;
            }

            if self.stop.load(Ordering::Acquire) {
                break;
            }

            if backoff.is_completed() {
                thread::park_timeout(IDLE_PARK);
            } else {
                backoff.snooze();
            }
        }
    }

    fn stats(&self, workers: usize) -> StageStats {
        StageStats {
            stage: self.index,
            workers,
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            queued: self.input.len(),
        }
    }
}

struct Stage<T> {
    shared: Arc<StageShared<T>>,
    workers: Vec<JoinHandle<()>>,
    num_workers: usize,
}

impl<T: Send + 'static> Stage<T> {
    fn unpark(&self) {
        for worker in &self.workers {
            worker.thread().unpark();
        }
    }

    /// Stops accepting input, lets the workers drain the queue, then joins
    /// them. Returns the number of workers that panicked.
    fn shutdown(&mut self) -> usize {
        let shared = &self.shared;
        shared.accepting.store(false, Ordering::Release);

        let mut backoff_us = 1;
        while !shared.input.is_empty() && self.workers.iter().any(|w| !w.is_finished()) {
            self.unpark();
            thread::sleep(Duration::from_micros(backoff_us));
            backoff_us = (backoff_us * 2).min(1000);
        }

        shared.stop.store(true, Ordering::Release);
        self.unpark();

        let mut panicked = 0;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                panicked += 1;
            }
        }

        // Only reachable when every worker died before the queue drained.
        while shared.input.pop().is_some() {
            shared.discarded.fetch_add(1, Ordering::Relaxed);
        }
        panicked
    }
}

/// A chain of concurrently running stages.
///
/// # Example
///
/// ```
/// use rustgrain::Pipeline;
/// use std::sync::{Arc, Mutex};
///
/// let out = Arc::new(Mutex::new(Vec::new()));
/// let mut pipeline: Pipeline<u32> = Pipeline::new();
/// pipeline.add_stage(|| |x: u32| Some(x * 10), 2).unwrap();
/// let sink = out.clone();
/// pipeline
///     .add_stage(
///         move || {
///             let sink = sink.clone();
///             move |x: u32| {
///                 sink.lock().unwrap().push(x);
///                 None
///             }
///         },
///         1,
///     )
///     .unwrap();
///
/// for i in 0..4 {
///     pipeline.submit(i).unwrap();
/// }
/// pipeline.shutdown().unwrap();
///
/// let mut out = out.lock().unwrap().clone();
/// out.sort();
/// assert_eq!(out, vec![0, 10, 20, 30]);
/// ```
pub struct Pipeline<T: Send + 'static> {
    stages: Vec<Stage<T>>,
    closed: bool,
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn new() -> Self {
        Pipeline {
            stages: Vec::new(),
            closed: false,
        }
    }

    /// Appends a stage with `num_workers` threads.
    ///
    /// `make_logic` is called once per worker, and again whenever a worker's
    /// logic panics, so workers never share logic state. Stages should all be
    /// added before the first item is submitted; earlier outputs of the
    /// previous last stage are dropped.
    pub fn add_stage<F, L>(&mut self, make_logic: F, num_workers: usize) -> Result<(), PipelineError>
    where
        F: Fn() -> L + Send + Sync + 'static,
        L: StageLogic<T>,
    {
        if self.closed {
            return Err(PipelineError::Closed);
        }
        if num_workers == 0 {
            return Err(PipelineError::InvalidWorkerCount);
        }

        let index = self.stages.len();
        let factory: LogicFactory<T> =
            Arc::new(move || Box::new(make_logic()) as Box<dyn StageLogic<T>>);
        let shared = Arc::new(StageShared::new(index));
        let mut stage = Stage {
            shared: Arc::clone(&shared),
            workers: Vec::with_capacity(num_workers),
            num_workers,
        };

        for worker in 0..num_workers {
            let logic = factory();
            let factory = Arc::clone(&factory);
            let shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("pipeline-stage-{}-{}", index, worker))
                .spawn(move || shared.run_worker(&factory, logic));

            match spawned {
                Ok(handle) => stage.workers.push(handle),
                Err(e) => {
                    stage.shutdown();
                    return Err(PipelineError::Spawn(e));
                }
            }
        }

        if let Some(last) = self.stages.last() {
            // A fresh stage is linked exactly once.
            let _ = last.shared.next.set(Arc::clone(&shared));
        }
        log::debug!("pipeline stage {} started with {} worker(s)", index, num_workers);
        self.stages.push(stage);
        Ok(())
    }

    /// Feeds an item into the first stage.
    pub fn submit(&self, item: T) -> Result<(), PipelineError> {
        if self.closed {
            return Err(PipelineError::Closed);
        }
        let first = self.stages.first().ok_or(PipelineError::NoStages)?;
        first.shared.offer(item).map_err(|_| PipelineError::Closed)
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Counters for every stage, in order.
    pub fn stats(&self) -> Vec<StageStats> {
        self.stages
            .iter()
            .map(|stage| stage.shared.stats(stage.num_workers))
            .collect()
    }

    /// Shuts the stages down in the order they were added.
    ///
    /// Each stage stops accepting input, finishes every queued item and
    /// joins its workers before the next stage is touched, so no accepted
    /// item is lost. Every stage is shut down even if an earlier one reports
    /// panicked workers; the first such failure is returned.
    pub fn shutdown(&mut self) -> Result<(), PipelineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_error = None;
        for stage in &mut self.stages {
            let panicked = stage.shutdown();
            if panicked > 0 {
                log::error!(
                    "{} worker(s) of pipeline stage {} panicked",
                    panicked,
                    stage.shared.index
                );
                first_error.get_or_insert(PipelineError::WorkerPanicked {
                    stage: stage.shared.index,
                    count: panicked,
                });
            }
        }
        log::debug!("pipeline with {} stage(s) shut down", self.stages.len());

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<T: Send + 'static> Default for Pipeline<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Drop for Pipeline<T> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("pipeline shutdown on drop failed: {}", e);
        }
    }
}

//! Worker thread implementation.
//!
//! Worker threads continuously pull runnables from the pool's task structure
//! and execute them. Depending on the [`QueueStrategy`] that structure is a
//! single shared lock-free collection, or a private deque per worker backed by
//! a shared injector queue with stealing between workers.

use crate::collections::{
    Backoff, BoundedDeque, ConcurrentCollection, DequeStealer, LockFreeQueue, LockFreeStack,
    UnboundedDeque,
};
use crate::config::{PoolConfig, QueueStrategy};
use crate::error::PoolError;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::runnable::Runnable;
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long an idle worker parks once spinning and yielding found nothing.
const IDLE_PARK: Duration = Duration::from_micros(200);

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// Shared collection type accepted by [`ThreadPool::with_collection`](crate::ThreadPool::with_collection).
pub type SharedCollection = Box<dyn ConcurrentCollection<Runnable> + Send + Sync>;

enum LocalDeque {
    Unbounded(UnboundedDeque<Runnable>),
    Bounded(BoundedDeque<Runnable>),
}

impl LocalDeque {
    fn pop(&self) -> Option<Runnable> {
        match self {
            LocalDeque::Unbounded(d) => d.pop(),
            LocalDeque::Bounded(d) => d.pop(),
        }
    }

    fn stealer(&self) -> DequeStealer<Runnable> {
        match self {
            LocalDeque::Unbounded(d) => d.stealer(),
            LocalDeque::Bounded(d) => d.stealer(),
        }
    }
}

/// Per-thread record identifying the pool (and private deque) a worker
/// thread belongs to.
struct LocalSlot {
    pool_id: usize,
    worker_id: usize,
    deque: Option<LocalDeque>,
}

thread_local! {
    static LOCAL: RefCell<Option<LocalSlot>> = const { RefCell::new(None) };
}

enum TaskSource {
    Shared(SharedCollection),
    Stealing {
        injector: LockFreeQueue<Runnable>,
        stealers: Vec<DequeStealer<Runnable>>,
    },
}

/// State shared between a pool handle, its workers and every job that
/// submits to it.
pub(crate) struct Dispatcher {
    id: usize,
    size: usize,
    source: TaskSource,
    /// Submitted but not yet finished runnables.
    pending: AtomicUsize,
    shutdown: AtomicBool,
    metrics: Metrics,
}

impl Dispatcher {
    fn new(size: usize, source: TaskSource) -> Self {
        Dispatcher {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            size,
            source,
            pending: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            metrics: Metrics::new(),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Blocks until no submitted runnable is left, including runnables
    /// submitted while waiting.
    pub(crate) fn wait_idle(&self) {
        let mut backoff_us = 1;
        while self.pending() > 0 {
            thread::sleep(Duration::from_micros(backoff_us));
            backoff_us = (backoff_us * 2).min(1000);
        }
    }

    /// Queues a runnable.
    ///
    /// On a work-stealing pool, a runnable submitted from one of the pool's
    /// own workers goes to that worker's private deque.
    pub(crate) fn submit(&self, runnable: Runnable) -> Result<(), PoolError> {
        // Counted before the flag is checked: workers only exit once the
        // flag is set and nothing is pending, so an accepted runnable always
        // has a worker left to run it.
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.shutdown.load(Ordering::SeqCst) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::ShutDown);
        }
        Metrics::bump(&self.metrics.tasks_submitted);

        match &self.source {
            TaskSource::Shared(collection) => {
                collection.add(runnable);
                Metrics::bump(&self.metrics.injector_pushes);
            }
            TaskSource::Stealing { injector, .. } => {
                if let Some(runnable) = self.push_local(runnable) {
                    injector.push(runnable);
                    Metrics::bump(&self.metrics.injector_pushes);
                }
            }
        }
        Ok(())
    }

    /// Tries the calling worker's private deque. Hands the runnable back if
    /// the caller is not one of this pool's workers or its deque is full.
    fn push_local(&self, runnable: Runnable) -> Option<Runnable> {
        LOCAL.with(|slot| {
            let slot = slot.borrow();
            let deque = match slot.as_ref() {
                Some(s) if s.pool_id == self.id => s.deque.as_ref(),
                _ => None,
            };
            let overflow = match deque {
                Some(LocalDeque::Unbounded(d)) => {
                    d.push(runnable);
                    None
                }
                Some(LocalDeque::Bounded(d)) => d.try_add(runnable).err(),
                None => Some(runnable),
            };
            if overflow.is_none() {
                Metrics::bump(&self.metrics.local_pushes);
            }
            overflow
        })
    }

    /// Finds the next runnable: own deque first, then the injector, then
    /// the other workers' deques.
    fn find_task(&self) -> Option<Runnable> {
        match &self.source {
            TaskSource::Shared(collection) => collection.remove(),
            TaskSource::Stealing { injector, stealers } => {
                let (local, me) = LOCAL.with(|slot| {
                    let slot = slot.borrow();
                    match slot.as_ref() {
                        Some(s) if s.pool_id == self.id => {
                            (s.deque.as_ref().and_then(LocalDeque::pop), Some(s.worker_id))
                        }
                        _ => (None, None),
                    }
                });

                local
                    .or_else(|| injector.pop())
                    .or_else(|| self.steal(stealers, me))
            }
        }
    }

    fn steal(&self, stealers: &[DequeStealer<Runnable>], me: Option<usize>) -> Option<Runnable> {
        let start = me.map_or(0, |id| id + 1);
        let n = stealers.len();

        for offset in 0..n {
            let victim = (start + offset) % n;
            if Some(victim) == me {
                continue;
            }
            if let Some(runnable) = stealers[victim].steal() {
                Metrics::bump(&self.metrics.steals_success);
                return Some(runnable);
            }
        }
        Metrics::bump(&self.metrics.steals_failed);
        None
    }

    fn run_task(&self, runnable: Runnable) {
        if let Err(message) = runnable.execute() {
            Metrics::bump(&self.metrics.tasks_panicked);
            log::error!("task panicked on pool {}: {}", self.id, message);
        }
        Metrics::bump(&self.metrics.tasks_completed);
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// Returns true if the calling thread is one of this pool's workers.
    pub(crate) fn is_worker_thread(&self) -> bool {
        LOCAL.with(|slot| matches!(slot.borrow().as_ref(), Some(s) if s.pool_id == self.id))
    }

    /// Runs one queued runnable on the calling thread if it is a worker of
    /// this pool. Used by workers that block on a job so nested jobs cannot
    /// starve the pool.
    pub(crate) fn help(&self) -> bool {
        if !self.is_worker_thread() {
            return false;
        }
        match self.find_task() {
            Some(runnable) => {
                self.run_task(runnable);
                true
            }
            None => false,
        }
    }
}

/// A worker thread that executes runnables from its pool.
pub struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns a worker thread.
    fn spawn(
        id: usize,
        dispatcher: Arc<Dispatcher>,
        deque: Option<LocalDeque>,
        config: &PoolConfig,
    ) -> std::io::Result<Self> {
        let pin_core = config.pinning.core_for(id, num_cpus::get());

        let handle = thread::Builder::new()
            .name(format!("{}-{}", config.thread_name, id))
            .spawn(move || {
                // Pin worker to its core for better cache locality
                if let Some(core) = pin_core {
                    if let Some(core_ids) = core_affinity::get_core_ids() {
                        if let Some(core_id) = core_ids.get(core) {
                            core_affinity::set_for_current(*core_id);
                        }
                    }
                }

                LOCAL.with(|slot| {
                    *slot.borrow_mut() = Some(LocalSlot {
                        pool_id: dispatcher.id,
                        worker_id: id,
                        deque,
                    });
                });

                Worker::run_loop(&dispatcher);

                LOCAL.with(|slot| slot.borrow_mut().take());
            })?;

        Ok(Worker {
            id,
            handle: Some(handle),
        })
    }

    /// Main execution loop: run everything that can be found, then back off
    /// and eventually park until shutdown is signalled.
    fn run_loop(dispatcher: &Dispatcher) {
        let mut backoff = Backoff::new();

        loop {
            if let Some(runnable) = dispatcher.find_task() {
                dispatcher.run_task(runnable);
                backoff.reset();
                continue;
            }

            if dispatcher.shutdown.load(Ordering::SeqCst) && dispatcher.pending() == 0 {
                break;
            }

            if backoff.is_completed() {
                thread::park_timeout(IDLE_PARK);
            } else {
                backoff.snooze();
            }
        }
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> usize {
        self.id
    }

    fn unpark(&self) {
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    /// Waits for the worker thread to finish.
    pub fn join(mut self) -> thread::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join()
        } else {
            Ok(())
        }
    }
}

/// The running half of a [`ThreadPool`](crate::ThreadPool): the worker
/// threads and the dispatcher they share.
pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
    dispatcher: Arc<Dispatcher>,
}

impl WorkerPool {
    /// Spawns `config.num_threads` workers pulling from the structure
    /// selected by `config.strategy`.
    pub(crate) fn new(config: &PoolConfig) -> Result<Self, PoolError> {
        let n = config.num_threads;
        let (source, deques) = match config.strategy {
            QueueStrategy::Queue => (
                TaskSource::Shared(Box::new(LockFreeQueue::new())),
                Vec::new(),
            ),
            QueueStrategy::Stack => (
                TaskSource::Shared(Box::new(LockFreeStack::new())),
                Vec::new(),
            ),
            QueueStrategy::WorkStealing => {
                let deques: Vec<_> = (0..n)
                    .map(|_| LocalDeque::Unbounded(UnboundedDeque::new_lifo()))
                    .collect();
                (Self::stealing_source(&deques), deques)
            }
            QueueStrategy::BoundedWorkStealing { capacity } => {
                let deques: Vec<_> = (0..n)
                    .map(|_| LocalDeque::Bounded(BoundedDeque::new(capacity.max(1))))
                    .collect();
                (Self::stealing_source(&deques), deques)
            }
        };
        Self::spawn_workers(config, source, deques)
    }

    /// Spawns workers that all pull from a caller-supplied collection.
    pub(crate) fn with_collection(
        config: &PoolConfig,
        collection: SharedCollection,
    ) -> Result<Self, PoolError> {
        Self::spawn_workers(config, TaskSource::Shared(collection), Vec::new())
    }

    fn stealing_source(deques: &[LocalDeque]) -> TaskSource {
        TaskSource::Stealing {
            injector: LockFreeQueue::new(),
            stealers: deques.iter().map(LocalDeque::stealer).collect(),
        }
    }

    fn spawn_workers(
        config: &PoolConfig,
        source: TaskSource,
        deques: Vec<LocalDeque>,
    ) -> Result<Self, PoolError> {
        let n = config.num_threads;
        if n == 0 {
            return Err(PoolError::InvalidPoolSize);
        }

        let dispatcher = Arc::new(Dispatcher::new(n, source));
        let mut deques = deques.into_iter();
        let mut workers = Vec::with_capacity(n);

        for id in 0..n {
            match Worker::spawn(id, Arc::clone(&dispatcher), deques.next(), config) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    // Tear down the workers that did start before reporting.
                    let partial = WorkerPool {
                        workers,
                        dispatcher,
                    };
                    let _ = partial.stop_and_join();
                    return Err(PoolError::Spawn(e));
                }
            }
        }

        log::debug!(
            "started pool {} with {} worker(s), strategy {:?}",
            dispatcher.id,
            n,
            config.strategy
        );
        Ok(WorkerPool {
            workers,
            dispatcher,
        })
    }

    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Returns the number of worker threads in the pool.
    pub(crate) fn size(&self) -> usize {
        self.workers.len()
    }

    /// Waits for every submitted runnable (including ones submitted by other
    /// runnables) to finish, then stops and joins the workers.
    pub(crate) fn shutdown(self) -> Result<(), PoolError> {
        self.dispatcher.wait_idle();
        self.stop_and_join()
    }

    fn stop_and_join(self) -> Result<(), PoolError> {
        self.dispatcher.shutdown.store(true, Ordering::SeqCst);
        for worker in &self.workers {
            worker.unpark();
        }

        // Wait for all workers to finish and track failures
        let mut failed_count = 0;
        for worker in self.workers {
            let worker_id = worker.id();
            if worker.join().is_err() {
                failed_count += 1;
                log::error!("worker {} panicked during execution", worker_id);
            }
        }
        log::debug!("pool {} stopped", self.dispatcher.id);

        if failed_count > 0 {
            Err(PoolError::WorkerPanicked {
                count: failed_count,
            })
        } else {
            Ok(())
        }
    }
}

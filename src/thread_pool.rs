//! High-level thread pool handle.
//!
//! A [`ThreadPool`] is an explicit runtime handle: callers create it, pass it
//! to the jobs and patterns that need it, and shut it down when done. There is
//! no process-wide pool, so independent pools can coexist (tests use one per
//! case).

use crate::config::PoolConfig;
use crate::counter::Counter;
use crate::error::PoolError;
use crate::metrics::MetricsSnapshot;
use crate::runnable::Runnable;
use crate::worker::{Dispatcher, SharedCollection, WorkerPool};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type CollectionFactory = Box<dyn Fn() -> SharedCollection + Send + Sync>;

/// A fixed-size pool of worker threads.
///
/// Lifecycle: [`new`](Self::new) builds an idle handle,
/// [`initialize`](Self::initialize) spawns the workers and
/// [`shutdown`](Self::shutdown) drains and joins them. A shut-down pool may be
/// initialized again.
pub struct ThreadPool {
    config: PoolConfig,
    collection: Option<CollectionFactory>,
    running: Mutex<Option<WorkerPool>>,
}

impl ThreadPool {
    /// Creates an idle pool handle. No threads are started.
    pub fn new(config: PoolConfig) -> Self {
        ThreadPool {
            config,
            collection: None,
            running: Mutex::new(None),
        }
    }

    /// Creates an idle pool whose workers share a caller-supplied collection.
    ///
    /// `make` is called on every [`initialize`](Self::initialize) so a
    /// restarted pool never sees tasks left over from a previous run.
    /// `config.strategy` is ignored.
    pub fn with_collection<F>(config: PoolConfig, make: F) -> Self
    where
        F: Fn() -> SharedCollection + Send + Sync + 'static,
    {
        ThreadPool {
            config,
            collection: Some(Box::new(make)),
            running: Mutex::new(None),
        }
    }

    /// Creates and initializes a pool in one step.
    ///
    /// # Example
    ///
    /// ```
    /// use rustgrain::{PoolConfig, ThreadPool};
    ///
    /// let pool = ThreadPool::start(PoolConfig::with_threads(4)).unwrap();
    /// assert_eq!(pool.num_workers(), 4);
    /// pool.shutdown().unwrap();
    /// ```
    pub fn start(config: PoolConfig) -> Result<Self, PoolError> {
        let pool = Self::new(config);
        pool.initialize()?;
        Ok(pool)
    }

    /// Spawns the worker threads.
    ///
    /// Fails with [`PoolError::AlreadyInitialized`] if the pool is running.
    pub fn initialize(&self) -> Result<(), PoolError> {
        let mut running = self.lock();
        if running.is_some() {
            return Err(PoolError::AlreadyInitialized);
        }

        let workers = match &self.collection {
            Some(make) => WorkerPool::with_collection(&self.config, make())?,
            None => WorkerPool::new(&self.config)?,
        };
        *running = Some(workers);
        Ok(())
    }

    /// Waits for all outstanding tasks (including tasks spawned by tasks),
    /// then stops and joins every worker.
    ///
    /// Must not be called from inside a task running on this pool.
    pub fn shutdown(&self) -> Result<(), PoolError> {
        // Drain while the pool is still reachable so running tasks can keep
        // spawning through this handle.
        self.dispatcher()?.wait_idle();
        let workers = self.lock().take().ok_or(PoolError::NotInitialized)?;
        workers.shutdown()
    }

    /// Returns true between a successful `initialize` and `shutdown`.
    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Returns the configured number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.config.num_threads
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of submitted tasks that have not finished yet.
    pub fn outstanding(&self) -> usize {
        self.lock()
            .as_ref()
            .map_or(0, |workers| workers.dispatcher().pending())
    }

    /// Current metrics, or `None` if the pool is not running.
    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.lock()
            .as_ref()
            .map(|workers| workers.dispatcher().metrics())
    }

    /// Submits a closure and returns a counter that reaches zero once it ran.
    ///
    /// # Example
    ///
    /// ```
    /// use rustgrain::{PoolConfig, ThreadPool};
    ///
    /// let pool = ThreadPool::start(PoolConfig::with_threads(2)).unwrap();
    /// let counter = pool.spawn(|| println!("Hello from a task!")).unwrap();
    /// pool.wait_for_counter(&counter);
    /// pool.shutdown().unwrap();
    /// ```
    pub fn spawn<F>(&self, work: F) -> Result<Counter, PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let counter = Counter::new(1);
        self.dispatcher()?
            .submit(Runnable::with_counter(work, counter.clone()))?;
        Ok(counter)
    }

    /// Submits several closures and returns one counter tracking all of them.
    pub fn spawn_batch<I>(&self, jobs: I) -> Result<Counter, PoolError>
    where
        I: IntoIterator<Item = Box<dyn FnOnce() + Send + 'static>>,
    {
        let dispatcher = self.dispatcher()?;
        let counter = Counter::new(0);

        for work in jobs {
            counter.increment();
            if let Err(e) = dispatcher.submit(Runnable::with_counter(work, counter.clone())) {
                counter.decrement();
                return Err(e);
            }
        }
        Ok(counter)
    }

    /// Blocks until `counter` reaches zero.
    ///
    /// Called from one of this pool's workers, the wait runs queued tasks
    /// instead of sleeping.
    pub fn wait_for_counter(&self, counter: &Counter) {
        match self.dispatcher() {
            Ok(dispatcher) => counter.wait_helping(|| dispatcher.help()),
            Err(_) => counter.wait(),
        }
    }

    pub(crate) fn dispatcher(&self) -> Result<Arc<Dispatcher>, PoolError> {
        self.lock()
            .as_ref()
            .map(|workers| Arc::clone(workers.dispatcher()))
            .ok_or(PoolError::NotInitialized)
    }

    fn lock(&self) -> MutexGuard<'_, Option<WorkerPool>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        ThreadPool::new(PoolConfig::default())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(workers) = running {
            if let Err(e) = workers.shutdown() {
                log::error!("thread pool shutdown on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::LockFreeStack;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pool_creation() {
        let pool = ThreadPool::start(PoolConfig::with_threads(4)).unwrap();
        assert_eq!(pool.num_workers(), 4);
        assert!(pool.is_running());
        pool.shutdown().expect("Shutdown failed");
        assert!(!pool.is_running());
    }

    #[test]
    fn test_double_initialize_fails_fast() {
        let pool = ThreadPool::start(PoolConfig::with_threads(2)).unwrap();
        let err = pool.initialize().unwrap_err();
        assert!(matches!(err, PoolError::AlreadyInitialized));
        assert!(err.to_string().contains("already initialized"));
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_without_initialize() {
        let pool = ThreadPool::new(PoolConfig::with_threads(2));
        assert!(matches!(pool.shutdown(), Err(PoolError::NotInitialized)));
        assert!(matches!(pool.spawn(|| {}), Err(PoolError::NotInitialized)));
    }

    #[test]
    fn test_reinitialize_after_shutdown() {
        let pool = ThreadPool::start(PoolConfig::with_threads(2)).unwrap();
        pool.shutdown().unwrap();

        pool.initialize().expect("fresh pool after shutdown");
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let counter = pool.spawn(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });
        pool.wait_for_counter(&counter.unwrap());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_spawn_batch() {
        let pool = ThreadPool::start(PoolConfig::with_threads(4)).unwrap();
        let executed = Arc::new(AtomicUsize::new(0));

        let mut jobs: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        for _ in 0..10 {
            let executed_clone = executed.clone();
            jobs.push(Box::new(move || {
                executed_clone.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let counter = pool.spawn_batch(jobs).unwrap();
        pool.wait_for_counter(&counter);

        assert_eq!(executed.load(Ordering::SeqCst), 10);
        pool.shutdown().expect("Shutdown failed");
    }

    #[test]
    fn test_custom_collection() {
        let pool = ThreadPool::with_collection(PoolConfig::with_threads(2), || {
            Box::new(LockFreeStack::new())
        });
        pool.initialize().unwrap();

        let counter = pool.spawn(|| {}).unwrap();
        pool.wait_for_counter(&counter);
        assert_eq!(pool.metrics().unwrap().tasks_submitted, 1);
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_drop_joins_running_pool() {
        let executed = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::start(PoolConfig::with_threads(2)).unwrap();
            for _ in 0..20 {
                let executed = executed.clone();
                pool.spawn(move || {
                    executed.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(executed.load(Ordering::SeqCst), 20);
    }
}

//! Jobs: groups of tasks ordered into generations.
//!
//! A [`Job`] collects [`Task`]s. Tasks added with [`AddMode::Parallel`] join
//! the current generation and may run concurrently with its other tasks. A
//! task added with [`AddMode::Serial`] opens a new generation, which is only
//! released to the pool once every task of the generation before it has
//! finished, including tasks those tasks added while running.
//!
//! [`Job::execute`] releases the first generation and blocks until the last
//! one has drained.

use crate::counter::Counter;
use crate::error::{JobError, PoolError, panic_message};
use crate::runnable::Runnable;
use crate::thread_pool::ThreadPool;
use crate::worker::Dispatcher;
use std::collections::VecDeque;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// How a task joins a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// Join the current generation.
    Parallel,
    /// Start a new generation that waits for all earlier ones to drain.
    Serial,
}

/// The smallest schedulable unit of work inside a job.
pub trait Task: Send + 'static {
    /// Does the work. `ctx` can add further tasks to the same job.
    fn execute(&mut self, ctx: &TaskContext<'_>);

    /// Runs on the same worker right after `execute` returns.
    ///
    /// It does not wait for the rest of the generation; siblings may still
    /// be running. Work that needs the whole generation finished belongs in
    /// a task added with [`AddMode::Serial`].
    fn after(self: Box<Self>, _ctx: &TaskContext<'_>) {}
}

/// Wraps a closure as a one-shot [`Task`].
pub struct FnTask<F> {
    work: Option<F>,
}

impl<F> Task for FnTask<F>
where
    F: FnOnce(&TaskContext<'_>) + Send + 'static,
{
    fn execute(&mut self, ctx: &TaskContext<'_>) {
        if let Some(work) = self.work.take() {
            work(ctx);
        }
    }
}

/// Builds a [`Task`] from a closure.
pub fn task_fn<F>(work: F) -> FnTask<F>
where
    F: FnOnce(&TaskContext<'_>) + Send + 'static,
{
    FnTask { work: Some(work) }
}

struct GenerationState {
    released: bool,
    buffered: Vec<Box<dyn Task>>,
}

struct Generation {
    index: usize,
    /// Tasks added to this generation that have not finished.
    outstanding: AtomicUsize,
    state: Mutex<GenerationState>,
}

impl Generation {
    fn new(index: usize, first: Option<Box<dyn Task>>) -> Self {
        let outstanding = usize::from(first.is_some());
        Generation {
            index,
            outstanding: AtomicUsize::new(outstanding),
            state: Mutex::new(GenerationState {
                released: false,
                buffered: first.into_iter().collect(),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, GenerationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct GenerationQueue {
    /// Generations not yet drained, oldest first. Only the front is ever
    /// released.
    active: VecDeque<Arc<Generation>>,
    next_index: usize,
}

struct JobShared {
    dispatcher: Arc<Dispatcher>,
    generations: Mutex<GenerationQueue>,
    /// Tasks added and not yet finished, across all generations.
    remaining: Counter,
    added: AtomicUsize,
    failed: AtomicUsize,
}

impl JobShared {
    fn lock_generations(&self) -> MutexGuard<'_, GenerationQueue> {
        self.generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn count_task(&self) {
        self.remaining.increment();
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    fn push_generation(&self, first: Option<Box<dyn Task>>) -> Arc<Generation> {
        let mut queue = self.lock_generations();
        let generation = Arc::new(Generation::new(queue.next_index, first));
        queue.next_index += 1;
        queue.active.push_back(Arc::clone(&generation));
        generation
    }

    /// The newest generation, created if the job has none.
    fn current_generation(&self) -> Arc<Generation> {
        let last = self.lock_generations().active.back().cloned();
        last.unwrap_or_else(|| self.push_generation(None))
    }

    fn add_parallel(self: &Arc<Self>, generation: &Arc<Generation>, task: Box<dyn Task>) {
        self.count_task();
        generation.outstanding.fetch_add(1, Ordering::AcqRel);

        let mut state = generation.lock_state();
        if state.released {
            drop(state);
            self.submit(Arc::clone(generation), task);
        } else {
            state.buffered.push(task);
        }
    }

    fn add_serial(&self, task: Box<dyn Task>) {
        self.count_task();
        let generation = self.push_generation(Some(task));
        log::trace!("serial barrier opened generation {}", generation.index);
    }

    /// Releases the oldest generation if it is not running yet. Empty
    /// generations are retired on the spot and the next one is tried.
    fn release_front(self: &Arc<Self>) {
        loop {
            let Some(front) = self.lock_generations().active.front().cloned() else {
                return;
            };

            let tasks = {
                let mut state = front.lock_state();
                if state.released {
                    return;
                }
                state.released = true;
                mem::take(&mut state.buffered)
            };

            if tasks.is_empty() && front.outstanding.load(Ordering::Acquire) == 0 {
                self.retire(&front);
                continue;
            }

            log::trace!(
                "releasing generation {} with {} task(s)",
                front.index,
                tasks.len()
            );
            for task in tasks {
                self.submit(Arc::clone(&front), task);
            }
            return;
        }
    }

    fn retire(&self, generation: &Arc<Generation>) {
        let mut queue = self.lock_generations();
        match queue.active.front() {
            Some(front) if Arc::ptr_eq(front, generation) => {
                queue.active.pop_front();
            }
            _ => log::error!(
                "generation {} drained out of order; barrier state is inconsistent",
                generation.index
            ),
        }
    }

    fn submit(self: &Arc<Self>, generation: Arc<Generation>, task: Box<dyn Task>) {
        let job = Arc::clone(self);
        let owner = Arc::clone(&generation);
        let runnable = Runnable::new(move || job.run(&owner, task));

        if let Err(e) = self.dispatcher.submit(runnable) {
            log::error!(
                "task of generation {} could not be scheduled: {}",
                generation.index,
                e
            );
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.finish(&generation);
        }
    }

    fn run(self: &Arc<Self>, generation: &Arc<Generation>, mut task: Box<dyn Task>) {
        let ctx = TaskContext {
            job: self,
            generation,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            task.execute(&ctx);
            task.after(&ctx);
        }));

        if let Err(payload) = outcome {
            self.failed.fetch_add(1, Ordering::Relaxed);
            log::error!(
                "task in generation {} panicked: {}",
                generation.index,
                panic_message(payload.as_ref())
            );
        }
        self.finish(generation);
    }

    fn finish(self: &Arc<Self>, generation: &Arc<Generation>) {
        if generation.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.retire(generation);
            self.release_front();
        }
        // Last: the next generation is already counted, so `remaining`
        // cannot touch zero while work is left.
        self.remaining.decrement();
    }
}

/// Handle given to a running task.
pub struct TaskContext<'a> {
    job: &'a Arc<JobShared>,
    generation: &'a Arc<Generation>,
}

impl TaskContext<'_> {
    /// Adds a task to the running job.
    ///
    /// `Parallel` joins the generation of the calling task, so the barrier
    /// after it waits for the new task too. This holds even after the same
    /// task made a `Serial` add. `Serial` opens a generation behind every
    /// existing one.
    pub fn add<T: Task>(&self, task: T, mode: AddMode) {
        self.add_boxed(Box::new(task), mode);
    }

    pub fn add_boxed(&self, task: Box<dyn Task>, mode: AddMode) {
        match mode {
            AddMode::Parallel => self.job.add_parallel(self.generation, task),
            AddMode::Serial => self.job.add_serial(task),
        }
    }

    /// Number of worker threads in the pool running this job.
    pub fn num_workers(&self) -> usize {
        self.job.dispatcher.size()
    }

    /// Index of the generation the calling task belongs to.
    pub fn generation(&self) -> usize {
        self.generation.index
    }

    /// Creates an independent job on the same pool.
    ///
    /// Executing it from inside a task is allowed; the blocked worker runs
    /// queued tasks while it waits.
    pub fn new_job(&self) -> Job {
        Job::from_dispatcher(Arc::clone(&self.job.dispatcher))
    }
}

/// An execution context grouping tasks into generations.
///
/// # Example
///
/// ```
/// use rustgrain::{AddMode, Job, PoolConfig, ThreadPool, task_fn};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let pool = ThreadPool::start(PoolConfig::with_threads(4)).unwrap();
/// let hits = Arc::new(AtomicUsize::new(0));
///
/// let mut job = Job::new(&pool).unwrap();
/// for _ in 0..8 {
///     let hits = hits.clone();
///     job.add(task_fn(move |_| { hits.fetch_add(1, Ordering::SeqCst); }), AddMode::Parallel);
/// }
/// let seen = hits.clone();
/// job.add(task_fn(move |_| assert_eq!(seen.load(Ordering::SeqCst), 8)), AddMode::Serial);
///
/// job.execute().unwrap();
/// pool.shutdown().unwrap();
/// ```
pub struct Job {
    shared: Arc<JobShared>,
}

impl Job {
    /// Creates an empty job bound to a running pool.
    pub fn new(pool: &ThreadPool) -> Result<Self, PoolError> {
        Ok(Self::from_dispatcher(pool.dispatcher()?))
    }

    fn from_dispatcher(dispatcher: Arc<Dispatcher>) -> Self {
        Job {
            shared: Arc::new(JobShared {
                dispatcher,
                generations: Mutex::new(GenerationQueue::default()),
                remaining: Counter::new(0),
                added: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
            }),
        }
    }

    /// Adds a task before execution.
    pub fn add<T: Task>(&mut self, task: T, mode: AddMode) {
        self.add_boxed(Box::new(task), mode);
    }

    pub fn add_boxed(&mut self, task: Box<dyn Task>, mode: AddMode) {
        match mode {
            AddMode::Parallel => {
                let generation = self.shared.current_generation();
                self.shared.add_parallel(&generation, task);
            }
            AddMode::Serial => self.shared.add_serial(task),
        }
    }

    /// Number of worker threads in the pool this job runs on.
    pub fn num_workers(&self) -> usize {
        self.shared.dispatcher.size()
    }

    /// Tasks added to the job that have not finished yet.
    pub fn outstanding(&self) -> usize {
        self.shared.remaining.value()
    }

    /// Runs every generation in order and blocks until the whole task graph,
    /// including tasks added while running, has drained.
    ///
    /// Returns [`JobError::TaskFailures`] if any task panicked or could not
    /// be scheduled; all other tasks still ran.
    pub fn execute(&mut self) -> Result<(), JobError> {
        let shared = &self.shared;
        shared.release_front();

        let dispatcher = Arc::clone(&shared.dispatcher);
        shared.remaining.wait_helping(|| dispatcher.help());

        let failed = shared.failed.swap(0, Ordering::AcqRel);
        let total = shared.added.swap(0, Ordering::AcqRel);
        if failed > 0 {
            Err(JobError::TaskFailures { failed, total })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, QueueStrategy};
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    fn pool(n: usize) -> ThreadPool {
        ThreadPool::start(PoolConfig::with_threads(n)).unwrap()
    }

    #[test]
    fn test_empty_job() {
        let pool = pool(2);
        let mut job = Job::new(&pool).unwrap();
        job.execute().unwrap();
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_serial_waits_for_previous_generation() {
        let pool = pool(4);
        let first = Arc::new(AtomicUsize::new(0));
        let barrier_ok = Arc::new(AtomicBool::new(false));
        let mut job = Job::new(&pool).unwrap();

        for _ in 0..16 {
            let first = first.clone();
            job.add(
                task_fn(move |_| {
                    thread::sleep(Duration::from_millis(2));
                    first.fetch_add(1, Ordering::SeqCst);
                }),
                AddMode::Parallel,
            );
        }
        let seen = first.clone();
        let ok = barrier_ok.clone();
        job.add(
            task_fn(move |_| ok.store(seen.load(Ordering::SeqCst) == 16, Ordering::SeqCst)),
            AddMode::Serial,
        );

        job.execute().unwrap();
        assert!(barrier_ok.load(Ordering::SeqCst));
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_barrier_covers_dynamically_added_tasks() {
        let pool = pool(4);
        let leaves = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(AtomicUsize::new(0));
        let mut job = Job::new(&pool).unwrap();

        fn spawn_tree(ctx: &TaskContext<'_>, depth: usize, leaves: Arc<AtomicUsize>) {
            if depth == 0 {
                thread::sleep(Duration::from_micros(100));
                leaves.fetch_add(1, Ordering::SeqCst);
                return;
            }
            for _ in 0..2 {
                let leaves = leaves.clone();
                ctx.add(
                    task_fn(move |ctx| spawn_tree(ctx, depth - 1, leaves)),
                    AddMode::Parallel,
                );
            }
        }

        let root_leaves = leaves.clone();
        job.add(
            task_fn(move |ctx| spawn_tree(ctx, 6, root_leaves)),
            AddMode::Parallel,
        );
        let seen = leaves.clone();
        let out = observed.clone();
        job.add(
            task_fn(move |_| out.store(seen.load(Ordering::SeqCst), Ordering::SeqCst)),
            AddMode::Serial,
        );

        job.execute().unwrap();
        assert_eq!(leaves.load(Ordering::SeqCst), 64);
        assert_eq!(observed.load(Ordering::SeqCst), 64);
        assert_eq!(job.outstanding(), 0);
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_serial_add_from_running_task() {
        let pool = pool(2);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut job = Job::new(&pool).unwrap();

        let o = order.clone();
        job.add(
            task_fn(move |ctx| {
                o.lock().unwrap().push((ctx.generation(), "first"));
                let o2 = o.clone();
                ctx.add(
                    task_fn(move |ctx| o2.lock().unwrap().push((ctx.generation(), "later"))),
                    AddMode::Serial,
                );
                let o3 = o.clone();
                ctx.add(
                    task_fn(move |ctx| {
                        thread::sleep(Duration::from_millis(5));
                        o3.lock().unwrap().push((ctx.generation(), "sibling"));
                    }),
                    AddMode::Parallel,
                );
            }),
            AddMode::Parallel,
        );

        job.execute().unwrap();
        let order = order.lock().unwrap();
        assert_eq!(
            *order,
            vec![(0, "first"), (0, "sibling"), (1, "later")]
        );
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_after_does_not_wait_for_siblings() {
        struct Signal {
            done: Arc<AtomicBool>,
        }

        impl Task for Signal {
            fn execute(&mut self, _ctx: &TaskContext<'_>) {}

            fn after(self: Box<Self>, _ctx: &TaskContext<'_>) {
                self.done.store(true, Ordering::SeqCst);
            }
        }

        let pool = pool(2);
        let done = Arc::new(AtomicBool::new(false));
        let saw_after = Arc::new(AtomicBool::new(false));
        let mut job = Job::new(&pool).unwrap();

        // The sibling only finishes once the other task's hook has run.
        let d = done.clone();
        let saw = saw_after.clone();
        job.add(
            task_fn(move |_| {
                for _ in 0..5000 {
                    if d.load(Ordering::SeqCst) {
                        saw.store(true, Ordering::SeqCst);
                        return;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }),
            AddMode::Parallel,
        );
        job.add(Signal { done }, AddMode::Parallel);

        job.execute().unwrap();
        assert!(saw_after.load(Ordering::SeqCst));
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_panicking_task_is_reported() {
        let pool = pool(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let mut job = Job::new(&pool).unwrap();

        for i in 0..3 {
            let ran = ran.clone();
            job.add(
                task_fn(move |_| {
                    if i == 1 {
                        panic!("task {} failed", i);
                    }
                    ran.fetch_add(1, Ordering::SeqCst);
                }),
                AddMode::Parallel,
            );
        }

        match job.execute() {
            Err(JobError::TaskFailures { failed, total }) => {
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
            }
            other => panic!("expected task failure, got {:?}", other),
        }
        assert_eq!(ran.load(Ordering::SeqCst), 2);

        // The failure count is per execution.
        job.add(task_fn(|_| {}), AddMode::Parallel);
        job.execute().unwrap();
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_nested_job_on_single_worker() {
        let pool = ThreadPool::start(
            PoolConfig::with_threads(1).strategy(QueueStrategy::WorkStealing),
        )
        .unwrap();
        let total = Arc::new(AtomicUsize::new(0));
        let mut job = Job::new(&pool).unwrap();

        let t = total.clone();
        job.add(
            task_fn(move |ctx| {
                let mut inner = ctx.new_job();
                for _ in 0..10 {
                    let t = t.clone();
                    inner.add(
                        task_fn(move |_| {
                            t.fetch_add(1, Ordering::SeqCst);
                        }),
                        AddMode::Parallel,
                    );
                }
                inner.execute().unwrap();
                assert_eq!(t.load(Ordering::SeqCst), 10);
            }),
            AddMode::Parallel,
        );

        job.execute().unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 10);
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_job_on_stopped_pool() {
        let pool = ThreadPool::new(PoolConfig::with_threads(1));
        assert!(matches!(Job::new(&pool), Err(PoolError::NotInitialized)));
    }
}

//! Parallel-for and parallel-reduce over a [`Range`].
//!
//! Both patterns build the same job shape:
//!
//! 1. A split coordinator, added as a serial task, reads the pool size and
//!    adds one splitter per worker, each owning
//!    `range.create_instance(worker, workers)`.
//! 2. Each splitter pulls grains from its own partition with
//!    `split_blocked_range` and adds one freshly built task per grain.
//!
//! Grain tasks are built by a [`TaskFactory`], never cloned, so concurrently
//! running grains never share mutable state.

use crate::error::{JobError, panic_message};
use crate::job::{AddMode, Job, Task, TaskContext, task_fn};
use crate::range::Range;
use crate::thread_pool::ThreadPool;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Builds a fresh, independent task bound to one grain.
///
/// Any `Fn(R) -> T` closure is a factory.
pub trait TaskFactory<R>: Send + Sync + 'static {
    type Output: Send + 'static;

    fn create(&self, grain: R) -> Self::Output;
}

impl<R, T, F> TaskFactory<R> for F
where
    F: Fn(R) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn create(&self, grain: R) -> T {
        self(grain)
    }
}

/// Turns grains into job tasks. One impl per pattern.
trait GrainSink<R>: Send + Sync + 'static {
    fn make_task(&self, grain: R) -> Box<dyn Task>;

    /// Grains whose task ran but whose contribution was lost afterwards.
    fn lost_grains(&self) -> usize {
        0
    }
}

struct SplitShared<S> {
    sink: S,
    grains_per_split: Option<usize>,
    /// Grains pulled from the range.
    grains: AtomicUsize,
    /// Grains whose task could not be built.
    failed_grains: AtomicUsize,
}

struct SplitCoordinator<R, S> {
    range: R,
    shared: Arc<SplitShared<S>>,
}

impl<R: Range, S: GrainSink<R>> Task for SplitCoordinator<R, S> {
    fn execute(&mut self, ctx: &TaskContext<'_>) {
        let workers = ctx.num_workers();
        let grains_per_split = self.shared.grains_per_split.unwrap_or(workers).max(1);
        log::trace!(
            "splitting range across {} worker(s), {} grain(s) per pull",
            workers,
            grains_per_split
        );

        for index in 0..workers {
            ctx.add(
                Splitter {
                    partition: self.range.create_instance(index, workers),
                    grains_per_split,
                    shared: Arc::clone(&self.shared),
                },
                AddMode::Parallel,
            );
        }
    }
}

struct Splitter<R, S> {
    partition: R,
    grains_per_split: usize,
    shared: Arc<SplitShared<S>>,
}

impl<R: Range, S: GrainSink<R>> Task for Splitter<R, S> {
    fn execute(&mut self, ctx: &TaskContext<'_>) {
        loop {
            let grains = self.partition.split_blocked_range(self.grains_per_split);
            if grains.is_empty() {
                return;
            }
            self.shared.grains.fetch_add(grains.len(), Ordering::Relaxed);
            for grain in grains {
                let sink = &self.shared.sink;
                match panic::catch_unwind(AssertUnwindSafe(|| sink.make_task(grain))) {
                    Ok(task) => ctx.add_boxed(task, AddMode::Parallel),
                    Err(payload) => {
                        self.shared.failed_grains.fetch_add(1, Ordering::Relaxed);
                        log::error!(
                            "could not build the task for a grain: {}",
                            panic_message(payload.as_ref())
                        );
                    }
                }
            }
        }
    }
}

/// Runs the split-coordinator job and folds grain build failures and lost
/// contributions into the job's result.
fn run_split<R, S>(
    pool: &ThreadPool,
    range: R,
    sink: S,
    grains_per_split: Option<usize>,
) -> Result<(), JobError>
where
    R: Range,
    S: GrainSink<R>,
{
    let shared = Arc::new(SplitShared {
        sink,
        grains_per_split,
        grains: AtomicUsize::new(0),
        failed_grains: AtomicUsize::new(0),
    });

    let mut job = Job::new(pool)?;
    job.add(
        SplitCoordinator {
            range,
            shared: Arc::clone(&shared),
        },
        AddMode::Serial,
    );
    let outcome = job.execute();

    let failed_grains = shared.failed_grains.load(Ordering::Relaxed);
    let lost_grains = shared.sink.lost_grains();
    match outcome {
        Ok(()) if failed_grains == 0 && lost_grains == 0 => Ok(()),
        Ok(()) => Err(JobError::TaskFailures {
            failed: failed_grains + lost_grains,
            total: shared.grains.load(Ordering::Relaxed),
        }),
        Err(JobError::TaskFailures { failed, total }) => Err(JobError::TaskFailures {
            failed: failed + failed_grains + lost_grains,
            total: total + failed_grains,
        }),
        Err(e) => Err(e),
    }
}

struct ForSink<F> {
    factory: F,
}

impl<R, F> GrainSink<R> for ForSink<F>
where
    R: Range,
    F: TaskFactory<R>,
    F::Output: Task,
{
    fn make_task(&self, grain: R) -> Box<dyn Task> {
        Box::new(self.factory.create(grain))
    }
}

/// A parallel-for job: one factory-built task per grain, no result.
pub struct ParallelFor<R, F> {
    range: R,
    factory: F,
    grains_per_split: Option<usize>,
}

impl<R, F> ParallelFor<R, F>
where
    R: Range,
    F: TaskFactory<R>,
    F::Output: Task,
{
    pub fn new(range: R, factory: F) -> Self {
        ParallelFor {
            range,
            factory,
            grains_per_split: None,
        }
    }

    /// How many grains a splitter pulls per `split_blocked_range` call.
    /// Defaults to the pool size.
    pub fn grains_per_split(mut self, grains: usize) -> Self {
        self.grains_per_split = Some(grains);
        self
    }

    /// Runs every grain on `pool` and blocks until all have finished.
    pub fn run(self, pool: &ThreadPool) -> Result<(), JobError> {
        let sink = ForSink {
            factory: self.factory,
        };
        run_split(pool, self.range, sink, self.grains_per_split)
    }
}

/// Calls `body` once per grain of `range` on `pool`.
///
/// # Example
///
/// ```
/// use rustgrain::{parallel_for, PoolConfig, Range1D, ThreadPool};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let pool = ThreadPool::start(PoolConfig::with_threads(4)).unwrap();
/// let values: Arc<Vec<AtomicUsize>> = Arc::new((0..100).map(|_| AtomicUsize::new(0)).collect());
///
/// let out = values.clone();
/// parallel_for(&pool, Range1D::new(0, 100, 8), move |grain: Range1D| {
///     for i in grain.indices() {
///         out[i].store(i * 2, Ordering::Relaxed);
///     }
/// })
/// .unwrap();
///
/// assert_eq!(values[99].load(Ordering::Relaxed), 198);
/// pool.shutdown().unwrap();
/// ```
pub fn parallel_for<R, B>(pool: &ThreadPool, range: R, body: B) -> Result<(), JobError>
where
    R: Range,
    B: Fn(R) + Send + Sync + 'static,
{
    let body = Arc::new(body);
    let factory = move |grain: R| {
        let body = Arc::clone(&body);
        task_fn(move |_| body(grain))
    };
    ParallelFor::new(range, factory).run(pool)
}

/// A grain task that contributes a partial result.
pub trait ReduceTask: Send + 'static {
    /// Computes this grain's partial result.
    fn execute(&mut self);

    /// Merges two partial results. Must be associative and commutative.
    fn reduce(self, other: Self) -> Self;
}

/// A merged partial result and the number of grains folded into it.
struct Partial<T> {
    value: T,
    grains: usize,
}

/// The shared result cell of a reduce job.
///
/// Contributors first try to claim an empty cell with a compare-and-set.
/// When the cell is taken they swap the held value out, merge it with their
/// own and try again. A value is owned by exactly one contributor at a time,
/// so no partial result can be merged with itself.
///
/// A panicking `reduce` consumes both operands. Every grain they covered is
/// counted in `lost_grains` so the job reports them as failed.
struct Accumulator<T> {
    cell: AtomicPtr<Partial<T>>,
    lost_grains: AtomicUsize,
}

impl<T> Accumulator<T> {
    fn new() -> Self {
        Accumulator {
            cell: AtomicPtr::new(ptr::null_mut()),
            lost_grains: AtomicUsize::new(0),
        }
    }

    fn take_partial(&self) -> Option<Partial<T>> {
        let held = self.cell.swap(ptr::null_mut(), Ordering::AcqRel);
        if held.is_null() {
            None
        } else {
            // SAFETY: non-null pointers in the cell come from `Box::into_raw`,
            // and the swap removed this one so nobody else can reach it.
            Some(*unsafe { Box::from_raw(held) })
        }
    }

    fn take(&self) -> Option<T> {
        self.take_partial().map(|partial| partial.value)
    }

    fn lost_grains(&self) -> usize {
        self.lost_grains.load(Ordering::Acquire)
    }
}

impl<T: ReduceTask> Accumulator<T> {
    fn contribute(&self, value: T) {
        let mut mine = Box::new(Partial { value, grains: 1 });
        loop {
            let raw = Box::into_raw(mine);
            match self.cell.compare_exchange(
                ptr::null_mut(),
                raw,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                // SAFETY: the exchange failed, so `raw` was never published.
                Err(_) => mine = unsafe { Box::from_raw(raw) },
            }

            if let Some(held) = self.take_partial() {
                let grains = held.grains + mine.grains;
                let Partial { value: other, .. } = *mine;
                match panic::catch_unwind(AssertUnwindSafe(|| held.value.reduce(other))) {
                    Ok(value) => mine = Box::new(Partial { value, grains }),
                    Err(payload) => {
                        self.lost_grains.fetch_add(grains, Ordering::AcqRel);
                        log::error!(
                            "reduce panicked, dropping {} grain(s): {}",
                            grains,
                            panic_message(payload.as_ref())
                        );
                        return;
                    }
                }
            }
        }
    }
}

impl<T> Drop for Accumulator<T> {
    fn drop(&mut self) {
        drop(self.take_partial());
    }
}

struct ReduceGrain<T> {
    task: T,
    accumulator: Arc<Accumulator<T>>,
}

impl<T: ReduceTask> Task for ReduceGrain<T> {
    fn execute(&mut self, _ctx: &TaskContext<'_>) {
        self.task.execute();
    }

    fn after(self: Box<Self>, _ctx: &TaskContext<'_>) {
        let ReduceGrain { task, accumulator } = *self;
        accumulator.contribute(task);
    }
}

struct ReduceSink<F, T> {
    factory: Arc<F>,
    accumulator: Arc<Accumulator<T>>,
}

impl<R, F, T> GrainSink<R> for ReduceSink<F, T>
where
    R: Range,
    F: TaskFactory<R, Output = T>,
    T: ReduceTask,
{
    fn make_task(&self, grain: R) -> Box<dyn Task> {
        Box::new(ReduceGrain {
            task: self.factory.create(grain),
            accumulator: Arc::clone(&self.accumulator),
        })
    }

    fn lost_grains(&self) -> usize {
        self.accumulator.lost_grains()
    }
}

/// A parallel-reduce job: one factory-built [`ReduceTask`] per grain, merged
/// into a single result.
pub struct ParallelReduce<R, F>
where
    F: TaskFactory<R>,
{
    range: R,
    factory: Arc<F>,
    grains_per_split: Option<usize>,
    result: Option<F::Output>,
}

impl<R, F> ParallelReduce<R, F>
where
    R: Range,
    F: TaskFactory<R>,
    F::Output: ReduceTask,
{
    pub fn new(range: R, factory: F) -> Self {
        ParallelReduce {
            range,
            factory: Arc::new(factory),
            grains_per_split: None,
            result: None,
        }
    }

    /// How many grains a splitter pulls per `split_blocked_range` call.
    /// Defaults to the pool size.
    pub fn grains_per_split(mut self, grains: usize) -> Self {
        self.grains_per_split = Some(grains);
        self
    }

    /// Runs every grain on `pool`, blocks until all finished and stores the
    /// merged result. Replaces the result of any previous run.
    ///
    /// On `Err` the stored result misses the failed grains' contributions.
    pub fn execute(&mut self, pool: &ThreadPool) -> Result<(), JobError> {
        let accumulator = Arc::new(Accumulator::new());
        let sink = ReduceSink {
            factory: Arc::clone(&self.factory),
            accumulator: Arc::clone(&accumulator),
        };
        let outcome = run_split(pool, self.range.clone(), sink, self.grains_per_split);
        self.result = accumulator.take();
        outcome
    }

    /// The merged result of the last run; `None` before any run or if the
    /// range had no grains.
    pub fn result(&self) -> Option<&F::Output> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Option<F::Output> {
        self.result
    }
}

/// Builds one [`ReduceTask`] per grain of `range`, runs them on `pool` and
/// returns the merged result, or `None` if the range was empty.
pub fn parallel_reduce<R, F>(
    pool: &ThreadPool,
    range: R,
    factory: F,
) -> Result<Option<F::Output>, JobError>
where
    R: Range,
    F: TaskFactory<R>,
    F::Output: ReduceTask,
{
    let mut job = ParallelReduce::new(range, factory);
    job.execute(pool)?;
    Ok(job.into_result())
}

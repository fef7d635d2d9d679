use rustgrain::{AddMode, Job, PoolConfig, QueueStrategy, Task, TaskContext, ThreadPool, task_fn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Records (generation, phase) events.
type Log = Arc<Mutex<Vec<(usize, &'static str)>>>;

/// Spawns `fanout` parallel children `depth` levels deep, each sleeping a
/// little, and logs when every one of them finishes.
struct Tree {
    depth: usize,
    fanout: usize,
    log: Log,
}

impl Task for Tree {
    fn execute(&mut self, ctx: &TaskContext<'_>) {
        if self.depth > 0 {
            for _ in 0..self.fanout {
                ctx.add(
                    Tree {
                        depth: self.depth - 1,
                        fanout: self.fanout,
                        log: self.log.clone(),
                    },
                    AddMode::Parallel,
                );
            }
        }
        thread::sleep(Duration::from_micros(50));
    }

    fn after(self: Box<Self>, ctx: &TaskContext<'_>) {
        self.log.lock().unwrap().push((ctx.generation(), "tree"));
    }
}

#[test]
fn test_generations_never_overlap() {
    init_logging();
    for strategy in [QueueStrategy::Queue, QueueStrategy::Stack, QueueStrategy::WorkStealing] {
        let pool = ThreadPool::start(PoolConfig::with_threads(4).strategy(strategy)).unwrap();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut job = Job::new(&pool).unwrap();

        for generation in 0..4 {
            let mode = if generation == 0 {
                AddMode::Parallel
            } else {
                AddMode::Serial
            };
            job.add(
                Tree {
                    depth: 3,
                    fanout: 3,
                    log: log.clone(),
                },
                mode,
            );
        }

        job.execute().unwrap();

        let log = log.lock().unwrap();
        // 1 + 3 + 9 + 27 tasks per generation.
        assert_eq!(log.len(), 4 * 40, "{:?}", strategy);
        let generations: Vec<usize> = log.iter().map(|(g, _)| *g).collect();
        let mut sorted = generations.clone();
        sorted.sort_unstable();
        assert_eq!(generations, sorted, "generations interleaved with {:?}", strategy);
        pool.shutdown().unwrap();
    }
}

#[test]
fn test_parallel_add_after_serial_joins_new_generation() {
    init_logging();
    let pool = ThreadPool::start(PoolConfig::with_threads(4)).unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut job = Job::new(&pool).unwrap();

    let l = log.clone();
    job.add(
        task_fn(move |ctx| {
            thread::sleep(Duration::from_millis(10));
            l.lock().unwrap().push((ctx.generation(), "slow"));
        }),
        AddMode::Parallel,
    );
    let l = log.clone();
    job.add(
        task_fn(move |ctx| l.lock().unwrap().push((ctx.generation(), "barrier"))),
        AddMode::Serial,
    );
    for _ in 0..3 {
        let l = log.clone();
        job.add(
            task_fn(move |ctx| l.lock().unwrap().push((ctx.generation(), "follower"))),
            AddMode::Parallel,
        );
    }

    job.execute().unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log[0], (0, "slow"));
    assert!(log[1..].iter().all(|(g, _)| *g == 1));
    assert_eq!(log.len(), 5);
    pool.shutdown().unwrap();
}

#[test]
fn test_serial_chain_added_by_tasks() {
    init_logging();
    let pool = ThreadPool::start(PoolConfig::with_threads(2)).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    fn step(ctx: &TaskContext<'_>, n: usize, order: Arc<Mutex<Vec<usize>>>) {
        order.lock().unwrap().push(n);
        if n < 10 {
            ctx.add(task_fn(move |ctx| step(ctx, n + 1, order)), AddMode::Serial);
        }
    }

    let mut job = Job::new(&pool).unwrap();
    let o = order.clone();
    job.add(task_fn(move |ctx| step(ctx, 0, o)), AddMode::Parallel);
    job.execute().unwrap();

    assert_eq!(*order.lock().unwrap(), (0..=10).collect::<Vec<_>>());
    pool.shutdown().unwrap();
}

#[test]
fn test_job_reuse_after_execute() {
    init_logging();
    let pool = ThreadPool::start(PoolConfig::with_threads(3)).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let mut job = Job::new(&pool).unwrap();

    for round in 1..=3 {
        for _ in 0..10 {
            let count = count.clone();
            job.add(
                task_fn(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
                AddMode::Parallel,
            );
        }
        job.execute().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), round * 10);
        assert_eq!(job.outstanding(), 0);
    }
    pool.shutdown().unwrap();
}

#[test]
fn test_jobs_from_many_threads() {
    init_logging();
    let pool = Arc::new(ThreadPool::start(PoolConfig::with_threads(4)).unwrap());
    let total = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            let total = total.clone();
            thread::spawn(move || {
                let mut job = Job::new(&pool).unwrap();
                for _ in 0..100 {
                    let total = total.clone();
                    job.add(
                        task_fn(move |_| {
                            total.fetch_add(1, Ordering::SeqCst);
                        }),
                        AddMode::Parallel,
                    );
                }
                job.execute().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(total.load(Ordering::SeqCst), 400);
    pool.shutdown().unwrap();
}

use rustgrain::{
    AddMode, Job, Pipeline, PipelineError, PoolConfig, QueueStrategy, Range1D, ReduceTask, ThreadPool,
    parallel_for, parallel_reduce, task_fn,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

struct Sum {
    grain: Range1D,
    total: u64,
}

impl ReduceTask for Sum {
    fn execute(&mut self) {
        self.total = self.grain.indices().map(|i| i as u64).sum();
    }

    fn reduce(mut self, other: Self) -> Self {
        self.total += other.total;
        self
    }
}

fn build_pipeline(sink: Arc<Mutex<Vec<u64>>>) -> Result<Pipeline<u64>, PipelineError> {
    let mut pipeline = Pipeline::new();
    pipeline.add_stage(|| |x: u64| Some(x + 1), 2)?;
    pipeline.add_stage(|| |x: u64| Some(x * 2), 2)?;
    pipeline.add_stage(
        move || {
            let sink = sink.clone();
            move |x: u64| {
                if let Ok(mut out) = sink.lock() {
                    out.push(x);
                }
                None
            }
        },
        1,
    )?;
    Ok(pipeline)
}

fn main() {
    println!("rustgrain - In-Process Parallel Task Runtime\n");

    // Create a pool with 4 work-stealing workers
    let num_threads = 4;
    let config = PoolConfig::with_threads(num_threads).strategy(QueueStrategy::WorkStealing);
    let pool = match ThreadPool::start(config) {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to start pool: {}", e);
            return;
        }
    };
    println!("Initialized pool with {} worker threads\n", num_threads);

    // Example 1: Generations separated by a serial barrier
    println!("Example 1: Job with a serial barrier");
    let done = Arc::new(AtomicUsize::new(0));
    let run_job = || -> Result<(), Box<dyn std::error::Error>> {
        let mut job = Job::new(&pool)?;
        for _ in 0..8 {
            let done = done.clone();
            job.add(
                task_fn(move |_| {
                    done.fetch_add(1, Ordering::SeqCst);
                }),
                AddMode::Parallel,
            );
        }
        let seen = done.clone();
        job.add(
            task_fn(move |ctx| {
                println!(
                    "  Generation {} sees {} finished tasks",
                    ctx.generation(),
                    seen.load(Ordering::SeqCst)
                );
            }),
            AddMode::Serial,
        );
        job.execute()?;
        Ok(())
    };
    if let Err(e) = run_job() {
        eprintln!("  Job failed: {}", e);
    }
    println!();

    // Example 2: Parallel-for
    println!("Example 2: Parallel-for over 1,000,000 indices");
    let n = 1_000_000;
    let values: Arc<Vec<AtomicUsize>> = Arc::new((0..n).map(|_| AtomicUsize::new(0)).collect());
    let out = values.clone();
    let start = Instant::now();
    let result = parallel_for(&pool, Range1D::new(0, n, 4096), move |grain: Range1D| {
        for i in grain.indices() {
            out[i].store(i * 2, Ordering::Relaxed);
        }
    });
    match result {
        Ok(()) => println!(
            "  Filled in {:?}, value[{}] = {}\n",
            start.elapsed(),
            n - 1,
            values[n - 1].load(Ordering::Relaxed)
        ),
        Err(e) => eprintln!("  Parallel-for failed: {}\n", e),
    }

    // Example 3: Parallel-reduce
    println!("Example 3: Parallel-reduce of 1..=10000");
    let factory = |grain: Range1D| Sum { grain, total: 0 };
    match parallel_reduce(&pool, Range1D::new(1, 10_001, 100), factory) {
        Ok(Some(sum)) => println!("  Sum result: {} (expected: 50005000)\n", sum.total),
        Ok(None) => println!("  Empty range\n"),
        Err(e) => eprintln!("  Reduce failed: {}\n", e),
    }

    // Example 4: Three-stage pipeline
    println!("Example 4: Three-stage pipeline");
    let collected = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = match build_pipeline(collected.clone()) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("  Pipeline setup failed: {}", e);
            return;
        }
    };
    for i in 0..1000 {
        if let Err(e) = pipeline.submit(i) {
            eprintln!("  Submit failed: {}", e);
            break;
        }
    }
    if let Err(e) = pipeline.shutdown() {
        eprintln!("  Pipeline shutdown error: {}", e);
    }
    let count = collected.lock().map(|out| out.len()).unwrap_or(0);
    println!("  Collected {} outputs", count);
    for stats in pipeline.stats() {
        println!(
            "  Stage {}: {} processed, {} failed",
            stats.stage, stats.processed, stats.failed
        );
    }
    println!();

    if let Some(metrics) = pool.metrics() {
        println!(
            "Pool metrics: {} tasks, {} steals, {:.2} tasks/second\n",
            metrics.tasks_completed,
            metrics.steals_success,
            metrics.tasks_per_second()
        );
    }

    // Shutdown the pool
    println!("Shutting down pool...");
    match pool.shutdown() {
        Ok(_) => println!("Done!"),
        Err(e) => eprintln!("Shutdown error: {}", e),
    }
}

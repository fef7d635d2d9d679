use rustgrain::{BoundedDeque, PoolConfig, QueueStrategy, ThreadPool, UnboundedDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[test]
fn test_deque_ordering_lifo_local() {
    // Owner pushes and pops at the same end.
    let w = UnboundedDeque::<i32>::new_lifo();
    w.push(1);
    w.push(2);
    w.push(3);

    assert_eq!(w.pop(), Some(3));
    assert_eq!(w.pop(), Some(2));
    assert_eq!(w.pop(), Some(1));
    assert_eq!(w.pop(), None);
}

#[test]
fn test_deque_ordering_fifo_steal() {
    // Thieves take from the opposite end.
    let w = UnboundedDeque::<i32>::new_lifo();
    w.push(1);
    w.push(2);
    w.push(3);

    let s = w.stealer();
    assert_eq!(s.steal(), Some(1));
    assert_eq!(s.steal(), Some(2));
    assert_eq!(s.steal(), Some(3));
    assert_eq!(s.steal(), None);
}

#[test]
fn test_bounded_deque_overflow_and_steal_frees_space() {
    let w = BoundedDeque::new(2);
    assert!(w.try_add(1).is_ok());
    assert!(w.try_add(2).is_ok());
    assert!(w.is_full());
    assert_eq!(w.try_add(3), Err(3));

    let s = w.stealer();
    assert_eq!(s.steal(), Some(1));
    assert!(!w.is_full());
    assert!(w.try_add(3).is_ok());
}

#[test]
fn test_thieves_drain_owner_deque() {
    let w = UnboundedDeque::new_lifo();
    for i in 0..10_000 {
        w.push(i);
    }

    let taken = Arc::new(AtomicUsize::new(0));
    let thieves: Vec<_> = (0..4)
        .map(|_| {
            let s = w.stealer();
            let taken = taken.clone();
            thread::spawn(move || {
                let mut sum = 0usize;
                while let Some(v) = s.steal() {
                    sum += v;
                    taken.fetch_add(1, Ordering::Relaxed);
                }
                sum
            })
        })
        .collect();

    let mut sum = 0;
    while let Some(v) = w.pop() {
        sum += v;
        taken.fetch_add(1, Ordering::Relaxed);
    }
    for thief in thieves {
        sum += thief.join().unwrap();
    }

    assert_eq!(taken.load(Ordering::Relaxed), 10_000);
    assert_eq!(sum, (0..10_000).sum::<usize>());
}

#[test]
fn test_idle_workers_steal_nested_work() {
    let pool = Arc::new(
        ThreadPool::start(PoolConfig::with_threads(4).strategy(QueueStrategy::WorkStealing))
            .unwrap(),
    );
    let executed = Arc::new(AtomicUsize::new(0));

    // One task floods its own deque; the other workers can only get work by
    // stealing it.
    let inner_pool = pool.clone();
    let inner_executed = executed.clone();
    let root = pool
        .spawn(move || {
            for _ in 0..2000 {
                let executed = inner_executed.clone();
                inner_pool
                    .spawn(move || {
                        let mut x = 0u64;
                        for i in 0..1000 {
                            x = x.wrapping_add(i);
                        }
                        std::hint::black_box(x);
                        executed.fetch_add(1, Ordering::Relaxed);
                    })
                    .unwrap();
            }
        })
        .unwrap();
    pool.wait_for_counter(&root);
    pool.shutdown().unwrap();

    assert_eq!(executed.load(Ordering::Relaxed), 2000);
}

//! Thread pool scheduling benchmarks
//!
//! - Raw pool schedule of tiny tasks
//! - Throttled and spin executors layered on the pool
//! - Deliver queue hand-off
//!
//! Run: cargo bench --bench bench_pool

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ringflow::{
    DeliverQueueBuilder, Executor, ExecutorSpin, ExecutorThrottle, PoolConfig, ShutdownMode, Task, ThreadPool,
    ThrottleConfig,
};

const TASKS: u64 = 100_000;

fn pool() -> ThreadPool {
    ThreadPool::new(
        PoolConfig::new("bench")
            .with_thread_max(num_threads())
            .with_idle_min(2)
            .with_idle_max(num_threads())
            .with_task_queue_capacity(256 * 1024),
    )
    .unwrap()
}

fn num_threads() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get()).max(2)
}

fn counting_task(done: &Arc<AtomicU64>) -> Task {
    let done = done.clone();
    Box::new(move || {
        done.fetch_add(1, Ordering::Relaxed);
    })
}

/// Push `tasks` counting tasks through `executor` and wait for all of them
fn run_tasks(executor: &dyn Executor, tasks: u64) {
    let done = Arc::new(AtomicU64::new(0));
    for _ in 0..tasks {
        // the executor queue may fill during a burst
        while executor.execute(counting_task(&done)).is_err() {
            std::thread::yield_now();
        }
    }
    while done.load(Ordering::Relaxed) < tasks {
        std::hint::spin_loop();
    }
}

fn benchmark_executors(c: &mut Criterion) {
    let mut group = c.benchmark_group("Executors (100K tasks)");
    group.throughput(Throughput::Elements(TASKS));
    group.sample_size(10);

    let pool = pool();
    group.bench_function("pool", |b| b.iter(|| run_tasks(&pool, TASKS)));

    let throttle = ExecutorThrottle::new(&pool, ThrottleConfig::new(4).unwrap()).unwrap();
    group.bench_function("throttle_4", |b| b.iter(|| run_tasks(&throttle, TASKS)));

    let spin = ExecutorSpin::new(&pool, 256 * 1024).unwrap();
    group.bench_function("spin", |b| b.iter(|| run_tasks(&spin, TASKS)));

    group.finish();
    spin.shutdown();
    throttle.shutdown();
    pool.shutdown(ShutdownMode::Graceful);
    pool.await_termination(Duration::from_secs(5));
}

fn benchmark_deliver_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("Deliver Queue (100K items)");
    group.throughput(Throughput::Elements(TASKS));
    group.sample_size(10);

    let pool = pool();
    let received = Arc::new(AtomicU64::new(0));
    let sink_received = received.clone();
    let queue = DeliverQueueBuilder::new("bench")
        .with_initial(1024)
        .with_capacity(64 * 1024)
        .build(Arc::new(pool.clone()), move |value: u64, _: &mut ()| -> anyhow::Result<()> {
            sink_received.fetch_add(value, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();

    group.bench_function("offer_and_drain", |b| {
        b.iter(|| {
            let start = received.load(Ordering::Relaxed);
            for _ in 0..TASKS {
                queue.offer(1, Duration::from_secs(5)).unwrap();
            }
            while received.load(Ordering::Relaxed) - start < TASKS {
                std::hint::spin_loop();
            }
        })
    });

    group.finish();
    queue.shutdown(ShutdownMode::Graceful);
    pool.shutdown(ShutdownMode::Graceful);
    pool.await_termination(Duration::from_secs(5));
}

criterion_group!(benches, benchmark_executors, benchmark_deliver_queue);
criterion_main!(benches);

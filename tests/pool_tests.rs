//! Pool lifecycle under load: thread ceiling, idle convergence, shutdown and
//! the executors layered on top.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use ringflow::insights::init_test_logging;
use ringflow::{
    DeliverQueueBuilder, Executor, ExecutorSpin, PoolConfig, RingError, ShutdownMode, ThreadPool,
};

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn pool(name: &str, thread_max: usize, idle_min: usize, idle_max: usize) -> ThreadPool {
    init_test_logging();
    ThreadPool::new(
        PoolConfig::new(name)
            .with_thread_max(thread_max)
            .with_idle_min(idle_min)
            .with_idle_max(idle_max)
            .with_idle_timeout(Duration::from_millis(50))
            .with_idle_ring_capacity(256),
    )
    .unwrap()
}

#[test]
fn test_flood_respects_thread_max() {
    let pool = pool("flood", 6, 1, 6);
    let done = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let running = Arc::new(AtomicUsize::new(0));

    for _ in 0..500 {
        let done = done.clone();
        let peak = peak.clone();
        let running = running.clone();
        pool.schedule(Box::new(move || {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_micros(200));
            running.fetch_sub(1, Ordering::SeqCst);
            done.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        let stats = pool.stats();
        assert!(stats.live + stats.starting <= 6, "over the ceiling: {stats}");
    }

    assert!(wait_until(Duration::from_secs(10), || done.load(Ordering::SeqCst) == 500));
    assert!(peak.load(Ordering::SeqCst) <= 6);
    assert!(pool.stats().created_total >= 2);

    pool.shutdown(ShutdownMode::Graceful);
    assert!(pool.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_idle_threads_converge_after_burst() {
    let pool = pool("converge", 8, 2, 8);
    assert!(wait_until(Duration::from_secs(5), || pool.stats().live == 2));

    let gate = Arc::new(std::sync::Barrier::new(9));
    for _ in 0..8 {
        let gate = gate.clone();
        pool.schedule(Box::new(move || {
            gate.wait();
        }))
        .unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || pool.stats().live == 8));
    gate.wait();

    // one surplus thread retires per idle timeout
    assert!(wait_until(Duration::from_secs(5), || {
        let stats = pool.stats();
        stats.live == 2 && stats.idle == 2
    }));
    let stats = pool.stats();
    assert!(stats.retired_total >= 6, "{stats}");
    assert_eq!(stats.busy(), 0);

    pool.shutdown(ShutdownMode::Graceful);
    assert!(pool.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_shutdown_wakes_parked_threads_promptly() {
    init_test_logging();
    let pool = ThreadPool::new(
        PoolConfig::new("prompt")
            .with_thread_max(8)
            .with_idle_min(4)
            .with_idle_max(8)
            .with_idle_timeout(Duration::from_secs(60))
            .with_idle_ring_capacity(64),
    )
    .unwrap();
    assert!(wait_until(Duration::from_secs(5), || pool.stats().idle == 4));

    let started = Instant::now();
    pool.shutdown(ShutdownMode::Graceful);
    assert!(pool.await_termination(Duration::from_secs(5)));
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert!(pool.is_shutdown());
    assert_eq!(pool.stats().live, 0);
}

#[test]
fn test_graceful_shutdown_runs_queued_tasks() {
    let pool = pool("graceful", 2, 1, 2);
    // a closed launcher starts nothing, so let the first worker come up
    assert!(wait_until(Duration::from_secs(5), || pool.stats().live >= 1));
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let done = done.clone();
        pool.schedule(Box::new(move || {
            thread::sleep(Duration::from_millis(1));
            done.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    }
    pool.shutdown(ShutdownMode::Graceful);
    assert!(pool.await_termination(Duration::from_secs(10)));
    assert_eq!(done.load(Ordering::SeqCst), 50);
}

#[test]
fn test_spin_executor_on_pool() {
    let pool = pool("spin", 4, 1, 4);
    let spin = ExecutorSpin::with_runners(&pool, 1 << 14, 2).unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..5_000 {
        let done = done.clone();
        spin.execute(Box::new(move || {
            done.fetch_add(1, Ordering::Relaxed);
        }))
        .unwrap();
    }
    assert!(wait_until(Duration::from_secs(10), || done.load(Ordering::Relaxed) == 5_000));
    assert!(spin.running() <= 2);

    spin.shutdown();
    assert!(matches!(spin.execute(Box::new(|| {})), Err(RingError::Closed)));
    pool.shutdown(ShutdownMode::Graceful);
    assert!(pool.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_deliver_queue_on_pool() {
    let pool = pool("deliver", 4, 1, 4);
    let executor: Arc<dyn Executor> = Arc::new(pool.clone());
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink_received = received.clone();

    let queue = Arc::new(
        DeliverQueueBuilder::new("events")
            .with_initial(16)
            .with_capacity(4096)
            .build(executor, move |value: u32, _: &mut ()| -> anyhow::Result<()> {
                sink_received.lock().push(value);
                Ok(())
            })
            .unwrap(),
    );

    let producers: Vec<_> = (0..4u32)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    queue.offer(p * 1_000 + i, Duration::from_secs(5)).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || received.lock().len() == 2_000));
    assert!(wait_until(Duration::from_secs(5), || queue.is_empty()));
    assert!(queue.ring().is_resizing());
    let received = received.lock();
    for p in 0..4u32 {
        let from_p: Vec<u32> = received.iter().copied().filter(|v| v / 1_000 == p).collect();
        assert_eq!(from_p, (0..500).map(|i| p * 1_000 + i).collect::<Vec<_>>());
    }
    drop(received);

    queue.shutdown(ShutdownMode::Graceful);
    pool.shutdown(ShutdownMode::Graceful);
    assert!(pool.await_termination(Duration::from_secs(5)));
}

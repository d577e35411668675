//! Concurrency-capped executor over a [`ThreadPool`].
//!
//! Tasks queue in a private ring; at most `max_concurrency` runners drain it
//! on pool threads. A monitor thread counts pool workers stuck in one of this
//! executor's tasks past `task_timeout` and raises the ceiling by that count,
//! so one stuck task does not starve everything queued behind it.

use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use super::pool::ThreadPool;
use super::worker::run_attributed;
use super::{Executor, Task};
use crate::config::ThrottleConfig;
use crate::error::{Result, RingError};
use crate::insights;
use crate::queue::{QueueRing, RingConsumer, RingProducer};
use crate::FixedRing;

pub struct ExecutorThrottle {
    inner: Arc<ThrottleInner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

struct ThrottleInner {
    name: String,
    owner: u64,
    pool: ThreadPool,
    config: ThrottleConfig,
    queue: FixedRing<Task>,
    running: AtomicUsize,
    slow_count: AtomicUsize,
    closed: AtomicBool,
    monitor_lock: Mutex<()>,
    monitor_cond: Condvar,
}

impl ExecutorThrottle {
    pub fn new(pool: &ThreadPool, config: ThrottleConfig) -> Result<Self> {
        let owner = pool.inner().next_owner_id();
        let name = format!("{}-throttle-{}", pool.name(), owner);
        let inner = Arc::new(ThrottleInner {
            queue: FixedRing::new(config.queue_capacity)?,
            name,
            owner,
            pool: pool.clone(),
            config,
            running: AtomicUsize::new(0),
            slow_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            monitor_lock: Mutex::new(()),
            monitor_cond: Condvar::new(),
        });

        let weak = Arc::downgrade(&inner);
        let monitor = std::thread::Builder::new()
            .name(inner.name.clone())
            .spawn(move || monitor_slow_tasks(weak))?;

        Ok(Self {
            inner,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Runners currently draining the queue
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Stuck tasks found by the last scan
    pub fn slow_count(&self) -> usize {
        self.inner.slow_count.load(Ordering::Acquire)
    }

    /// Effective ceiling: `max_concurrency` plus the slow count
    pub fn limit(&self) -> usize {
        self.inner.limit()
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.size()
    }

    /// Reject further tasks and stop the monitor. Queued tasks still run.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.queue.close_write();
        {
            let _guard = self.inner.monitor_lock.lock();
            self.inner.monitor_cond.notify_all();
        }
        if let Some(monitor) = self.monitor.lock().take() {
            let _ = monitor.join();
        }
    }
}

impl Executor for ExecutorThrottle {
    fn execute(&self, task: Task) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RingError::Closed);
        }
        if self.inner.queue.try_offer(task).is_err() {
            return Err(RingError::Full);
        }
        ThrottleInner::launch(&self.inner)
    }
}

impl Drop for ExecutorThrottle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ExecutorThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorThrottle")
            .field("name", &self.inner.name)
            .field("running", &self.running())
            .field("slow", &self.slow_count())
            .field("queued", &self.queued())
            .finish()
    }
}

impl ThrottleInner {
    fn limit(&self) -> usize {
        self.config.max_concurrency + self.slow_count.load(Ordering::Acquire)
    }

    /// Start a runner if below the ceiling and there is queued work
    fn launch(this: &Arc<Self>) -> Result<()> {
        // pairs with the fence in `run`: the offer is visible before `running` is read
        fence(Ordering::SeqCst);
        loop {
            if this.queue.is_empty() {
                return Ok(());
            }
            let running = this.running.load(Ordering::Acquire);
            if running >= this.limit() {
                return Ok(());
            }
            if this
                .running
                .compare_exchange_weak(running, running + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let runner = this.clone();
        if let Err(err) = this.pool.schedule(Box::new(move || runner.run())) {
            this.running.fetch_sub(1, Ordering::AcqRel);
            return Err(err);
        }
        Ok(())
    }

    fn run(self: Arc<Self>) {
        loop {
            while let Some(task) = self.queue.try_poll() {
                run_attributed(self.owner, task);
            }
            self.running.fetch_sub(1, Ordering::AcqRel);
            fence(Ordering::SeqCst);

            // an execute that saw us running did not launch
            if self.queue.is_empty() {
                return;
            }
            let running = self.running.load(Ordering::Acquire);
            if running >= self.limit()
                || self
                    .running
                    .compare_exchange(running, running + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                return;
            }
        }
    }
}

fn monitor_slow_tasks(inner: Weak<ThrottleInner>) {
    loop {
        let Some(throttle) = inner.upgrade() else {
            return;
        };
        if throttle.closed.load(Ordering::Acquire) {
            return;
        }

        let slow = throttle
            .pool
            .inner()
            .count_slow_threads(throttle.owner, throttle.config.task_timeout);
        let previous = throttle.slow_count.swap(slow, Ordering::AcqRel);
        if slow != previous {
            insights::record_slow_tasks(&throttle.name, slow, throttle.config.task_timeout);
        }
        if slow > previous {
            if let Err(err) = ThrottleInner::launch(&throttle) {
                tracing::warn!(executor = %throttle.name, %err, "relief runner not scheduled");
            }
        }

        let mut guard = throttle.monitor_lock.lock();
        if !throttle.closed.load(Ordering::Acquire) {
            throttle
                .monitor_cond
                .wait_for(&mut guard, throttle.config.scan_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::ShutdownMode;
    use std::time::{Duration, Instant};

    fn pool(name: &str) -> ThreadPool {
        ThreadPool::new(
            PoolConfig::new(name)
                .with_thread_max(8)
                .with_idle_min(2)
                .with_idle_max(8)
                .with_idle_ring_capacity(64)
                .with_task_queue_capacity(256),
        )
        .unwrap()
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn test_ceiling_holds() {
        let pool = pool("ceiling");
        let throttle = ExecutorThrottle::new(&pool, ThrottleConfig::new(2).unwrap()).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..40 {
            let active = active.clone();
            let peak = peak.clone();
            let done = done.clone();
            throttle
                .execute(Box::new(move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(1));
                    active.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        assert!(wait_until(Duration::from_secs(10), || done.load(Ordering::SeqCst) == 40));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        throttle.shutdown();
        pool.shutdown(ShutdownMode::Graceful);
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_runner_exit_never_strands_a_task() {
        let pool = pool("throttle-handoff");
        let throttle = Arc::new(ExecutorThrottle::new(&pool, ThrottleConfig::new(1).unwrap()).unwrap());
        let done = Arc::new(AtomicUsize::new(0));

        // each round races a fresh execute against the runner leaving
        for round in 1..=2_000 {
            let submitters: Vec<_> = (0..2)
                .map(|_| {
                    let throttle = throttle.clone();
                    let done = done.clone();
                    std::thread::spawn(move || {
                        throttle
                            .execute(Box::new(move || {
                                done.fetch_add(1, Ordering::SeqCst);
                            }))
                            .unwrap();
                    })
                })
                .collect();
            for submitter in submitters {
                submitter.join().unwrap();
            }
            assert!(
                wait_until(Duration::from_secs(2), || done.load(Ordering::SeqCst) == round * 2),
                "round {round}: {} queued with {} running",
                throttle.queued(),
                throttle.running()
            );
        }

        throttle.shutdown();
        pool.shutdown(ShutdownMode::Graceful);
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_rejects_after_shutdown() {
        let pool = pool("throttle-closed");
        let throttle = ExecutorThrottle::new(&pool, ThrottleConfig::new(1).unwrap()).unwrap();
        throttle.shutdown();
        assert!(matches!(throttle.execute(Box::new(|| {})), Err(RingError::Closed)));
        pool.shutdown(ShutdownMode::Graceful);
        assert!(pool.await_termination(Duration::from_secs(5)));
    }
}

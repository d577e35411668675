//! Burst-friendly executor over a [`ThreadPool`].
//!
//! Tasks queue in a [`ResizingRing`] that grows under bursts. Up to one runner
//! per CPU drains it on pool threads; an idle runner spins for the pool's spin
//! timeout before giving its thread back.

use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::Backoff;

use super::pool::ThreadPool;
use super::worker::run_attributed;
use super::{Executor, Task};
use crate::constants::SPIN_EXECUTOR_INITIAL;
use crate::error::{Result, RingError};
use crate::queue::{Deadline, QueueRing, RingConsumer, RingProducer};
use crate::{ResizingConfig, ResizingRing};

#[derive(Clone)]
pub struct ExecutorSpin {
    inner: Arc<SpinInner>,
}

struct SpinInner {
    owner: u64,
    pool: ThreadPool,
    queue: ResizingRing<Task>,
    running: AtomicUsize,
    max_runners: usize,
    spin_timeout: Duration,
    closed: AtomicBool,
}

impl ExecutorSpin {
    /// `max_queue` bounds the task ring's growth; it must be a power of two
    /// no smaller than the initial 64 slots.
    pub fn new(pool: &ThreadPool, max_queue: usize) -> Result<Self> {
        Self::with_runners(pool, max_queue, num_cpus::get())
    }

    pub fn with_runners(pool: &ThreadPool, max_queue: usize, max_runners: usize) -> Result<Self> {
        if max_runners == 0 {
            return Err(RingError::config("spin executor needs at least one runner"));
        }
        let config = ResizingConfig::new(SPIN_EXECUTOR_INITIAL.min(max_queue), max_queue)?;
        Ok(Self {
            inner: Arc::new(SpinInner {
                owner: pool.inner().next_owner_id(),
                pool: pool.clone(),
                queue: ResizingRing::with_config(config)?,
                running: AtomicUsize::new(0),
                max_runners,
                spin_timeout: pool.config().spin_timeout,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.size()
    }

    /// Current task ring capacity
    pub fn capacity(&self) -> usize {
        self.inner.queue.capacity()
    }

    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.queue.close_write();
    }
}

impl Executor for ExecutorSpin {
    fn execute(&self, task: Task) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RingError::Closed);
        }
        if self.inner.queue.try_offer(task).is_err() {
            return Err(RingError::Full);
        }
        SpinInner::launch(&self.inner)
    }
}

impl std::fmt::Debug for ExecutorSpin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorSpin")
            .field("running", &self.running())
            .field("queued", &self.queued())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl SpinInner {
    fn try_reserve(&self) -> bool {
        let mut running = self.running.load(Ordering::Acquire);
        loop {
            if running >= self.max_runners {
                return false;
            }
            match self.running.compare_exchange_weak(
                running,
                running + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => running = current,
            }
        }
    }

    fn launch(this: &Arc<Self>) -> Result<()> {
        fence(Ordering::SeqCst);
        if !this.try_reserve() {
            return Ok(());
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
            while let Some(task) = self.poll_spinning() {
                run_attributed(self.owner, task);
            }
            self.running.fetch_sub(1, Ordering::AcqRel);
            fence(Ordering::SeqCst);

            // a task offered as we gave up may have seen every runner busy
            if self.queue.is_empty() || !self.try_reserve() {
                return;
            }
        }
    }

    fn poll_spinning(&self) -> Option<Task> {
        if let Some(task) = self.queue.try_poll() {
            return Some(task);
        }
        let deadline = Deadline::after(self.spin_timeout);
        let backoff = Backoff::new();
        while !deadline.is_expired() && !self.closed.load(Ordering::Acquire) {
            backoff.spin();
            if let Some(task) = self.queue.try_poll() {
                return Some(task);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::ShutdownMode;
    use std::time::Instant;

    fn pool(name: &str) -> ThreadPool {
        ThreadPool::new(
            PoolConfig::new(name)
                .with_thread_max(8)
                .with_idle_min(1)
                .with_idle_max(8)
                .with_idle_ring_capacity(64)
                .with_task_queue_capacity(256),
        )
        .unwrap()
    }

    #[test]
    fn test_burst_grows_queue_and_runs_all() {
        let pool = pool("spin-burst");
        let spin = ExecutorSpin::with_runners(&pool, 4096, 2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(AtomicBool::new(false));

        // hold both runners so the burst piles up
        for _ in 0..2 {
            let gate = gate.clone();
            spin.execute(Box::new(move || {
                while !gate.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }))
            .unwrap();
        }
        for _ in 0..1000 {
            let done = done.clone();
            spin.execute(Box::new(move || {
                done.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        assert!(spin.capacity() > 64);
        assert!(spin.running() <= 2);

        gate.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(10);
        while done.load(Ordering::SeqCst) < 1000 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(done.load(Ordering::SeqCst), 1000);

        spin.shutdown();
        assert!(matches!(spin.execute(Box::new(|| {})), Err(RingError::Closed)));
        pool.shutdown(ShutdownMode::Graceful);
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_runner_exit_never_strands_a_task() {
        let pool = ThreadPool::new(
            PoolConfig::new("spin-handoff")
                .with_thread_max(4)
                .with_idle_min(1)
                .with_idle_max(4)
                .with_idle_ring_capacity(64)
                .with_spin_timeout(Duration::ZERO),
        )
        .unwrap();
        let spin = ExecutorSpin::with_runners(&pool, 1024, 1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for round in 1..=2_000 {
            let submitters: Vec<_> = (0..2)
                .map(|_| {
                    let spin = spin.clone();
                    let done = done.clone();
                    std::thread::spawn(move || {
                        spin.execute(Box::new(move || {
                            done.fetch_add(1, Ordering::SeqCst);
                        }))
                        .unwrap();
                    })
                })
                .collect();
            for submitter in submitters {
                submitter.join().unwrap();
            }
            let deadline = Instant::now() + Duration::from_secs(2);
            while done.load(Ordering::SeqCst) < round * 2 && Instant::now() < deadline {
                std::thread::yield_now();
            }
            assert_eq!(done.load(Ordering::SeqCst), round * 2, "round {round}: {} queued", spin.queued());
        }

        spin.shutdown();
        pool.shutdown(ShutdownMode::Graceful);
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_zero_runners_rejected() {
        let pool = pool("spin-config");
        assert!(ExecutorSpin::with_runners(&pool, 1024, 0).is_err());
        assert!(ExecutorSpin::new(&pool, 48).is_err());
        pool.shutdown(ShutdownMode::Immediate);
        assert!(pool.await_termination(Duration::from_secs(5)));
    }
}

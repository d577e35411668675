//! Elastic thread pool.
//!
//! Tasks go into a bounded MPMC [`FixedRing`]. Idle workers register in a
//! second ring of handles; `schedule` pops one and unparks it. When no worker
//! is idle the launcher thread is asked to start one, subject to `thread_max`
//! and the launch throttle. A small number of workers may spin on the task
//! ring before parking, which absorbs bursts without a park/unpark round trip.
//!
//! ```rust,ignore
//! let pool = ThreadPool::new(PoolConfig::new("app").with_thread_max(64))?;
//! pool.schedule(Box::new(|| println!("hello")))?;
//! pool.shutdown(ShutdownMode::Graceful);
//! pool.await_termination(Duration::from_secs(1));
//! ```

use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::sync::Parker;
use crossbeam::utils::Backoff;
use parking_lot::Mutex;

use super::launcher::{run_launcher, IdleThreadManager, LaunchThrottle};
use super::worker::{self, WorkerHandle};
use super::{duration_nanos, Executor, Task};
use crate::config::PoolConfig;
use crate::constants::SPIN_CPU_LIMIT;
use crate::error::{Result, RingError};
use crate::metrics::PoolStats;
use crate::queue::{Deadline, QueueRing, RingConsumer, RingProducer};
use crate::{FixedRing, ShutdownMode};

/// Cloneable handle to a pool. Create one at startup and pass it around.
///
/// Executors built on the pool hold a handle of their own. When the last
/// handle drops, the pool shuts down gracefully: queued tasks still run and
/// the workers retire. Call [`ThreadPool::await_termination`] before that
/// point to wait for them.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    _handles: Arc<LastHandle>,
}

/// Shared by every [`ThreadPool`] clone but not by the workers, which hold
/// `PoolInner` directly.
struct LastHandle(Arc<PoolInner>);

impl Drop for LastHandle {
    fn drop(&mut self) {
        if !self.0.is_closed() {
            tracing::debug!(pool = %self.0.name(), "last pool handle dropped");
            self.0.shutdown(ShutdownMode::Graceful);
        }
    }
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    launcher: Arc<IdleThreadManager>,
    tasks: FixedRing<Task>,
    idle_threads: FixedRing<Arc<WorkerHandle>>,
    threads: Mutex<Vec<Arc<WorkerHandle>>>,
    launcher_thread: Mutex<Option<JoinHandle<()>>>,

    spinning: AtomicUsize,
    spin_max: usize,
    closed: AtomicBool,
    next_thread_id: AtomicU64,
    next_owner_id: AtomicU64,
    epoch: Instant,
}

impl ThreadPool {
    /// Validate `config` and start the launcher, which brings the pool up to
    /// `idle_min` workers.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let spin_max = SPIN_CPU_LIMIT.min((num_cpus::get() + 2) / 4);
        let inner = Arc::new(PoolInner {
            launcher: Arc::new(IdleThreadManager::new(&config)),
            tasks: FixedRing::new(config.task_queue_capacity)?,
            idle_threads: FixedRing::new(config.idle_ring_capacity)?,
            threads: Mutex::new(Vec::new()),
            launcher_thread: Mutex::new(None),
            spinning: AtomicUsize::new(0),
            spin_max,
            closed: AtomicBool::new(false),
            next_thread_id: AtomicU64::new(1),
            next_owner_id: AtomicU64::new(1),
            epoch: Instant::now(),
            config,
        });

        let weak = Arc::downgrade(&inner);
        let manager = inner.launcher.clone();
        let throttle = LaunchThrottle::new(&inner.config);
        let handle = std::thread::Builder::new()
            .name(format!("{}-launcher", inner.config.name))
            .spawn(move || {
                // holds only a weak pool reference so the pool can be dropped
                run_launcher(&manager, throttle, || match weak.upgrade() {
                    Some(pool) => pool.spawn_worker(),
                    None => Err(RingError::Closed),
                })
            })?;
        *inner.launcher_thread.lock() = Some(handle);

        tracing::debug!(
            pool = %inner.config.name,
            thread_max = inner.config.thread_max,
            idle_min = inner.config.idle_min,
            spin_max,
            "thread pool started"
        );
        Ok(Self {
            _handles: Arc::new(LastHandle(inner.clone())),
            inner,
        })
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Queue a task, waking an idle worker or asking for a new one.
    ///
    /// Fails with `Closed` after shutdown and `Full` when the task ring is full.
    pub fn schedule(&self, task: Task) -> Result<()> {
        self.inner.schedule(task)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_closed()
    }

    /// Stop accepting tasks and let workers retire.
    ///
    /// `Graceful` lets queued tasks run first; `Immediate` drops them.
    /// Running tasks are never interrupted.
    pub fn shutdown(&self, mode: ShutdownMode) {
        self.inner.shutdown(mode);
    }

    /// Wait for every worker and the launcher to exit.
    ///
    /// A timeout too large to add to the current instant, such as
    /// `Duration::MAX`, waits without a deadline.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Deadline::after(timeout);
        if !self.inner.launcher.await_termination(deadline.remaining()) {
            return false;
        }
        let launcher = self.inner.launcher_thread.lock().take();
        if let Some(handle) = launcher {
            let backoff = Backoff::new();
            while !handle.is_finished() {
                if deadline.is_expired() {
                    *self.inner.launcher_thread.lock() = Some(handle);
                    return false;
                }
                backoff.snooze();
            }
            let _ = handle.join();
        }
        true
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    pub(crate) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }
}

impl Executor for ThreadPool {
    fn execute(&self, task: Task) -> Result<()> {
        self.schedule(task)
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.inner.config.name)
            .field("stats", &self.inner.stats())
            .finish()
    }
}

impl PoolInner {
    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn launcher(&self) -> &IdleThreadManager {
        &self.launcher
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn now_nanos(&self) -> u64 {
        duration_nanos(self.epoch.elapsed())
    }

    pub(crate) fn next_owner_id(&self) -> u64 {
        self.next_owner_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn has_tasks(&self) -> bool {
        fence(Ordering::SeqCst);
        !self.tasks.is_empty()
    }

    pub(crate) fn take_task(&self) -> Option<Task> {
        self.tasks.try_poll()
    }

    fn schedule(&self, task: Task) -> Result<()> {
        if self.is_closed() {
            return Err(RingError::Closed);
        }
        if self.tasks.try_offer(task).is_err() {
            return Err(if self.tasks.is_write_closed() {
                RingError::Closed
            } else {
                RingError::Full
            });
        }
        self.wake_idle();
        Ok(())
    }

    /// Hand the newest task to a worker: a spinner, an idle worker or a new one
    fn wake_idle(&self) {
        fence(Ordering::SeqCst);
        if self.spinning.load(Ordering::SeqCst) >= self.tasks.size() {
            return;
        }
        while let Some(handle) = self.idle_threads.try_poll() {
            handle.left_idle_ring();
            if handle.try_wake() {
                return;
            }
        }
        self.launcher.wake();
    }

    /// Poll for a task, spinning briefly when a spin slot is free.
    ///
    /// A freshly woken worker always spins: the task that woke it may be
    /// racing its way in.
    pub(crate) fn poll_task(&self, is_wake: bool) -> Option<Task> {
        let task = self.spin_for_task(is_wake);
        if task.is_some() && !self.tasks.is_empty() {
            // chain the wake: a task scheduled while this worker still counted
            // as spinning woke nobody
            self.wake_idle();
        }
        task
    }

    fn spin_for_task(&self, is_wake: bool) -> Option<Task> {
        if let Some(task) = self.take_task() {
            return Some(task);
        }
        if !is_wake && !self.try_begin_spin() {
            return None;
        }
        if is_wake {
            self.spinning.fetch_add(1, Ordering::SeqCst);
        }

        let deadline = Deadline::after(self.config.spin_timeout);
        let backoff = Backoff::new();
        let found = loop {
            if let Some(task) = self.take_task() {
                break Some(task);
            }
            if self.is_closed() || deadline.is_expired() {
                break None;
            }
            backoff.spin();
        };
        self.spinning.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(found = found.is_some(), "spin ended");

        // a scheduler that saw us spinning did not wake anyone
        found.or_else(|| {
            fence(Ordering::SeqCst);
            self.take_task()
        })
    }

    fn try_begin_spin(&self) -> bool {
        let mut spinning = self.spinning.load(Ordering::Acquire);
        loop {
            if spinning >= self.spin_max {
                return false;
            }
            match self.spinning.compare_exchange_weak(
                spinning,
                spinning + 1,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => spinning = current,
            }
        }
    }

    pub(crate) fn register_idle(&self, handle: &Arc<WorkerHandle>) {
        if !handle.enter_idle_ring() {
            return;
        }
        if self.idle_threads.try_offer(handle.clone()).is_err() {
            // full of stale entries from retired workers; park on the timeout alone
            handle.left_idle_ring();
        }
    }

    pub(crate) fn spawn_worker(self: Arc<Self>) -> Result<()> {
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let parker = Parker::new();
        let handle = Arc::new(WorkerHandle::new(id, parker.unparker().clone()));
        self.threads.lock().push(handle.clone());

        let pool = self.clone();
        let thread_handle = handle.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-{}", self.config.name, id))
            .spawn(move || worker::run(pool, thread_handle, parker));
        match spawned {
            Ok(_) => Ok(()),
            Err(err) => {
                self.unregister(id);
                Err(err.into())
            }
        }
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.threads.lock().retain(|handle| handle.id() != id);
    }

    /// Workers running a task of `owner` for longer than `timeout`
    pub(crate) fn count_slow_threads(&self, owner: u64, timeout: Duration) -> usize {
        let now = self.now_nanos();
        let cutoff = now.saturating_sub(duration_nanos(timeout));
        if cutoff == 0 {
            return 0;
        }
        self.threads
            .lock()
            .iter()
            .filter(|handle| handle.is_slow(owner, cutoff))
            .count()
    }

    fn shutdown(&self, mode: ShutdownMode) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tasks.close_write();
        if mode == ShutdownMode::Immediate {
            let mut dropped = 0usize;
            while self.tasks.try_poll().is_some() {
                dropped += 1;
            }
            if dropped > 0 {
                tracing::debug!(pool = %self.config.name, dropped, "queued tasks discarded");
            }
        }
        self.launcher.close();
        for handle in self.threads.lock().iter() {
            if !handle.try_wake() {
                handle.nudge();
            }
        }
        tracing::debug!(pool = %self.config.name, ?mode, "thread pool shutdown");
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            live: self.launcher.thread_count(),
            idle: self.launcher.idle_count(),
            starting: self.launcher.starting_count(),
            spinning: self.spinning.load(Ordering::Relaxed),
            created_total: self.launcher.created_total(),
            retired_total: self.launcher.retired_total(),
            queued_tasks: self.tasks.size(),
        }
    }
}

//! Thread accounting and launch policy for the pool.
//!
//! Live, starting and idle threads are counted separately. A launch reserves a
//! starting slot first, so `live + starting` never exceeds `thread_max` even
//! while threads are mid-spawn. New threads are counted idle from the moment
//! they are reserved. Spawning itself happens on one launcher thread, which
//! keeps at least `idle_min` threads idle and rate-limits launches.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::duration_nanos;
use crate::config::PoolConfig;
use crate::error::Result;
use crate::queue::Deadline;

#[derive(Debug)]
pub struct IdleThreadManager {
    thread_max: usize,
    idle_min: usize,
    idle_max: usize,
    idle_timeout: Duration,

    thread_count: AtomicUsize,
    idle_count: AtomicUsize,
    starting_count: AtomicUsize,
    created_total: AtomicU64,
    retired_total: AtomicU64,

    /// Nanoseconds since `epoch` before which no idle thread may expire
    idle_expire: AtomicU64,
    epoch: Instant,
    active: AtomicBool,

    launch_requested: Mutex<bool>,
    launch_cond: Condvar,
    exit_lock: Mutex<()>,
    exit_cond: Condvar,
}

impl IdleThreadManager {
    pub fn new(config: &PoolConfig) -> Self {
        let epoch = Instant::now();
        Self {
            thread_max: config.thread_max,
            idle_min: config.idle_min,
            idle_max: config.idle_max,
            idle_timeout: config.idle_timeout,
            thread_count: AtomicUsize::new(0),
            idle_count: AtomicUsize::new(0),
            starting_count: AtomicUsize::new(0),
            created_total: AtomicU64::new(0),
            retired_total: AtomicU64::new(0),
            idle_expire: AtomicU64::new(duration_nanos(config.idle_timeout)),
            epoch,
            active: AtomicBool::new(true),
            launch_requested: Mutex::new(false),
            launch_cond: Condvar::new(),
            exit_lock: Mutex::new(()),
            exit_cond: Condvar::new(),
        }
    }

    #[inline]
    fn now_nanos(&self) -> u64 {
        duration_nanos(self.epoch.elapsed())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.idle_count.load(Ordering::Acquire)
    }

    pub fn starting_count(&self) -> usize {
        self.starting_count.load(Ordering::Acquire)
    }

    pub fn created_total(&self) -> u64 {
        self.created_total.load(Ordering::Relaxed)
    }

    pub fn retired_total(&self) -> u64 {
        self.retired_total.load(Ordering::Relaxed)
    }

    /// Reserve a starting slot if `live + starting < thread_max`
    pub fn allocate_thread(&self) -> bool {
        loop {
            let starting = self.starting_count.load(Ordering::Acquire);
            let live = self.thread_count.load(Ordering::Acquire);
            if live + starting >= self.thread_max {
                return false;
            }
            if self
                .starting_count
                .compare_exchange(starting, starting + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Undo a reservation whose spawn failed
    pub(crate) fn abort_start(&self) {
        self.starting_count.fetch_sub(1, Ordering::AcqRel);
        self.idle_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// A reserved thread is running. Live is raised before starting drops.
    pub fn on_thread_begin(&self) {
        self.thread_count.fetch_add(1, Ordering::AcqRel);
        self.starting_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn on_thread_end(&self) {
        self.thread_count.fetch_sub(1, Ordering::AcqRel);
        self.retired_total.fetch_add(1, Ordering::Relaxed);

        drop(self.exit_lock.lock());
        self.exit_cond.notify_all();
        self.wake();
    }

    pub fn on_idle_begin(&self) {
        self.idle_count.fetch_add(1, Ordering::AcqRel);
    }

    /// A thread left idle; top the idle set back up if it fell below the minimum
    pub fn on_idle_end(&self) {
        let idle = self.idle_count.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if idle < self.idle_min {
            self.wake();
        }
    }

    /// More idle threads than `idle_max`: the caller should retire at once
    pub fn is_idle_overflow(&self) -> bool {
        let idle = self.idle_count();
        self.idle_min < self.idle_max && self.idle_max < idle
    }

    /// Whether an idle thread should retire now.
    ///
    /// Always true once the manager is closed. Above `idle_min`, true when over
    /// `idle_max`, or when the shared expire time has passed and this caller
    /// wins the race to push it one idle-timeout further, so surplus threads
    /// retire one per timeout period.
    pub fn is_idle_expire(&self) -> bool {
        if !self.is_active() {
            return true;
        }

        let idle = self.idle_count();
        if idle <= self.idle_min {
            return false;
        }
        if self.is_idle_overflow() {
            return true;
        }

        let now = self.now_nanos();
        let expire = self.idle_expire.load(Ordering::Acquire);
        expire < now
            && self
                .idle_expire
                .compare_exchange(
                    expire,
                    now.saturating_add(duration_nanos(self.idle_timeout)),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
    }

    /// Reserve one launch when active, below `idle_min` idle and below
    /// `thread_max`. The reserved thread counts as idle.
    pub fn do_start(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        if self.idle_count() >= self.idle_min {
            return false;
        }
        if !self.allocate_thread() {
            return false;
        }
        self.idle_count.fetch_add(1, Ordering::AcqRel);
        self.created_total.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Ask the launcher thread to re-check the idle minimum
    pub fn wake(&self) {
        let mut requested = self.launch_requested.lock();
        *requested = true;
        self.launch_cond.notify_one();
    }

    /// Block the launcher until a wake or `timeout`. Clears the request.
    pub(crate) fn wait_for_request(&self, timeout: Duration) {
        let mut requested = self.launch_requested.lock();
        if !*requested && self.is_active() {
            self.launch_cond.wait_for(&mut requested, timeout);
        }
        *requested = false;
    }

    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
        self.wake();
    }

    /// Wait until no thread is live or starting. An unrepresentable deadline
    /// waits forever.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Deadline::after(timeout);
        let mut guard = self.exit_lock.lock();
        loop {
            if self.thread_count() + self.starting_count() == 0 {
                return true;
            }
            match deadline.instant() {
                Some(deadline) => {
                    if self.exit_cond.wait_until(&mut guard, deadline).timed_out() {
                        return self.thread_count() + self.starting_count() == 0;
                    }
                }
                None => self.exit_cond.wait(&mut guard),
            }
        }
    }
}

/// Caps launches per period; over the cap the launcher sleeps.
#[derive(Debug)]
pub(crate) struct LaunchThrottle {
    limit: usize,
    period: Duration,
    sleep: Duration,
    window_start: Instant,
    launches: usize,
}

impl LaunchThrottle {
    pub(crate) fn new(config: &PoolConfig) -> Self {
        Self {
            limit: config.throttle_limit,
            period: config.throttle_period,
            sleep: config.throttle_sleep_time,
            window_start: Instant::now(),
            launches: 0,
        }
    }

    /// Account for one launch, sleeping while the current window is exhausted.
    /// Returns the number of sleeps taken.
    pub(crate) fn acquire(&mut self) -> usize {
        let mut sleeps = 0;
        loop {
            if self.window_start.elapsed() >= self.period {
                self.window_start = Instant::now();
                self.launches = 0;
            }
            if self.launches < self.limit {
                self.launches += 1;
                return sleeps;
            }
            std::thread::sleep(self.sleep);
            sleeps += 1;
        }
    }
}

/// Launcher thread body: keep the idle minimum topped up until closed.
pub(crate) fn run_launcher<F>(manager: &IdleThreadManager, mut throttle: LaunchThrottle, mut spawn: F)
where
    F: FnMut() -> Result<()>,
{
    while manager.is_active() {
        while manager.do_start() {
            throttle.acquire();
            if let Err(err) = spawn() {
                manager.abort_start();
                tracing::error!(%err, "worker thread spawn failed");
                std::thread::sleep(throttle.sleep);
                break;
            }
        }
        manager.wait_for_request(Duration::from_secs(1));
    }
    tracing::debug!("launcher stopped");
}

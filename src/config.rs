//! Configuration for rings, the thread pool and executors.
//!
//! Plain typed values with validating constructors. Nothing here reads files
//! or the environment.

use std::time::Duration;

use crate::constants::*;
use crate::error::{Result, RingError};

fn check_capacity(what: &str, capacity: usize) -> Result<()> {
    if capacity < MIN_RING_CAPACITY {
        return Err(RingError::config(format!("{what} must be at least {MIN_RING_CAPACITY}, got {capacity}")));
    }
    if !capacity.is_power_of_two() {
        return Err(RingError::config(format!("{what} must be a power of 2, got {capacity}")));
    }
    Ok(())
}

/// Configuration for a fixed-capacity ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    /// Number of slots (power of 2, at least 2). Holds `capacity - 1` items.
    pub capacity: usize,
    /// Consumer stages sharing the ring. `stages + 1` counters are allocated.
    pub stages: usize,
}

impl RingConfig {
    pub fn new(capacity: usize) -> Result<Self> {
        check_capacity("Ring capacity", capacity)?;
        Ok(Self { capacity, stages: 1 })
    }

    /// Set the number of pipeline stages
    pub fn with_stages(mut self, stages: usize) -> Result<Self> {
        if stages == 0 {
            return Err(RingError::config("Number of stages must be greater than 0"));
        }
        self.stages = stages;
        Ok(self)
    }

    pub(crate) fn counter_count(&self) -> usize {
        self.stages + 1
    }
}

/// Capacity bounds for a [`crate::ResizingRing`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizingConfig {
    pub min_capacity: usize,
    pub max_capacity: usize,
    pub stages: usize,
}

impl ResizingConfig {
    pub fn new(min_capacity: usize, max_capacity: usize) -> Result<Self> {
        check_capacity("Minimum capacity", min_capacity)?;
        check_capacity("Maximum capacity", max_capacity)?;
        if max_capacity < min_capacity {
            return Err(RingError::config(format!(
                "Maximum capacity {max_capacity} is below minimum capacity {min_capacity}"
            )));
        }
        Ok(Self { min_capacity, max_capacity, stages: 1 })
    }

    pub fn with_stages(mut self, stages: usize) -> Result<Self> {
        if stages == 0 {
            return Err(RingError::config("Number of stages must be greater than 0"));
        }
        self.stages = stages;
        Ok(self)
    }
}

/// Thread pool tunables
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Prefix for worker thread names
    pub name: String,
    /// Hard ceiling on live plus starting threads
    pub thread_max: usize,
    /// Idle threads kept ready; the launcher spawns while below this
    pub idle_min: usize,
    /// Idle threads above this retire immediately
    pub idle_max: usize,
    /// How long a surplus idle thread parks before retiring
    pub idle_timeout: Duration,
    /// Launches allowed per `throttle_period`
    pub throttle_limit: usize,
    pub throttle_period: Duration,
    /// Launcher back-off when over the launch limit
    pub throttle_sleep_time: Duration,
    pub task_queue_capacity: usize,
    pub idle_ring_capacity: usize,
    /// Busy-poll window before parking
    pub spin_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "ringflow".to_string(),
            thread_max: DEFAULT_THREAD_MAX,
            idle_min: DEFAULT_IDLE_MIN,
            idle_max: DEFAULT_IDLE_MAX,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            throttle_limit: DEFAULT_THROTTLE_LIMIT,
            throttle_period: DEFAULT_THROTTLE_PERIOD,
            throttle_sleep_time: DEFAULT_THROTTLE_SLEEP,
            task_queue_capacity: DEFAULT_TASK_QUEUE_CAPACITY,
            idle_ring_capacity: DEFAULT_IDLE_RING_CAPACITY,
            spin_timeout: DEFAULT_SPIN_TIMEOUT,
        }
    }
}

impl PoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_thread_max(mut self, thread_max: usize) -> Self {
        self.thread_max = thread_max;
        self
    }

    pub fn with_idle_min(mut self, idle_min: usize) -> Self {
        self.idle_min = idle_min;
        self
    }

    pub fn with_idle_max(mut self, idle_max: usize) -> Self {
        self.idle_max = idle_max;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_throttle_limit(mut self, limit: usize) -> Self {
        self.throttle_limit = limit;
        self
    }

    pub fn with_throttle_period(mut self, period: Duration) -> Self {
        self.throttle_period = period;
        self
    }

    pub fn with_throttle_sleep_time(mut self, sleep: Duration) -> Self {
        self.throttle_sleep_time = sleep;
        self
    }

    pub fn with_task_queue_capacity(mut self, capacity: usize) -> Self {
        self.task_queue_capacity = capacity;
        self
    }

    pub fn with_idle_ring_capacity(mut self, capacity: usize) -> Self {
        self.idle_ring_capacity = capacity;
        self
    }

    pub fn with_spin_timeout(mut self, timeout: Duration) -> Self {
        self.spin_timeout = timeout;
        self
    }

    /// Check the combination of values. Called by [`crate::ThreadPool::new`].
    pub fn validate(&self) -> Result<()> {
        if self.thread_max == 0 {
            return Err(RingError::config("thread-max must be greater than 0"));
        }
        if self.idle_min == 0 {
            return Err(RingError::config("idle-min must be greater than 0"));
        }
        if self.idle_min > self.thread_max {
            return Err(RingError::config(format!(
                "idle-min {} exceeds thread-max {}",
                self.idle_min, self.thread_max
            )));
        }
        if self.idle_max < self.idle_min {
            return Err(RingError::config(format!(
                "idle-max {} is below idle-min {}",
                self.idle_max, self.idle_min
            )));
        }
        if self.throttle_limit == 0 {
            return Err(RingError::config("throttle-limit must be greater than 0"));
        }
        check_capacity("Task queue capacity", self.task_queue_capacity)?;
        check_capacity("Idle ring capacity", self.idle_ring_capacity)?;
        // every live thread must fit in the idle registry
        if self.thread_max >= self.idle_ring_capacity {
            return Err(RingError::config(format!(
                "idle ring capacity {} cannot hold thread-max {} threads",
                self.idle_ring_capacity, self.thread_max
            )));
        }
        Ok(())
    }
}

/// Settings for an [`crate::ExecutorThrottle`]
#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    /// Tasks allowed to run at once, not counting slow ones
    pub max_concurrency: usize,
    /// A task running longer than this counts as slow
    pub task_timeout: Duration,
    /// Period of the slow-task scan
    pub scan_interval: Duration,
    pub queue_capacity: usize,
}

impl ThrottleConfig {
    pub fn new(max_concurrency: usize) -> Result<Self> {
        if max_concurrency == 0 {
            return Err(RingError::config("max concurrency must be greater than 0"));
        }
        Ok(Self {
            max_concurrency,
            task_timeout: DEFAULT_SLOW_TASK_TIMEOUT,
            scan_interval: DEFAULT_SLOW_SCAN_INTERVAL,
            queue_capacity: DEFAULT_EXECUTOR_QUEUE_CAPACITY,
        })
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(RingError::config("task timeout must be greater than 0"));
        }
        self.task_timeout = timeout;
        Ok(self)
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(RingError::config("scan interval must be greater than 0"));
        }
        self.scan_interval = interval;
        Ok(self)
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Result<Self> {
        check_capacity("Executor queue capacity", capacity)?;
        self.queue_capacity = capacity;
        Ok(self)
    }
}

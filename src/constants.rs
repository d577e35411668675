//! Ringflow Constants
//!
//! Defaults shared by the queues and the scheduler.

use std::time::Duration;

/// Smallest ring a queue accepts (holds a single item)
pub const MIN_RING_CAPACITY: usize = 2;

/// Positions drained per chunk by the MPMC bulk drain before publishing the tail
pub const DELIVER_CHUNK: u64 = 64;

/// Chunk used by the single-writer and pipe drains
pub const DELIVER_CHUNK_LAZY: u64 = 32;

/// First chunk of a pipeline stage drain; doubles up to [`STAGE_CHUNK_MAX`]
pub const STAGE_CHUNK_MIN: u64 = 2;

pub const STAGE_CHUNK_MAX: u64 = 256;

/// Growth factor of a resizing ring
pub const RESIZE_FACTOR: usize = 4;

/// Defaults for delivery queues built by [`crate::DeliverQueueBuilder`]
pub const DEFAULT_DELIVER_INITIAL: usize = 16;
pub const DEFAULT_DELIVER_CAPACITY: usize = 1024;

// ============================================================================
// Thread pool
// ============================================================================

pub const DEFAULT_THREAD_MAX: usize = 8192;
pub const DEFAULT_IDLE_MIN: usize = 8;
pub const DEFAULT_IDLE_MAX: usize = 1024;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Thread launches allowed per throttle period before the launcher sleeps
pub const DEFAULT_THROTTLE_LIMIT: usize = 256;
pub const DEFAULT_THROTTLE_PERIOD: Duration = Duration::from_secs(1);
pub const DEFAULT_THROTTLE_SLEEP: Duration = Duration::from_millis(1);

pub const DEFAULT_TASK_QUEUE_CAPACITY: usize = 16 * 1024;
pub const DEFAULT_IDLE_RING_CAPACITY: usize = 16 * 1024;

/// Busy-poll window before a worker parks
pub const DEFAULT_SPIN_TIMEOUT: Duration = Duration::from_micros(50);

/// Upper bound on pool threads spinning at once
pub const SPIN_CPU_LIMIT: usize = 4;

/// Tasks a worker runs back to back before re-checking the idle path
pub const WORKER_TASK_BATCH: usize = 32;

// ============================================================================
// Executors
// ============================================================================

pub const DEFAULT_SLOW_TASK_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_SLOW_SCAN_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_EXECUTOR_QUEUE_CAPACITY: usize = 64 * 1024;
pub const SPIN_EXECUTOR_INITIAL: usize = 64;

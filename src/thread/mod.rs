//! Elastic worker pool and the executors layered on it.
//!
//! - [`pool::ThreadPool`] - spin-then-park workers over a [`crate::FixedRing`] of tasks
//! - [`launcher::IdleThreadManager`] - thread accounting and the launch policy
//! - [`throttle::ExecutorThrottle`] - concurrency ceiling with slow-task relief
//! - [`spin::ExecutorSpin`] - bursty scheduling over a [`crate::ResizingRing`]
//!
//! The pool is an explicit handle: create one at startup and pass clones to
//! whatever needs to schedule work.

pub mod launcher;
pub mod pool;
pub mod spin;
pub mod throttle;
pub(crate) mod worker;

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Unit of work run by a pool thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Anything that accepts tasks
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task) -> Result<()>;
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: Task) -> Result<()> {
        (**self).execute(task)
    }
}

/// Whole nanoseconds in `duration`, saturating at `u64::MAX`
#[inline]
pub(crate) fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Run `task`, logging a panic instead of unwinding into the caller.
///
/// Returns false when the task panicked.
pub(crate) fn run_guarded(task: Task, context: &str) -> bool {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
        Ok(()) => true,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::warn!(context, %message, "task panicked");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_nanos_saturates() {
        assert_eq!(duration_nanos(Duration::from_micros(3)), 3_000);
        assert_eq!(duration_nanos(Duration::MAX), u64::MAX);
        assert_eq!(duration_nanos(Duration::from_secs(u64::MAX / 1_000_000_000 + 1)), u64::MAX);
    }

    #[test]
    fn test_run_guarded_catches_panic() {
        assert!(run_guarded(Box::new(|| {}), "test"));
        assert!(!run_guarded(Box::new(|| panic!("boom")), "test"));
    }
}

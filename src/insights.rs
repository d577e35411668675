//! Insights - Observability for ringflow.
//!
//! Thin wrappers over `tracing` so hot paths stay terse. With no subscriber
//! installed every call here is a cheap no-op.
//!
//! # Usage
//!
//! ```rust,ignore
//! ringflow::insights::init_test_logging();
//! // RUST_LOG=ringflow=debug cargo test
//! ```

use std::sync::Once;
use std::time::Duration;

static LOGGING: Once = Once::new();

/// Install a fmt subscriber writing through the test harness.
///
/// Honors `RUST_LOG`; defaults to `warn`. Safe to call from every test.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_thread_names(true)
            .try_init();
    });
}

/// Record a ring growing from `old` to `new` slots
#[inline]
pub fn record_resize(old: usize, new: usize, head: u64) {
    tracing::debug!(old, new, head, "ring resized");
}

/// Record backpressure (ring full, producer about to wait)
#[inline]
pub fn record_backpressure(capacity: usize) {
    tracing::trace!(capacity, "ring full");
}

/// Record the outcome of a slow-task scan
#[inline]
pub fn record_slow_tasks(executor: &str, slow: usize, timeout: Duration) {
    if slow > 0 {
        tracing::warn!(executor, slow, timeout_ms = timeout.as_millis() as u64, "slow tasks detected");
    }
}

/// Record a worker thread starting or retiring
#[inline]
pub fn record_thread(pool: &str, id: u64, event: &'static str) {
    tracing::debug!(pool, id, event, "worker thread");
}

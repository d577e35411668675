//! Stress testing utilities for timed multi-threaded runs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError};
use rand::Rng;

/// Configuration for stress tests
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Duration to run the test
    pub duration: Duration,
    /// Number of producer threads
    pub producers: usize,
    /// Number of consumer threads
    pub consumers: usize,
    /// Items offered between jitter pauses
    pub batch_size: usize,
    /// Upper bound of the random pause after each batch (zero = none)
    pub max_jitter: Duration,
    /// Print progress every interval
    pub report_interval: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(2),
            producers: 1,
            consumers: 1,
            batch_size: 100,
            max_jitter: Duration::ZERO,
            report_interval: Duration::from_millis(500),
        }
    }
}

impl StressConfig {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }

    pub fn with_producers(mut self, n: usize) -> Self {
        self.producers = n;
        self
    }

    pub fn with_consumers(mut self, n: usize) -> Self {
        self.consumers = n;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_jitter(mut self, max: Duration) -> Self {
        self.max_jitter = max;
        self
    }

    /// Sleep a random slice of `max_jitter`; uneven pacing shakes out races
    pub fn jitter(&self) {
        if self.max_jitter.is_zero() {
            return;
        }
        let micros = self.max_jitter.as_micros() as u64;
        let pause = rand::thread_rng().gen_range(0..=micros);
        std::thread::sleep(Duration::from_micros(pause));
    }
}

/// Metrics collected during stress testing
#[derive(Debug, Clone, Default)]
pub struct StressMetrics {
    pub offered: u64,
    pub received: u64,
    pub rejected: u64,
    pub errors: u64,
    pub duration: Duration,
    pub peak_rate: f64,
}

impl StressMetrics {
    pub fn offer_rate(&self) -> f64 {
        if self.duration.as_secs_f64() > 0.0 {
            self.offered as f64 / self.duration.as_secs_f64()
        } else {
            0.0
        }
    }

    pub fn receive_rate(&self) -> f64 {
        if self.duration.as_secs_f64() > 0.0 {
            self.received as f64 / self.duration.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Offered items never received
    pub fn lost(&self) -> u64 {
        self.offered.saturating_sub(self.received)
    }
}

/// Shared counters for stress testing
#[derive(Debug)]
pub struct StressCounters {
    pub offered: AtomicU64,
    pub received: AtomicU64,
    pub rejected: AtomicU64,
    pub errors: AtomicU64,
    pub running: AtomicBool,
}

impl StressCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_offer(&self) {
        self.offered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Offer timed out or the ring was closed
    pub fn record_reject(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StressMetrics {
        StressMetrics {
            offered: self.offered.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            duration: Duration::ZERO,
            peak_rate: 0.0,
        }
    }
}

impl Default for StressCounters {
    fn default() -> Self {
        Self {
            offered: AtomicU64::new(0),
            received: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            running: AtomicBool::new(true),
        }
    }
}

/// Runner for stress tests with progress reporting
pub struct StressRunner {
    config: StressConfig,
    counters: Arc<StressCounters>,
}

impl StressRunner {
    pub fn new(config: StressConfig) -> Self {
        Self {
            config,
            counters: StressCounters::new(),
        }
    }

    pub fn counters(&self) -> Arc<StressCounters> {
        self.counters.clone()
    }

    pub fn config(&self) -> &StressConfig {
        &self.config
    }

    /// Run `test_fn`; the counters stop running once the configured
    /// duration has elapsed, and `test_fn` is expected to wind down then.
    pub fn run_with_progress<F>(&self, test_fn: F) -> StressMetrics
    where
        F: FnOnce(Arc<StressCounters>),
    {
        let start = Instant::now();
        let counters = self.counters.clone();
        let duration = self.config.duration;
        let report_interval = self.config.report_interval;
        let (done_tx, done_rx) = bounded::<()>(1);

        let report_counters = counters.clone();
        let reporter = std::thread::spawn(move || {
            let mut last_received = 0u64;
            let mut peak_rate = 0.0f64;

            loop {
                match done_rx.recv_timeout(report_interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }

                let offered = report_counters.offered.load(Ordering::Relaxed);
                let received = report_counters.received.load(Ordering::Relaxed);
                let errors = report_counters.errors.load(Ordering::Relaxed);

                let rate = (received - last_received) as f64 / report_interval.as_secs_f64();
                peak_rate = peak_rate.max(rate);
                last_received = received;

                let elapsed = start.elapsed();
                eprintln!(
                    "[{:>5.1}s] offered: {:>10}, recv: {:>10}, rate: {:>10.0}/s, errors: {}",
                    elapsed.as_secs_f64(),
                    offered,
                    received,
                    rate,
                    errors
                );

                if elapsed >= duration {
                    report_counters.stop();
                }
            }

            peak_rate
        });

        test_fn(counters.clone());

        counters.stop();
        let _ = done_tx.send(());
        let peak_rate = reporter.join().unwrap_or(0.0);

        let mut metrics = counters.snapshot();
        metrics.duration = start.elapsed();
        metrics.peak_rate = peak_rate;
        metrics
    }
}

/// Print a summary of stress test results
pub fn print_summary(name: &str, metrics: &StressMetrics) {
    eprintln!("\n=== {name} ===");
    eprintln!("  Duration:      {:>10.2}s", metrics.duration.as_secs_f64());
    eprintln!("  Offered:       {:>10}", metrics.offered);
    eprintln!("  Received:      {:>10}", metrics.received);
    eprintln!("  Rejected:      {:>10}", metrics.rejected);
    eprintln!("  Offer rate:    {:>10.0} items/s", metrics.offer_rate());
    eprintln!("  Receive rate:  {:>10.0} items/s", metrics.receive_rate());
    eprintln!("  Peak rate:     {:>10.0} items/s", metrics.peak_rate);
    eprintln!("  Lost:          {:>10}", metrics.lost());
    eprintln!("  Errors:        {:>10}", metrics.errors);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stress_counters() {
        let counters = StressCounters::new();

        counters.record_offer();
        counters.record_offer();
        counters.record_receive();
        counters.record_reject();

        let metrics = counters.snapshot();
        assert_eq!(metrics.offered, 2);
        assert_eq!(metrics.received, 1);
        assert_eq!(metrics.rejected, 1);
        assert_eq!(metrics.lost(), 1);
    }

    #[test]
    fn test_stress_metrics_rates() {
        let metrics = StressMetrics {
            offered: 1000,
            received: 990,
            duration: Duration::from_secs(10),
            ..Default::default()
        };

        assert!((metrics.offer_rate() - 100.0).abs() < 0.1);
        assert!((metrics.receive_rate() - 99.0).abs() < 0.1);
        assert_eq!(metrics.lost(), 10);
    }

    #[test]
    fn test_runner_stops_after_duration() {
        let config = StressConfig::new(Duration::from_millis(50)).with_jitter(Duration::from_micros(10));
        config.jitter();
        let runner = StressRunner::new(StressConfig {
            report_interval: Duration::from_millis(10),
            ..config
        });
        let metrics = runner.run_with_progress(|counters| {
            while counters.is_running() {
                counters.record_offer();
                counters.record_receive();
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        assert!(metrics.duration >= Duration::from_millis(50));
        assert_eq!(metrics.lost(), 0);
    }
}

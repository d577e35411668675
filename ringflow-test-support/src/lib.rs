//! # ringflow-test-support
//!
//! Testing infrastructure for ringflow.
//!
//! ## Components
//!
//! - **StressRunner** - Timed multi-threaded runs with progress reporting
//! - **SequenceChecker** - Per-producer ordering as seen by one consumer
//! - **ExactlyOnce** - Loss and duplicate detection across all consumers

pub mod stress;
pub mod verify;

pub use stress::{print_summary, StressConfig, StressCounters, StressMetrics, StressRunner};
pub use verify::{decode, encode, ExactlyOnce, SequenceChecker};

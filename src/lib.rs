//! # ringflow
//!
//! Bounded lock-free ring queues and the elastic worker pool that drains them.
//!
//! ## Queues
//!
//! - [`FixedRing`] - multi-producer / multi-consumer, CAS on head and tail
//! - [`SingleWriterRing`] - one producer (enforced by the [`SingleWriter`] handle), any consumers
//! - [`PipeRing`] - one producer, one consumer, lazy stores only
//! - [`ResizingRing`] - grows 4x from a minimum to a maximum capacity while in use
//!
//! All rings hold at most `capacity - 1` items and block through a [`RingBlocker`]
//! using the ticket handshake (issue ticket, re-check, wait).
//!
//! ## Scheduling
//!
//! - [`ThreadPool`] - spin-then-park workers over a fixed task ring
//! - [`ExecutorThrottle`] - concurrency ceiling with slow-task relief
//! - [`ExecutorSpin`] - bursty scheduling over a resizing ring
//! - [`DeliverQueue`] / [`Pipeline`] - wake-driven drain workers
//!
//! ```rust,ignore
//! use ringflow::{FixedRing, RingConsumer, RingProducer};
//!
//! let ring = FixedRing::new(4)?;
//! ring.try_offer("a").unwrap();
//! assert_eq!(ring.try_poll(), Some("a"));
//! ```

pub mod config;
pub mod constants;
pub mod deliver;
pub mod error;
pub mod insights;
pub mod metrics;
pub mod queue;
pub mod thread;

pub use config::{PoolConfig, ResizingConfig, RingConfig, ThrottleConfig};
pub use deliver::{DeliverQueue, DeliverQueueBuilder, DeliverWorker, Pipeline};
pub use error::{Result, RingError};
pub use metrics::PoolStats;
pub use queue::blocker::{BasicBlocker, NullBlocker, NullWake, RingBlocker, ShutdownMode, WorkerWake};
pub use queue::counter::CounterGroup;
pub use queue::fixed::FixedRing;
pub use queue::pipe::{PipeReader, PipeRing, PipeWriter};
pub use queue::resizing::ResizingRing;
pub use queue::single_writer::{SingleWriter, SingleWriterRing};
pub use queue::storage::RingStorage;
pub use queue::{Deliver, QueueRing, RingConsumer, RingProducer, StagedRing};
pub use thread::pool::ThreadPool;
pub use thread::spin::ExecutorSpin;
pub use thread::throttle::ExecutorThrottle;
pub use thread::{Executor, Task};

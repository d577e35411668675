//! Bounded ring queues.
//!
//! Every variant stores items in a [`storage::RingStorage`] addressed by
//! monotonic counters from a [`counter::CounterGroup`] and blocks through a
//! [`blocker::RingBlocker`]. A ring of capacity `C` holds at most `C - 1` items.
//!
//! | Variant | Producers | Consumers | Staged delivery |
//! |---|---|---|---|
//! | [`fixed::FixedRing`] | many | many | yes |
//! | [`single_writer::SingleWriterRing`] | one (handle) | many | yes |
//! | [`pipe::PipeRing`] | one (handle) | one (handle) | no |
//! | [`resizing::ResizingRing`] | many | many | yes |
//!
//! Rings do not implement removal of arbitrary values, iteration or membership
//! tests.

pub mod blocker;
pub mod counter;
pub(crate) mod core;
pub mod fixed;
pub mod pipe;
pub mod resizing;
pub mod single_writer;
pub mod storage;

use std::time::{Duration, Instant};

use blocker::{ShutdownMode, WorkerWake};

/// Per-item callback of the drain paths.
///
/// `context` is owned by the caller and passed through untouched. Implemented
/// for any `FnMut(M, &mut C) -> anyhow::Result<()>`.
pub trait Deliver<M, C: ?Sized = ()> {
    fn deliver(&mut self, item: M, context: &mut C) -> anyhow::Result<()>;
}

impl<M, C: ?Sized, F> Deliver<M, C> for F
where
    F: FnMut(M, &mut C) -> anyhow::Result<()>,
{
    #[inline]
    fn deliver(&mut self, item: M, context: &mut C) -> anyhow::Result<()> {
        self(item, context)
    }
}

/// State and lifecycle shared by every ring variant
pub trait QueueRing<T> {
    /// Number of slots. At most `capacity() - 1` items fit.
    fn capacity(&self) -> usize;

    /// Next allocation position
    fn head(&self) -> u64;

    /// Next consumption position of the final consumer
    fn tail(&self) -> u64;

    fn size(&self) -> usize {
        let tail = self.tail();
        let head = self.head();
        head.saturating_sub(tail) as usize
    }

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn remaining_capacity(&self) -> usize {
        (self.capacity() - 1).saturating_sub(self.size())
    }

    fn is_write_closed(&self) -> bool;

    /// Reject further offers and wake every waiter
    fn close_write(&self);

    /// Wake the consumer side
    fn wake(&self);

    fn shutdown(&self, mode: ShutdownMode);
}

pub trait RingProducer<T>: QueueRing<T> {
    /// Append `value`, waiting up to `timeout` for room.
    ///
    /// Returns the value back when the ring stayed full or is closed for writes.
    /// A zero timeout never blocks.
    fn offer(&self, value: T, timeout: Duration) -> Result<(), T>;

    fn try_offer(&self, value: T) -> Result<(), T> {
        self.offer(value, Duration::ZERO)
    }
}

pub trait RingConsumer<T>: QueueRing<T> {
    /// Remove the oldest item, waiting up to `timeout` for one.
    fn poll(&self, timeout: Duration) -> Option<T>;

    fn try_poll(&self) -> Option<T> {
        self.poll(Duration::ZERO)
    }

    /// Clone of the oldest item, left in place
    fn peek(&self) -> Option<T>
    where
        T: Clone;

    /// Drain everything currently queued into `sink`.
    ///
    /// The tail is published per chunk and once more on exit, also when `sink`
    /// fails. An item handed to a failing `sink` counts as consumed.
    fn deliver<D, C>(&self, sink: &mut D, context: &mut C) -> anyhow::Result<usize>
    where
        D: Deliver<T, C>,
        C: ?Sized;
}

/// Rings whose storage several ordered stages can consume in turn
pub trait StagedRing<T>: RingConsumer<T> {
    /// Number of consumer stages the counter group supports
    fn stages(&self) -> usize;

    /// Drain one stage.
    ///
    /// `head_index` is the counter bounding this stage (the ring head or the
    /// previous stage's tail) and `tail_index` this stage's own counter. Only the
    /// stage with `is_tail` set removes items; the others see them by reference.
    /// `next` is woken after each chunk.
    fn deliver_stage<D, C>(
        &self,
        sink: &mut D,
        context: &mut C,
        head_index: usize,
        tail_index: usize,
        next: &dyn WorkerWake,
        is_tail: bool,
    ) -> anyhow::Result<usize>
    where
        D: for<'a> Deliver<&'a T, C>,
        C: ?Sized;
}

/// Absolute end of a timed wait. `None` waits forever.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    pub(crate) fn remaining(&self) -> Duration {
        match self.0 {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.0.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub(crate) fn instant(&self) -> Option<Instant> {
        self.0
    }
}

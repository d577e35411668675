//! Multi-producer, multi-consumer bounded ring.
//!
//! Producers CAS the head and then publish the slot; consumers take the slot
//! and CAS the tail, writing the value back if another consumer won. Closing for
//! writes sets a flag in the head counter so no producer can reserve a position
//! afterwards.

use std::sync::Arc;
use std::time::Duration;

use super::blocker::{BasicBlocker, RingBlocker, ShutdownMode, WorkerWake};
use super::core::RingCore;
use super::counter::CounterGroup;
use super::storage::RingStorage;
use super::{Deliver, QueueRing, RingConsumer, RingProducer, StagedRing};
use crate::config::RingConfig;
use crate::constants::DELIVER_CHUNK;
use crate::error::Result;

pub struct FixedRing<T> {
    core: RingCore<T>,
}

impl<T> FixedRing<T> {
    /// Ring of `capacity` slots with a [`BasicBlocker`]
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_config(RingConfig::new(capacity)?)
    }

    pub fn with_config(config: RingConfig) -> Result<Self> {
        Self::with_blocker(config, Arc::new(BasicBlocker::new()))
    }

    pub fn with_blocker(config: RingConfig, blocker: Arc<dyn RingBlocker>) -> Result<Self> {
        let storage = RingStorage::new(config.capacity)?;
        Ok(Self::from_parts(storage, CounterGroup::new(config.counter_count(), 0), blocker))
    }

    /// Assemble a ring whose counters may start anywhere in the position domain
    pub(crate) fn from_parts(storage: RingStorage<T>, counters: CounterGroup, blocker: Arc<dyn RingBlocker>) -> Self {
        Self {
            core: RingCore::new(storage, counters, blocker),
        }
    }

    pub fn blocker(&self) -> &Arc<dyn RingBlocker> {
        self.core.blocker()
    }

    pub(crate) fn take_unread(&self) -> Option<T> {
        self.core.take_unread()
    }
}

impl<T> QueueRing<T> for FixedRing<T> {
    #[inline]
    fn capacity(&self) -> usize {
        self.core.capacity()
    }

    #[inline]
    fn head(&self) -> u64 {
        self.core.head()
    }

    #[inline]
    fn tail(&self) -> u64 {
        self.core.tail()
    }

    fn is_write_closed(&self) -> bool {
        self.core.is_write_closed()
    }

    fn close_write(&self) {
        self.core.close_write();
    }

    fn wake(&self) {
        self.core.blocker().wake();
    }

    fn shutdown(&self, mode: ShutdownMode) {
        self.core.shutdown(mode);
    }
}

impl<T> RingProducer<T> for FixedRing<T> {
    fn offer(&self, value: T, timeout: Duration) -> std::result::Result<(), T> {
        self.core.offer_shared(value, timeout)
    }
}

impl<T> RingConsumer<T> for FixedRing<T> {
    fn poll(&self, timeout: Duration) -> Option<T> {
        self.core.poll_shared(timeout)
    }

    fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.core.peek()
    }

    /// Bulk drain in chunks of 64. Must not run concurrently with another
    /// drain or with `poll` on the same ring.
    fn deliver<D, C>(&self, sink: &mut D, context: &mut C) -> anyhow::Result<usize>
    where
        D: Deliver<T, C>,
        C: ?Sized,
    {
        self.core.deliver(sink, context, DELIVER_CHUNK, false)
    }
}

impl<T: Send + Sync> StagedRing<T> for FixedRing<T> {
    fn stages(&self) -> usize {
        self.core.stages()
    }

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
        C: ?Sized,
    {
        self.core.deliver_stage(sink, context, head_index, tail_index, next, is_tail)
    }
}

impl<T> std::fmt::Debug for FixedRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedRing")
            .field("capacity", &self.capacity())
            .field("head", &self.head())
            .field("tail", &self.tail())
            .field("closed", &self.is_write_closed())
            .finish()
    }
}

//! Single-producer, multi-consumer ring.
//!
//! Offers skip the head CAS: the slot is stored lazily and the head is bumped
//! with a release increment. Exactly one producer is enforced by the type
//! system: the only way to offer is the [`SingleWriter`] handle, which is
//! neither `Clone` nor `Sync`.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use super::blocker::{BasicBlocker, RingBlocker, ShutdownMode, WorkerWake};
use super::core::RingCore;
use super::counter::CounterGroup;
use super::storage::RingStorage;
use super::{Deliver, QueueRing, RingConsumer, RingProducer, StagedRing};
use crate::config::RingConfig;
use crate::constants::DELIVER_CHUNK_LAZY;
use crate::error::Result;

/// Shared side of a single-writer ring: consumers and status
pub struct SingleWriterRing<T> {
    core: RingCore<T>,
}

/// The one producer of a [`SingleWriterRing`]
pub struct SingleWriter<T> {
    ring: Arc<SingleWriterRing<T>>,
    // Send but not Sync: `&SingleWriter` cannot be shared across threads
    _not_sync: PhantomData<Cell<()>>,
}

impl<T> SingleWriterRing<T> {
    /// Create the ring and its only producer handle
    pub fn new(capacity: usize) -> Result<(SingleWriter<T>, Arc<Self>)> {
        Self::with_config(RingConfig::new(capacity)?)
    }

    pub fn with_config(config: RingConfig) -> Result<(SingleWriter<T>, Arc<Self>)> {
        Self::with_blocker(config, Arc::new(BasicBlocker::new()))
    }

    pub fn with_blocker(config: RingConfig, blocker: Arc<dyn RingBlocker>) -> Result<(SingleWriter<T>, Arc<Self>)> {
        let storage = RingStorage::new(config.capacity)?;
        let ring = Arc::new(Self {
            core: RingCore::new(storage, CounterGroup::new(config.counter_count(), 0), blocker),
        });
        let writer = SingleWriter {
            ring: ring.clone(),
            _not_sync: PhantomData,
        };
        Ok((writer, ring))
    }
}

impl<T> SingleWriter<T> {
    /// Consumer/status side of the ring this writer feeds
    pub fn ring(&self) -> &Arc<SingleWriterRing<T>> {
        &self.ring
    }
}

impl<T> QueueRing<T> for SingleWriterRing<T> {
    fn capacity(&self) -> usize {
        self.core.capacity()
    }

    fn head(&self) -> u64 {
        self.core.head()
    }

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

impl<T> RingConsumer<T> for SingleWriterRing<T> {
    fn poll(&self, timeout: Duration) -> Option<T> {
        self.core.poll_shared(timeout)
    }

    fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.core.peek()
    }

    fn deliver<D, C>(&self, sink: &mut D, context: &mut C) -> anyhow::Result<usize>
    where
        D: Deliver<T, C>,
        C: ?Sized,
    {
        self.core.deliver(sink, context, DELIVER_CHUNK_LAZY, true)
    }
}

impl<T: Send + Sync> StagedRing<T> for SingleWriterRing<T> {
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

impl<T> QueueRing<T> for SingleWriter<T> {
    fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    fn head(&self) -> u64 {
        self.ring.head()
    }

    fn tail(&self) -> u64 {
        self.ring.tail()
    }

    fn is_write_closed(&self) -> bool {
        self.ring.is_write_closed()
    }

    fn close_write(&self) {
        self.ring.close_write();
    }

    fn wake(&self) {
        self.ring.wake();
    }

    fn shutdown(&self, mode: ShutdownMode) {
        self.ring.shutdown(mode);
    }
}

impl<T> RingProducer<T> for SingleWriter<T> {
    fn offer(&self, value: T, timeout: Duration) -> std::result::Result<(), T> {
        self.ring.core.offer_exclusive(value, timeout)
    }
}

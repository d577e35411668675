//! Wake-driven consumers over rings.
//!
//! A [`DeliverWorker`] drains a ring on an [`crate::Executor`] whenever it is
//! woken. [`DeliverQueue`] pairs one ring with one worker; [`Pipeline`] runs
//! several ordered stages over one shared ring.

pub mod pipeline;
pub mod worker;

pub use pipeline::{DeliverQueue, DeliverQueueBuilder, Pipeline};
pub use worker::DeliverWorker;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{ResizingConfig, RingConfig};
use crate::error::Result;
use crate::queue::blocker::{ShutdownMode, WorkerWake};
use crate::queue::{Deliver, QueueRing, RingConsumer, RingProducer, StagedRing};
use crate::thread::Executor;
use crate::{FixedRing, ResizingRing};

/// Ring behind a deliver queue: fixed when the initial capacity is the final
/// one, resizing otherwise
pub enum DeliverRing<T: Send + 'static> {
    Fixed(FixedRing<T>),
    Resizing(ResizingRing<T>),
}

impl<T: Send + 'static> DeliverRing<T> {
    pub(crate) fn build(
        initial: usize,
        capacity: usize,
        stages: usize,
        relocator: Option<Arc<dyn Executor>>,
    ) -> Result<Self> {
        if initial == capacity {
            let config = RingConfig::new(capacity)?.with_stages(stages)?;
            return Ok(Self::Fixed(FixedRing::with_config(config)?));
        }
        let config = ResizingConfig::new(initial, capacity)?.with_stages(stages)?;
        let ring = match relocator {
            Some(executor) => ResizingRing::with_executor(config, executor)?,
            None => ResizingRing::with_config(config)?,
        };
        Ok(Self::Resizing(ring))
    }

    pub fn is_resizing(&self) -> bool {
        matches!(self, Self::Resizing(_))
    }
}

macro_rules! dispatch {
    ($self:ident, $ring:ident => $body:expr) => {
        match $self {
            DeliverRing::Fixed($ring) => $body,
            DeliverRing::Resizing($ring) => $body,
        }
    };
}

impl<T: Send + 'static> QueueRing<T> for DeliverRing<T> {
    fn capacity(&self) -> usize {
        dispatch!(self, ring => ring.capacity())
    }

    fn head(&self) -> u64 {
        dispatch!(self, ring => ring.head())
    }

    fn tail(&self) -> u64 {
        dispatch!(self, ring => ring.tail())
    }

    fn size(&self) -> usize {
        dispatch!(self, ring => ring.size())
    }

    fn remaining_capacity(&self) -> usize {
        dispatch!(self, ring => ring.remaining_capacity())
    }

    fn is_write_closed(&self) -> bool {
        dispatch!(self, ring => ring.is_write_closed())
    }

    fn close_write(&self) {
        dispatch!(self, ring => ring.close_write())
    }

    fn wake(&self) {
        dispatch!(self, ring => ring.wake())
    }

    fn shutdown(&self, mode: ShutdownMode) {
        dispatch!(self, ring => ring.shutdown(mode))
    }
}

impl<T: Send + 'static> RingProducer<T> for DeliverRing<T> {
    fn offer(&self, value: T, timeout: Duration) -> std::result::Result<(), T> {
        dispatch!(self, ring => ring.offer(value, timeout))
    }
}

impl<T: Send + 'static> RingConsumer<T> for DeliverRing<T> {
    fn poll(&self, timeout: Duration) -> Option<T> {
        dispatch!(self, ring => ring.poll(timeout))
    }

    fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        dispatch!(self, ring => ring.peek())
    }

    fn deliver<D, C>(&self, sink: &mut D, context: &mut C) -> anyhow::Result<usize>
    where
        D: Deliver<T, C>,
        C: ?Sized,
    {
        dispatch!(self, ring => ring.deliver(sink, context))
    }
}

impl<T: Send + Sync + 'static> StagedRing<T> for DeliverRing<T> {
    fn stages(&self) -> usize {
        dispatch!(self, ring => ring.stages())
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
        dispatch!(self, ring => ring.deliver_stage(sink, context, head_index, tail_index, next, is_tail))
    }
}

impl<T: Send + 'static> std::fmt::Debug for DeliverRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        dispatch!(self, ring => std::fmt::Debug::fmt(ring, f))
    }
}

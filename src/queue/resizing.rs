//! Ring that grows while in use.
//!
//! Writers always offer into the current write queue and readers drain the
//! current read queue. Both are [`FixedRing`]s sharing one position domain: a
//! new ring's counters start at the old ring's head.
//!
//! Growth happens inside the blocker of a full ring. Instead of waiting, it
//! closes the ring for writes, allocates one four times larger (capped at the
//! maximum) and publishes it as the write queue. When the closed ring was not
//! being read yet, its items are moved over first. Readers switch to the write
//! queue once their ring is empty, under the same resize lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::ReentrantMutex;

use super::blocker::{BasicBlocker, RingBlocker, ShutdownMode, WorkerWake};
use super::counter::CounterGroup;
use super::fixed::FixedRing;
use super::storage::RingStorage;
use super::{Deadline, Deliver, QueueRing, RingConsumer, RingProducer, StagedRing};
use crate::config::ResizingConfig;
use crate::constants::RESIZE_FACTOR;
use crate::error::Result;
use crate::insights;
use crate::thread::Executor;

/// Wait budget for each offer made while relocating stranded items
const RELOCATE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ResizingRing<T: Send + 'static> {
    state: Arc<ResizeState<T>>,
}

struct ResizeState<T: Send + 'static> {
    write_queue: ArcSwap<FixedRing<T>>,
    read_queue: ArcSwap<FixedRing<T>>,
    /// Reentrant: migration offers into the next ring may consult its blocker
    resize_lock: ReentrantMutex<()>,
    blocker: Arc<dyn RingBlocker>,
    max_capacity: usize,
    stages: usize,
    relocator: Option<Arc<dyn Executor>>,
    closed: AtomicBool,
    resizes: AtomicU64,
    me: Weak<ResizeState<T>>,
}

impl<T: Send + 'static> ResizingRing<T> {
    pub fn new(min_capacity: usize, max_capacity: usize) -> Result<Self> {
        Self::with_config(ResizingConfig::new(min_capacity, max_capacity)?)
    }

    pub fn with_config(config: ResizingConfig) -> Result<Self> {
        Self::build(config, Arc::new(BasicBlocker::new()), None)
    }

    /// Ring whose stranded-item relocation runs on `executor` instead of a
    /// dedicated thread
    pub fn with_executor(config: ResizingConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        Self::build(config, Arc::new(BasicBlocker::new()), Some(executor))
    }

    pub fn with_blocker(
        config: ResizingConfig,
        blocker: Arc<dyn RingBlocker>,
        executor: Option<Arc<dyn Executor>>,
    ) -> Result<Self> {
        Self::build(config, blocker, executor)
    }

    fn build(
        config: ResizingConfig,
        blocker: Arc<dyn RingBlocker>,
        relocator: Option<Arc<dyn Executor>>,
    ) -> Result<Self> {
        // validate before the cyclic construction, which cannot fail
        let storage = RingStorage::new(config.min_capacity)?;

        let state = Arc::new_cyclic(|me: &Weak<ResizeState<T>>| {
            let first = create_queue(
                me,
                storage,
                CounterGroup::for_stages(config.stages, 0),
                config.max_capacity,
                &blocker,
            );
            ResizeState {
                write_queue: ArcSwap::new(first.clone()),
                read_queue: ArcSwap::new(first),
                resize_lock: ReentrantMutex::new(()),
                blocker,
                max_capacity: config.max_capacity,
                stages: config.stages,
                relocator,
                closed: AtomicBool::new(false),
                resizes: AtomicU64::new(0),
                me: me.clone(),
            }
        });

        Ok(Self { state })
    }

    /// Number of completed growth steps
    pub fn resize_count(&self) -> u64 {
        self.state.resizes.load(Ordering::Relaxed)
    }

    pub fn max_capacity(&self) -> usize {
        self.state.max_capacity
    }
}

/// Ring at `storage`'s capacity whose counters start at `counters`. Below the
/// maximum it gets a resizing blocker, at the maximum the base blocker.
fn create_queue<T: Send + 'static>(
    me: &Weak<ResizeState<T>>,
    storage: RingStorage<T>,
    counters: CounterGroup,
    max_capacity: usize,
    base: &Arc<dyn RingBlocker>,
) -> Arc<FixedRing<T>> {
    if storage.capacity() >= max_capacity {
        return Arc::new(FixedRing::from_parts(storage, counters, base.clone()));
    }

    Arc::new_cyclic(|queue: &Weak<FixedRing<T>>| {
        let blocker = Arc::new(ResizingBlocker {
            state: me.clone(),
            queue: queue.clone(),
            base: base.clone(),
        });
        FixedRing::from_parts(storage, counters, blocker)
    })
}

impl<T: Send + 'static> ResizeState<T> {
    /// Full-ring decision made in place of a producer wait.
    ///
    /// True when room appeared, false when the producer should re-read the
    /// write queue.
    fn resize_on_full(&self, queue: &Arc<FixedRing<T>>) -> bool {
        let _guard = self.resize_lock.lock();

        if queue.is_write_closed() {
            return false;
        }
        if queue.size() + 1 < queue.capacity() {
            return true;
        }

        let capacity = queue.capacity();
        if capacity >= self.max_capacity || self.closed.load(Ordering::Acquire) {
            return false;
        }

        let next_capacity = (capacity * RESIZE_FACTOR).min(self.max_capacity);
        let storage = match RingStorage::new(next_capacity) {
            Ok(storage) => storage,
            Err(err) => {
                tracing::error!(%err, next_capacity, "ring growth failed");
                return false;
            }
        };

        queue.close_write();
        let head = queue.head();
        let next = create_queue(
            &self.me,
            storage,
            CounterGroup::for_stages(self.stages, head),
            self.max_capacity,
            &self.blocker,
        );

        if !Arc::ptr_eq(queue, &self.read_queue.load()) {
            // nobody reads the closed ring yet: carry its items over
            while let Some(item) = queue.take_unread() {
                if let Err(item) = next.try_offer(item) {
                    self.relocate(item, queue.clone());
                    break;
                }
            }
        }

        self.write_queue.store(next);
        self.resizes.fetch_add(1, Ordering::Relaxed);
        insights::record_resize(capacity, next_capacity, head);
        false
    }

    /// Finish a migration that ran out of room, off the producer's thread.
    fn relocate(&self, item: T, from: Arc<FixedRing<T>>) {
        let Some(state) = self.me.upgrade() else {
            return;
        };
        tracing::warn!(capacity = from.capacity(), "relocating stranded items in background");

        let task = move || state.copy_queue(item, from);
        match &self.relocator {
            Some(executor) => {
                if let Err(err) = executor.execute(Box::new(task)) {
                    tracing::error!(%err, "relocation task rejected; stranded items dropped");
                }
            }
            None => {
                if let Err(err) = std::thread::Builder::new()
                    .name("ringflow-relocate".to_string())
                    .spawn(task)
                {
                    tracing::error!(%err, "relocation thread failed; stranded items dropped");
                }
            }
        }
    }

    fn copy_queue(&self, item: T, from: Arc<FixedRing<T>>) {
        if !self.offer_with_retry(item) {
            return;
        }
        while let Some(item) = from.take_unread() {
            if !self.offer_with_retry(item) {
                return;
            }
        }
    }

    fn offer_with_retry(&self, item: T) -> bool {
        match self.offer(item, RELOCATE_TIMEOUT) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!("relocated item dropped: ring closed or full");
                false
            }
        }
    }

    /// Offer to the current write queue, following resizes. Retries share
    /// one deadline.
    fn offer(&self, value: T, timeout: Duration) -> std::result::Result<(), T> {
        let deadline = Deadline::after(timeout);
        let mut value = value;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(value);
            }

            let queue = self.write_queue.load_full();
            match queue.offer(value, deadline.remaining()) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    if !queue.is_write_closed() {
                        return Err(rejected);
                    }
                    value = rejected;
                    if Arc::ptr_eq(&queue, &self.write_queue.load()) {
                        // a resize is publishing the next ring
                        drop(self.resize_lock.lock());
                    }
                }
            }
        }
    }

    /// Move the read pointer on once the read queue is drained and retired.
    ///
    /// True when `queue` is no longer the read queue, so the caller should
    /// retry against the new one.
    fn poll_resize(&self, queue: &Arc<FixedRing<T>>) -> bool {
        let _guard = self.resize_lock.lock();

        let read = self.read_queue.load_full();
        if !Arc::ptr_eq(queue, &read) {
            return true;
        }

        let write = self.write_queue.load_full();
        if Arc::ptr_eq(&read, &write) || !read.is_empty() {
            return false;
        }

        self.read_queue.store(write);
        self.blocker.offer_wake();
        self.blocker.poll_wake();
        true
    }
}

impl<T: Send + 'static> QueueRing<T> for ResizingRing<T> {
    fn capacity(&self) -> usize {
        self.state.write_queue.load().capacity()
    }

    fn head(&self) -> u64 {
        self.state.write_queue.load().head()
    }

    fn tail(&self) -> u64 {
        self.state.read_queue.load().tail()
    }

    /// Items in the read queue plus, mid-transition, the write queue
    fn size(&self) -> usize {
        let read = self.state.read_queue.load_full();
        let write = self.state.write_queue.load_full();
        if Arc::ptr_eq(&read, &write) {
            read.size()
        } else {
            read.size() + write.size()
        }
    }

    fn remaining_capacity(&self) -> usize {
        let write = self.state.write_queue.load();
        let growth = self.state.max_capacity.saturating_sub(write.capacity());
        write.remaining_capacity() + growth
    }

    fn is_write_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    fn close_write(&self) {
        self.state.closed.store(true, Ordering::Release);
        let _guard = self.state.resize_lock.lock();
        self.state.write_queue.load().close_write();
        self.state.blocker.wake_all();
    }

    fn wake(&self) {
        self.state.blocker.wake();
    }

    fn shutdown(&self, mode: ShutdownMode) {
        self.close_write();
        self.state.blocker.shutdown(mode);
    }
}

impl<T: Send + 'static> RingProducer<T> for ResizingRing<T> {
    fn offer(&self, value: T, timeout: Duration) -> std::result::Result<(), T> {
        self.state.offer(value, timeout)
    }
}

impl<T: Send + 'static> RingConsumer<T> for ResizingRing<T> {
    fn poll(&self, timeout: Duration) -> Option<T> {
        let deadline = Deadline::after(timeout);
        loop {
            let queue = self.state.read_queue.load_full();
            if let Some(value) = queue.poll(deadline.remaining()) {
                return Some(value);
            }
            if !self.state.poll_resize(&queue) {
                return None;
            }
        }
    }

    fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        loop {
            let queue = self.state.read_queue.load_full();
            if let Some(value) = queue.peek() {
                return Some(value);
            }
            if !self.state.poll_resize(&queue) {
                return None;
            }
        }
    }

    fn deliver<D, C>(&self, sink: &mut D, context: &mut C) -> anyhow::Result<usize>
    where
        D: Deliver<T, C>,
        C: ?Sized,
    {
        let mut delivered = 0;
        loop {
            let queue = self.state.read_queue.load_full();
            delivered += queue.deliver(sink, context)?;
            if !self.state.poll_resize(&queue) {
                return Ok(delivered);
            }
        }
    }
}

impl<T: Send + Sync + 'static> StagedRing<T> for ResizingRing<T> {
    fn stages(&self) -> usize {
        self.state.stages
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
        let mut delivered = 0;
        loop {
            let queue = self.state.read_queue.load_full();
            delivered += queue.deliver_stage(sink, context, head_index, tail_index, next, is_tail)?;
            if !is_tail || !self.state.poll_resize(&queue) {
                return Ok(delivered);
            }
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for ResizingRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResizingRing")
            .field("capacity", &self.capacity())
            .field("max_capacity", &self.state.max_capacity)
            .field("size", &self.size())
            .field("resizes", &self.resize_count())
            .finish()
    }
}

// ============================================================================
// Resizing blocker
// ============================================================================

/// Blocker of a ring below the maximum capacity: a full offer grows the ring
/// instead of waiting. Poll waits go to the shared base blocker.
struct ResizingBlocker<T: Send + 'static> {
    state: Weak<ResizeState<T>>,
    queue: Weak<FixedRing<T>>,
    base: Arc<dyn RingBlocker>,
}

impl<T: Send + 'static> RingBlocker for ResizingBlocker<T> {
    fn next_offer_sequence(&self) -> u64 {
        0
    }

    fn offer_wait(&self, _sequence: u64, _timeout: Duration) -> bool {
        match (self.state.upgrade(), self.queue.upgrade()) {
            (Some(state), Some(queue)) => state.resize_on_full(&queue),
            _ => false,
        }
    }

    fn offer_wake(&self) {}

    fn next_poll_sequence(&self) -> u64 {
        self.base.next_poll_sequence()
    }

    fn poll_wait(&self, sequence: u64, timeout: Duration) -> bool {
        self.base.poll_wait(sequence, timeout)
    }

    fn poll_wake(&self) {
        self.base.poll_wake();
    }

    fn wake(&self) {
        self.base.wake();
    }

    fn shutdown(&self, mode: ShutdownMode) {
        self.base.shutdown(mode);
    }

    fn is_shutdown(&self) -> bool {
        self.base.is_shutdown()
    }
}

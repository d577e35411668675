//! Core ring protocol shared by the fixed, single-writer and pipe variants.
//!
//! Producers reserve positions on the head counter, consumers advance the final
//! tail. Consumers never read past the counter just before the final tail, so a
//! ring built for several stages can still be polled safely: `poll` behaves as
//! the final stage.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::Backoff;

use super::blocker::{RingBlocker, ShutdownMode, WorkerWake};
use super::counter::{CounterGroup, PaddedCounter, CLOSED_BIT};
use super::storage::RingStorage;
use super::{Deadline, Deliver};
use crate::constants::{STAGE_CHUNK_MAX, STAGE_CHUNK_MIN};
use crate::error::RingError;
use crate::insights;

pub(crate) struct RingCore<T> {
    storage: RingStorage<T>,
    counters: CounterGroup,
    blocker: Arc<dyn RingBlocker>,
    capacity: u64,
}

impl<T> RingCore<T> {
    pub(crate) fn new(storage: RingStorage<T>, counters: CounterGroup, blocker: Arc<dyn RingBlocker>) -> Self {
        let capacity = storage.capacity() as u64;
        Self {
            storage,
            counters,
            blocker,
            capacity,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity as usize
    }

    #[inline]
    pub(crate) fn head(&self) -> u64 {
        self.counters.head().get()
    }

    #[inline]
    pub(crate) fn tail(&self) -> u64 {
        self.counters.tail().get()
    }

    #[inline]
    pub(crate) fn stages(&self) -> usize {
        self.counters.stages()
    }

    #[inline]
    pub(crate) fn blocker(&self) -> &Arc<dyn RingBlocker> {
        &self.blocker
    }

    /// Counter the final consumer drains up to
    #[inline]
    fn bound(&self) -> &PaddedCounter {
        // len >= 2 so the index is always present
        match self.counters.get(self.counters.len() - 2) {
            Some(counter) => counter,
            None => self.counters.head(),
        }
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        let tail = self.tail();
        let head = self.head();
        self.capacity <= (head + 1).saturating_sub(tail)
    }

    #[inline]
    fn is_drained(&self) -> bool {
        let tail = self.tail();
        tail >= self.bound().get()
    }

    #[inline]
    pub(crate) fn is_write_closed(&self) -> bool {
        self.counters.is_head_closed()
    }

    pub(crate) fn close_write(&self) {
        self.counters.close_head();
        self.blocker.offer_wake();
        self.blocker.poll_wake();
    }

    pub(crate) fn shutdown(&self, mode: ShutdownMode) {
        self.close_write();
        self.blocker.shutdown(mode);
    }

    // ========================================================================
    // Producers
    // ========================================================================

    /// Multi-producer offer: CAS on the head, then publish the slot.
    pub(crate) fn offer_shared(&self, value: T, timeout: Duration) -> Result<(), T> {
        let deadline = Deadline::after(timeout);
        let head = self.counters.head().raw();

        loop {
            let tail = self.tail();
            let raw = head.load(Ordering::Acquire);
            if raw & CLOSED_BIT != 0 {
                return Err(value);
            }

            let next = raw + 1;
            if self.capacity <= next.saturating_sub(tail) {
                if !self.wait_for_room(&deadline) {
                    return Err(value);
                }
                continue;
            }

            if head
                .compare_exchange_weak(raw, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.storage.set(raw, value);
                self.blocker.poll_wake();
                return Ok(());
            }
        }
    }

    /// Single-producer offer: no CAS, lazy slot store and head increment.
    ///
    /// The caller guarantees it is the only producer.
    pub(crate) fn offer_exclusive(&self, value: T, timeout: Duration) -> Result<(), T> {
        let deadline = Deadline::after(timeout);

        loop {
            if self.is_write_closed() {
                return Err(value);
            }

            let tail = self.tail();
            let head = self.head();
            if self.capacity <= (head + 1).saturating_sub(tail) {
                if !self.wait_for_room(&deadline) {
                    return Err(value);
                }
                continue;
            }

            self.storage.set_lazy(head, value);
            // fetch_add keeps a concurrently set closed flag intact
            self.counters.head().raw().fetch_add(1, Ordering::Release);
            self.blocker.poll_wake();
            return Ok(());
        }
    }

    /// Ticket, re-check, wait. False means give up the offer.
    fn wait_for_room(&self, deadline: &Deadline) -> bool {
        insights::record_backpressure(self.capacity());

        let sequence = self.blocker.next_offer_sequence();
        if self.is_write_closed() {
            return false;
        }
        if !self.is_full() {
            return true;
        }
        self.blocker.offer_wait(sequence, deadline.remaining())
    }

    // ========================================================================
    // Consumers
    // ========================================================================

    /// Multi-consumer poll: take the slot, then CAS the tail; on a lost race the
    /// value goes back into its slot.
    pub(crate) fn poll_shared(&self, timeout: Duration) -> Option<T> {
        let deadline = Deadline::after(timeout);
        let tail_counter = self.counters.tail();
        let backoff = Backoff::new();

        loop {
            let tail = tail_counter.get();
            let head = self.bound().get();
            if tail >= head {
                if !self.wait_for_item(&deadline) {
                    return None;
                }
                continue;
            }

            if let Some(value) = self.storage.poll_and_clear(tail) {
                if tail_counter.compare_and_set(tail, tail + 1) {
                    self.blocker.offer_wake();
                    return Some(value);
                }
                self.storage.set(tail, value);
            }
            backoff.spin();
        }
    }

    /// Single-consumer poll: no CAS on the tail.
    pub(crate) fn poll_exclusive(&self, timeout: Duration) -> Option<T> {
        let deadline = Deadline::after(timeout);
        let tail_counter = self.counters.tail();

        loop {
            let tail = tail_counter.get();
            let head = self.bound().get();
            if tail >= head {
                if !self.wait_for_item(&deadline) {
                    return None;
                }
                continue;
            }

            let value = self.storage.take_and_clear(tail);
            tail_counter.set_lazy(tail + 1);
            self.blocker.offer_wake();
            return Some(value);
        }
    }

    /// Empty ring: wake producers, then ticket, re-check, wait.
    fn wait_for_item(&self, deadline: &Deadline) -> bool {
        self.blocker.offer_wake();

        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return false;
        }

        let sequence = self.blocker.next_poll_sequence();
        if !self.is_drained() {
            return true;
        }
        if self.is_write_closed() {
            return false;
        }
        self.blocker.poll_wait(sequence, remaining)
    }

    /// Remove the oldest item ignoring stage counters.
    ///
    /// Only for a ring no consumer or stage has started on, such as a closed
    /// write queue being migrated under the resize lock.
    pub(crate) fn take_unread(&self) -> Option<T> {
        let tail = self.tail();
        if tail >= self.head() {
            return None;
        }
        let value = self.storage.take_and_clear(tail);
        for index in 1..self.counters.len() {
            if let Some(counter) = self.counters.get(index) {
                counter.set(tail + 1);
            }
        }
        Some(value)
    }

    pub(crate) fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let backoff = Backoff::new();
        loop {
            let tail = self.tail();
            if tail >= self.bound().get() {
                return None;
            }
            if let Some(value) = self.storage.clone_at(tail, || self.tail() == tail) {
                return Some(value);
            }
            backoff.snooze();
        }
    }

    /// Bulk drain for the single draining consumer.
    pub(crate) fn deliver<D, C>(&self, sink: &mut D, context: &mut C, chunk: u64, lazy: bool) -> anyhow::Result<usize>
    where
        D: Deliver<T, C>,
        C: ?Sized,
    {
        let tail_counter = self.counters.tail();
        let mut publisher = TailPublisher::new(tail_counter, &*self.blocker, lazy, true, None);
        let mut head = self.bound().get();
        let mut delivered = 0;

        while publisher.tail < head {
            let limit = head.min(publisher.tail + chunk);
            while publisher.tail < limit {
                let item = self.storage.take_and_clear(publisher.tail);
                publisher.tail += 1;
                delivered += 1;
                sink.deliver(item, context)?;
            }
            publisher.publish();
            head = self.bound().get();
        }

        Ok(delivered)
    }

    pub(crate) fn deliver_stage<D, C>(
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
        let last = self.counters.len() - 1;
        if head_index + 1 != tail_index || tail_index > last {
            return Err(RingError::config(format!(
                "stage counters {head_index}..{tail_index} do not fit a group of {} counters",
                self.counters.len()
            ))
            .into());
        }
        if is_tail != (tail_index == last) {
            return Err(RingError::config(format!("stage {tail_index} tail flag does not match its position")).into());
        }

        let (Some(head_counter), Some(tail_counter)) = (self.counters.get(head_index), self.counters.get(tail_index))
        else {
            return Err(RingError::unsupported("deliver_stage").into());
        };

        let mut publisher = TailPublisher::new(tail_counter, &*self.blocker, false, is_tail, Some(next));
        let mut head = head_counter.get();
        let mut chunk = STAGE_CHUNK_MIN;
        let mut delivered = 0;

        while publisher.tail < head {
            let limit = head.min(publisher.tail + chunk);
            while publisher.tail < limit {
                let pos = publisher.tail;
                if is_tail {
                    let item = self.storage.take_and_clear(pos);
                    publisher.tail += 1;
                    delivered += 1;
                    sink.deliver(&item, context)?;
                } else {
                    // SAFETY: the next stage is bounded by this stage's tail,
                    // which stays below `pos` until after the callback returns.
                    let item = unsafe { self.storage.spin_get(pos) };
                    publisher.tail += 1;
                    delivered += 1;
                    sink.deliver(item, context)?;
                }
            }
            publisher.publish();
            head = head_counter.get();
            chunk = (chunk * 2).min(STAGE_CHUNK_MAX);
        }

        Ok(delivered)
    }
}

/// Publishes a drain's local tail per chunk and on every exit path.
struct TailPublisher<'a> {
    counter: &'a PaddedCounter,
    blocker: &'a dyn RingBlocker,
    next: Option<&'a dyn WorkerWake>,
    published: u64,
    tail: u64,
    lazy: bool,
    wake_offer: bool,
}

impl<'a> TailPublisher<'a> {
    fn new(
        counter: &'a PaddedCounter,
        blocker: &'a dyn RingBlocker,
        lazy: bool,
        wake_offer: bool,
        next: Option<&'a dyn WorkerWake>,
    ) -> Self {
        let tail = counter.get();
        Self {
            counter,
            blocker,
            next,
            published: tail,
            tail,
            lazy,
            wake_offer,
        }
    }

    fn publish(&mut self) {
        if self.tail == self.published {
            return;
        }
        if self.lazy {
            self.counter.set_lazy(self.tail);
        } else {
            self.counter.set(self.tail);
        }
        self.published = self.tail;

        if self.wake_offer {
            self.blocker.offer_wake();
        }
        if let Some(next) = self.next {
            next.wake();
        }
    }
}

impl Drop for TailPublisher<'_> {
    fn drop(&mut self) {
        self.publish();
    }
}

//! Padded position counters and the counter group used for staged consumption.
//!
//! Index 0 of a group is the head (next allocation point). The last index is the
//! final tail. Indices in between are per-stage tails, so that
//! `head >= stage_1 >= ... >= tail` holds at all times.
//!
//! The head carries a write-closed flag in its top bit. A closed head can no
//! longer be advanced by a producer CAS, which makes closing a ring for writes
//! atomic with respect to in-flight offers.

use std::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert_eq;

/// Set on the head counter once the ring no longer accepts offers
pub(crate) const CLOSED_BIT: u64 = 1 << 63;

/// Strip the closed flag from a raw counter value
#[inline(always)]
pub(crate) fn position(raw: u64) -> u64 {
    raw & !CLOSED_BIT
}

/// A counter on its own pair of cache lines
#[repr(align(128))]
#[derive(Debug)]
pub struct PaddedCounter(AtomicU64);

const_assert_eq!(std::mem::align_of::<PaddedCounter>(), 128);

impl PaddedCounter {
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Position with the closed flag removed
    #[inline(always)]
    pub fn get(&self) -> u64 {
        position(self.0.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub(crate) fn raw(&self) -> &AtomicU64 {
        &self.0
    }

    #[inline(always)]
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn set_lazy(&self, value: u64) {
        self.0.store(value, Ordering::Release);
    }

    #[inline(always)]
    pub fn compare_and_set(&self, current: u64, new: u64) -> bool {
        self.0
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

/// Ordered counters shared by every stage consuming one ring
#[derive(Debug)]
pub struct CounterGroup {
    counters: Box<[PaddedCounter]>,
}

impl CounterGroup {
    /// `len` counters, all starting at `initial`. At least two are allocated.
    pub fn new(len: usize, initial: u64) -> Self {
        let counters = (0..len.max(2))
            .map(|_| PaddedCounter::new(initial))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { counters }
    }

    /// Group for `stages` consumers: one head plus one tail per stage.
    pub fn for_stages(stages: usize, initial: u64) -> Self {
        Self::new(stages + 1, initial)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Number of consumer stages the group supports
    #[inline]
    pub fn stages(&self) -> usize {
        self.counters.len() - 1
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&PaddedCounter> {
        self.counters.get(index)
    }

    #[inline(always)]
    pub fn head(&self) -> &PaddedCounter {
        &self.counters[0]
    }

    #[inline(always)]
    pub fn tail(&self) -> &PaddedCounter {
        &self.counters[self.counters.len() - 1]
    }

    /// Set the closed flag on the head. Returns false if it was already set.
    pub(crate) fn close_head(&self) -> bool {
        self.head().raw().fetch_or(CLOSED_BIT, Ordering::AcqRel) & CLOSED_BIT == 0
    }

    #[inline]
    pub(crate) fn is_head_closed(&self) -> bool {
        self.head().raw().load(Ordering::Acquire) & CLOSED_BIT != 0
    }
}

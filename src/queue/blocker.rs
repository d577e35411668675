//! Wait/wake coordination for rings.
//!
//! A waiter issues a ticket, re-checks its condition, then waits on the ticket.
//! A wake covers every ticket issued before it, so a wake landing between the
//! re-check and the wait makes the wait return at once.

use std::sync::atomic::{self, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// How a queue or pool shuts down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop accepting work, let what is queued drain
    Graceful,
    /// Stop accepting work and drop what is queued
    Immediate,
}

/// Pluggable wait/wake strategy for ring producers and consumers
pub trait RingBlocker: Send + Sync {
    /// Ticket for a producer about to wait on a full ring
    fn next_offer_sequence(&self) -> u64;

    /// Block until an offer wake covers `sequence`. False on timeout or shutdown.
    fn offer_wait(&self, sequence: u64, timeout: Duration) -> bool;

    /// Room may exist: release producers waiting on earlier tickets
    fn offer_wake(&self);

    fn next_poll_sequence(&self) -> u64;

    fn poll_wait(&self, sequence: u64, timeout: Duration) -> bool;

    fn poll_wake(&self);

    /// Notify the consumer side that work is available
    fn wake(&self) {
        self.poll_wake();
    }

    fn wake_all(&self) {
        self.offer_wake();
        self.poll_wake();
    }

    /// Wake every waiter; later waits return false immediately
    fn shutdown(&self, _mode: ShutdownMode) {}

    fn is_shutdown(&self) -> bool {
        false
    }
}

/// Downstream notification used between pipeline stages and drain workers
pub trait WorkerWake: Send + Sync {
    /// Signal new input. Returns true if this call scheduled the worker.
    fn wake(&self) -> bool;

    fn wake_all(&self) -> bool {
        self.wake()
    }
}

impl<W: WorkerWake + ?Sized> WorkerWake for Arc<W> {
    fn wake(&self) -> bool {
        (**self).wake()
    }

    fn wake_all(&self) -> bool {
        (**self).wake_all()
    }
}

/// Wake target that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWake;

impl WorkerWake for NullWake {
    fn wake(&self) -> bool {
        false
    }
}

// ============================================================================
// Basic blocker
// ============================================================================

/// One direction (offer or poll) of a ticket blocker
#[derive(Default)]
struct WaitSide {
    /// Last ticket issued
    issued: AtomicU64,
    /// Highest ticket released by a wake
    woken: AtomicU64,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl WaitSide {
    #[inline]
    fn next_sequence(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn wait(&self, sequence: u64, timeout: Duration, closed: &AtomicBool) -> bool {
        if self.woken.load(Ordering::SeqCst) >= sequence {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }

        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self.lock.lock();
        loop {
            if self.woken.load(Ordering::SeqCst) >= sequence {
                return true;
            }
            if closed.load(Ordering::Acquire) {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                        return self.woken.load(Ordering::SeqCst) >= sequence;
                    }
                }
                None => self.condvar.wait(&mut guard),
            }
        }
    }

    #[inline]
    fn wake(&self) {
        atomic::fence(Ordering::SeqCst);
        let issued = self.issued.load(Ordering::SeqCst);
        if self.woken.load(Ordering::SeqCst) >= issued {
            // no outstanding ticket
            return;
        }
        self.woken.fetch_max(issued, Ordering::SeqCst);
        drop(self.lock.lock());
        self.condvar.notify_all();
    }

    fn wake_closed(&self) {
        drop(self.lock.lock());
        self.condvar.notify_all();
    }
}

/// Condition-variable blocker with separate offer and poll tickets
#[derive(Default)]
pub struct BasicBlocker {
    offer: WaitSide,
    poll: WaitSide,
    closed: AtomicBool,
}

impl BasicBlocker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RingBlocker for BasicBlocker {
    #[inline]
    fn next_offer_sequence(&self) -> u64 {
        self.offer.next_sequence()
    }

    fn offer_wait(&self, sequence: u64, timeout: Duration) -> bool {
        self.offer.wait(sequence, timeout, &self.closed)
    }

    #[inline]
    fn offer_wake(&self) {
        self.offer.wake();
    }

    #[inline]
    fn next_poll_sequence(&self) -> u64 {
        self.poll.next_sequence()
    }

    fn poll_wait(&self, sequence: u64, timeout: Duration) -> bool {
        self.poll.wait(sequence, timeout, &self.closed)
    }

    #[inline]
    fn poll_wake(&self) {
        self.poll.wake();
    }

    fn shutdown(&self, _mode: ShutdownMode) {
        self.closed.store(true, Ordering::Release);
        self.offer.wake_closed();
        self.poll.wake_closed();
    }

    fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for BasicBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicBlocker")
            .field("offer_issued", &self.offer.issued.load(Ordering::Relaxed))
            .field("poll_issued", &self.poll.issued.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Blocker for best-effort rings: waits fail at once, wakes are no-ops
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBlocker;

impl RingBlocker for NullBlocker {
    fn next_offer_sequence(&self) -> u64 {
        0
    }

    fn offer_wait(&self, _sequence: u64, _timeout: Duration) -> bool {
        false
    }

    fn offer_wake(&self) {}

    fn next_poll_sequence(&self) -> u64 {
        0
    }

    fn poll_wait(&self, _sequence: u64, _timeout: Duration) -> bool {
        false
    }

    fn poll_wake(&self) {}
}

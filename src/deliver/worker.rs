//! Wake-driven drain worker.
//!
//! ```text
//!  IDLE --wake--> ACTIVE --drain done--> IDLE
//!                   |  ^
//!                 wake |
//!                   v  |
//!               ACTIVE_WAKE --drain done, relaunch--> ACTIVE
//! ```
//!
//! Any state moves to `CLOSED` on [`DeliverWorker::close`]. At most one drain
//! runs at a time.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::queue::blocker::WorkerWake;
use crate::thread::Executor;

const IDLE: u8 = 0;
const ACTIVE: u8 = 1;
const ACTIVE_WAKE: u8 = 2;
const CLOSED: u8 = 3;

type Drain = Box<dyn FnMut() -> anyhow::Result<usize> + Send>;

pub struct DeliverWorker {
    name: String,
    state: AtomicU8,
    executor: Arc<dyn Executor>,
    drain: Mutex<Drain>,
    delivered: AtomicU64,
    failures: AtomicU64,
    me: Weak<DeliverWorker>,
}

impl DeliverWorker {
    /// Worker running `drain` on `executor` after each wake.
    ///
    /// `drain` returns the number of items it handled.
    pub fn new<F>(name: impl Into<String>, executor: Arc<dyn Executor>, drain: F) -> Arc<Self>
    where
        F: FnMut() -> anyhow::Result<usize> + Send + 'static,
    {
        let name = name.into();
        Arc::new_cyclic(|me| Self {
            name,
            state: AtomicU8::new(IDLE),
            executor,
            drain: Mutex::new(Box::new(drain)),
            delivered: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            me: me.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_idle(&self) -> bool {
        self.state.load(Ordering::Acquire) == IDLE
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    /// Items handled over the worker's lifetime
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Drains that ended in an error
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Stop reacting to wakes. A drain in progress finishes.
    pub fn close(&self) {
        self.state.store(CLOSED, Ordering::Release);
    }

    fn launch(&self) -> bool {
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        match self.executor.execute(Box::new(move || me.run())) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(worker = %self.name, %err, "drain not scheduled; draining inline");
                self.run();
                false
            }
        }
    }

    fn run(&self) {
        loop {
            // woken before the drain starts: this drain covers that wake
            let _ = self
                .state
                .compare_exchange(ACTIVE_WAKE, ACTIVE, Ordering::AcqRel, Ordering::Acquire);

            self.drain_once();

            match self
                .state
                .compare_exchange(ACTIVE, IDLE, Ordering::AcqRel, Ordering::Acquire)
            {
                Err(ACTIVE_WAKE) => {
                    // woken mid-drain: give the thread back and go again
                    if self
                        .state
                        .compare_exchange(ACTIVE_WAKE, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                        || self.relaunch()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn relaunch(&self) -> bool {
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        self.executor.execute(Box::new(move || me.run())).is_ok()
    }

    fn drain_once(&self) {
        let mut drain = self.drain.lock();
        match (*drain)() {
            Ok(count) => {
                self.delivered.fetch_add(count as u64, Ordering::Relaxed);
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker = %self.name, error = %err, "deliver failed");
            }
        }
    }
}

impl WorkerWake for DeliverWorker {
    fn wake(&self) -> bool {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let next = match state {
                IDLE => ACTIVE,
                ACTIVE => ACTIVE_WAKE,
                _ => return false,
            };
            match self
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if next == ACTIVE => return self.launch(),
                Ok(_) => return false,
                Err(current) => state = current,
            }
        }
    }
}

impl std::fmt::Debug for DeliverWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            IDLE => "idle",
            ACTIVE => "active",
            ACTIVE_WAKE => "active-wake",
            _ => "closed",
        };
        f.debug_struct("DeliverWorker")
            .field("name", &self.name)
            .field("state", &state)
            .field("delivered", &self.delivered())
            .finish()
    }
}

//! Pool worker threads.
//!
//! A worker starts counted as idle. It polls the task ring (spinning briefly
//! when allowed), runs what it finds in a batch, and otherwise registers in the
//! idle ring and parks. A scheduler wakes it by moving its state from `IDLE` to
//! `WOKEN`; a worker retires by moving it from `IDLE` to `RETIRED`. Whichever
//! CAS wins decides, so a retiring thread is never handed a wake.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::sync::{Parker, Unparker};

use super::pool::PoolInner;
use super::{run_guarded, Task};
use crate::constants::WORKER_TASK_BATCH;
use crate::insights;

const RUNNING: u8 = 0;
const IDLE: u8 = 1;
const WOKEN: u8 = 2;
const RETIRED: u8 = 3;

/// Shared view of one worker thread
pub(crate) struct WorkerHandle {
    id: u64,
    state: AtomicU8,
    in_idle_ring: AtomicBool,
    unparker: Unparker,
    /// Start of the running task in nanoseconds since the pool epoch plus one;
    /// zero while no task runs
    task_start: AtomicU64,
    /// Executor the running task is attributed to; zero for plain pool tasks
    task_owner: AtomicU64,
}

impl WorkerHandle {
    pub(crate) fn new(id: u64, unparker: Unparker) -> Self {
        Self {
            id,
            state: AtomicU8::new(RUNNING),
            in_idle_ring: AtomicBool::new(false),
            unparker,
            task_start: AtomicU64::new(0),
            task_owner: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Hand this idle worker a wake. False if it is not idle.
    pub(crate) fn try_wake(&self) -> bool {
        if self
            .state
            .compare_exchange(IDLE, WOKEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.unparker.unpark();
            true
        } else {
            false
        }
    }

    /// Unpark without a wake, so the worker re-checks pool state
    pub(crate) fn nudge(&self) {
        self.unparker.unpark();
    }

    pub(crate) fn left_idle_ring(&self) {
        self.in_idle_ring.store(false, Ordering::SeqCst);
    }

    /// Mark as registered; false if already in the idle ring
    pub(crate) fn enter_idle_ring(&self) -> bool {
        !self.in_idle_ring.swap(true, Ordering::SeqCst)
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn begin_task(&self, owner: u64, now_nanos: u64) {
        self.task_owner.store(owner, Ordering::Release);
        self.task_start.store(now_nanos + 1, Ordering::Release);
    }

    pub(crate) fn end_task(&self) {
        self.task_start.store(0, Ordering::Release);
        self.task_owner.store(0, Ordering::Release);
    }

    /// Whether this worker runs a task of `owner` started before `cutoff_nanos`
    pub(crate) fn is_slow(&self, owner: u64, cutoff_nanos: u64) -> bool {
        let start = self.task_start.load(Ordering::Acquire);
        start != 0 && start - 1 < cutoff_nanos && self.task_owner.load(Ordering::Acquire) == owner
    }
}

thread_local! {
    static CURRENT: RefCell<Option<(Arc<PoolInner>, Arc<WorkerHandle>)>> = const { RefCell::new(None) };
}

/// Run `task` on the current pool thread attributed to executor `owner`.
///
/// Off a pool thread the task just runs. Panics are caught and logged.
pub(crate) fn run_attributed(owner: u64, task: Task) -> bool {
    let current = CURRENT.with(|current| current.borrow().clone());
    match current {
        Some((pool, handle)) => {
            handle.begin_task(owner, pool.now_nanos());
            let ok = run_guarded(task, pool.name());
            handle.begin_task(0, pool.now_nanos());
            ok
        }
        None => run_guarded(task, "detached"),
    }
}

/// Thread body of a pool worker
pub(crate) fn run(pool: Arc<PoolInner>, handle: Arc<WorkerHandle>, parker: Parker) {
    let launcher = pool.launcher();
    launcher.on_thread_begin();
    insights::record_thread(pool.name(), handle.id(), "start");
    CURRENT.with(|current| *current.borrow_mut() = Some((pool.clone(), handle.clone())));

    let mut is_wake = false;
    loop {
        // counted idle here
        if let Some(task) = pool.poll_task(is_wake) {
            launcher.on_idle_end();
            run_batch(&pool, &handle, task);
            launcher.on_idle_begin();
            is_wake = false;
            continue;
        }
        is_wake = false;

        if pool.is_closed() || launcher.is_idle_overflow() {
            break;
        }

        match park_idle(&pool, &handle, &parker) {
            Parked::Woken => is_wake = true,
            Parked::Recheck => {}
            Parked::Retired => break,
        }
    }

    launcher.on_idle_end();
    CURRENT.with(|current| *current.borrow_mut() = None);
    pool.unregister(handle.id());
    insights::record_thread(pool.name(), handle.id(), "retire");
    launcher.on_thread_end();
}

fn run_batch(pool: &PoolInner, handle: &WorkerHandle, first: Task) {
    let mut task = first;
    for _ in 0..WORKER_TASK_BATCH {
        handle.begin_task(0, pool.now_nanos());
        run_guarded(task, pool.name());
        handle.end_task();

        match pool.take_task() {
            Some(next) => task = next,
            None => return,
        }
    }
    // batch exhausted: run the last one taken, then go back through the idle path
    handle.begin_task(0, pool.now_nanos());
    run_guarded(task, pool.name());
    handle.end_task();
}

enum Parked {
    Woken,
    Recheck,
    Retired,
}

fn park_idle(pool: &PoolInner, handle: &Arc<WorkerHandle>, parker: &Parker) -> Parked {
    handle.state.store(IDLE, Ordering::SeqCst);
    pool.register_idle(handle);

    // a task may have landed before the registration became visible
    if (pool.has_tasks() || pool.is_closed()) && handle.transition(IDLE, RUNNING) {
        return Parked::Recheck;
    }

    let idle_timeout = pool.idle_timeout();
    let mut idle_since = Instant::now();
    loop {
        match handle.state.load(Ordering::Acquire) {
            WOKEN => {
                handle.state.store(RUNNING, Ordering::Release);
                return Parked::Woken;
            }
            RUNNING => return Parked::Recheck,
            _ => {}
        }

        if pool.is_closed() {
            if handle.transition(IDLE, RUNNING) {
                return Parked::Recheck;
            }
            continue;
        }

        let waited = idle_since.elapsed();
        if waited >= idle_timeout {
            if pool.launcher().is_idle_expire() {
                if handle.transition(IDLE, RETIRED) {
                    return Parked::Retired;
                }
                continue;
            }
            idle_since = Instant::now();
        }

        tracing::trace!(id = handle.id(), "worker parked");
        parker.park_timeout(idle_timeout.saturating_sub(waited).max(Duration::from_millis(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_and_retire_are_exclusive() {
        let parker = Parker::new();
        let handle = WorkerHandle::new(1, parker.unparker().clone());
        assert!(!handle.try_wake());

        handle.state.store(IDLE, Ordering::SeqCst);
        assert!(handle.try_wake());
        assert!(!handle.transition(IDLE, RETIRED));

        handle.state.store(IDLE, Ordering::SeqCst);
        assert!(handle.transition(IDLE, RETIRED));
        assert!(!handle.try_wake());
    }

    #[test]
    fn test_slow_detection() {
        let parker = Parker::new();
        let handle = WorkerHandle::new(1, parker.unparker().clone());
        assert!(!handle.is_slow(7, 1_000));
        handle.begin_task(7, 100);
        assert!(handle.is_slow(7, 1_000));
        assert!(!handle.is_slow(8, 1_000));
        assert!(!handle.is_slow(7, 50));
        handle.end_task();
        assert!(!handle.is_slow(7, 1_000));
    }

    #[test]
    fn test_run_attributed_off_pool() {
        assert!(run_attributed(3, Box::new(|| {})));
        assert!(!run_attributed(3, Box::new(|| panic!("off pool"))));
    }
}

//! Ring plus drain workers, assembled.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use super::worker::DeliverWorker;
use super::DeliverRing;
use crate::constants::{DEFAULT_DELIVER_CAPACITY, DEFAULT_DELIVER_INITIAL};
use crate::error::{Result, RingError};
use crate::queue::blocker::{ShutdownMode, WorkerWake};
use crate::queue::{Deliver, QueueRing, RingConsumer, RingProducer, StagedRing};
use crate::thread::Executor;

/// Per-stage callback of a [`Pipeline`]. Items are seen by reference.
pub type StageSink<T> = Box<dyn for<'a> FnMut(&'a T, &mut ()) -> anyhow::Result<()> + Send>;

/// Builder for [`DeliverQueue`] and [`Pipeline`].
///
/// The ring starts at `initial` slots and grows up to `capacity`; with equal
/// values it is a fixed ring.
#[derive(Debug, Clone)]
pub struct DeliverQueueBuilder {
    name: String,
    initial: usize,
    capacity: usize,
}

impl Default for DeliverQueueBuilder {
    fn default() -> Self {
        Self {
            name: "deliver".to_string(),
            initial: DEFAULT_DELIVER_INITIAL,
            capacity: DEFAULT_DELIVER_CAPACITY,
        }
    }
}

impl DeliverQueueBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_initial(mut self, initial: usize) -> Self {
        self.initial = initial;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Single consumer queue: `sink` receives every item on `executor`
    pub fn build<T, D>(self, executor: Arc<dyn Executor>, mut sink: D) -> Result<DeliverQueue<T>>
    where
        T: Send + 'static,
        D: Deliver<T> + Send + 'static,
    {
        let ring = Arc::new(DeliverRing::build(
            self.initial,
            self.capacity,
            1,
            Some(executor.clone()),
        )?);

        let drain_ring = ring.clone();
        let worker = DeliverWorker::new(self.name, executor, move || {
            drain_ring.deliver(&mut sink, &mut ())
        });
        Ok(DeliverQueue { ring, worker })
    }

    /// Ordered stages over one ring. Stage `i` sees an item only after stage
    /// `i - 1` finished with it; only the last stage removes items.
    pub fn build_pipeline<T>(
        self,
        executor: Arc<dyn Executor>,
        stages: Vec<StageSink<T>>,
    ) -> Result<Pipeline<T>>
    where
        T: Send + Sync + 'static,
    {
        if stages.is_empty() {
            return Err(RingError::config("a pipeline needs at least one stage"));
        }
        let count = stages.len();
        let ring = Arc::new(DeliverRing::build(
            self.initial,
            self.capacity,
            count,
            Some(executor.clone()),
        )?);

        let links: Arc<OnceLock<Vec<Weak<DeliverWorker>>>> = Arc::new(OnceLock::new());
        let mut workers = Vec::with_capacity(count);
        for (index, mut sink) in stages.into_iter().enumerate() {
            let is_tail = index + 1 == count;
            let stage_ring = ring.clone();
            let next = StageLink {
                links: links.clone(),
                index: if is_tail { 0 } else { index + 1 },
            };
            let first = StageLink {
                links: links.clone(),
                index: 0,
            };

            let drain = move || -> anyhow::Result<usize> {
                let delivered =
                    stage_ring.deliver_stage(&mut sink, &mut (), index, index + 1, &next, is_tail)?;
                // a resize may leave items the first stage has not seen yet
                if is_tail && !stage_ring.is_empty() {
                    first.wake();
                }
                Ok(delivered)
            };
            workers.push(DeliverWorker::new(
                format!("{}-stage-{}", self.name, index),
                executor.clone(),
                drain,
            ));
        }
        let _ = links.set(workers.iter().map(Arc::downgrade).collect());

        Ok(Pipeline { ring, workers })
    }
}

/// Wakes the stage at `index` once the pipeline is assembled
struct StageLink {
    links: Arc<OnceLock<Vec<Weak<DeliverWorker>>>>,
    index: usize,
}

impl WorkerWake for StageLink {
    fn wake(&self) -> bool {
        self.links
            .get()
            .and_then(|links| links.get(self.index))
            .and_then(Weak::upgrade)
            .is_some_and(|worker| worker.wake())
    }
}

/// Ring drained by one [`DeliverWorker`]
pub struct DeliverQueue<T: Send + 'static> {
    ring: Arc<DeliverRing<T>>,
    worker: Arc<DeliverWorker>,
}

impl<T: Send + 'static> DeliverQueue<T> {
    pub fn builder(name: impl Into<String>) -> DeliverQueueBuilder {
        DeliverQueueBuilder::new(name)
    }

    /// Enqueue and wake the worker. The value comes back when the ring stayed
    /// full for `timeout` or is closed.
    pub fn offer(&self, value: T, timeout: Duration) -> std::result::Result<(), T> {
        self.ring.offer(value, timeout)?;
        self.worker.wake();
        Ok(())
    }

    pub fn try_offer(&self, value: T) -> std::result::Result<(), T> {
        self.offer(value, Duration::ZERO)
    }

    pub fn ring(&self) -> &DeliverRing<T> {
        &self.ring
    }

    pub fn worker(&self) -> &Arc<DeliverWorker> {
        &self.worker
    }

    pub fn size(&self) -> usize {
        self.ring.size()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// `Graceful` stops offers and lets the worker drain what is queued;
    /// `Immediate` also stops the worker.
    pub fn shutdown(&self, mode: ShutdownMode) {
        match mode {
            ShutdownMode::Graceful => {
                self.ring.close_write();
                self.worker.wake();
            }
            ShutdownMode::Immediate => {
                self.worker.close();
                self.ring.shutdown(mode);
            }
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for DeliverQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliverQueue")
            .field("ring", &self.ring)
            .field("worker", &self.worker)
            .finish()
    }
}

/// Ring consumed in order by a chain of stage workers
pub struct Pipeline<T: Send + 'static> {
    ring: Arc<DeliverRing<T>>,
    workers: Vec<Arc<DeliverWorker>>,
}

impl<T: Send + Sync + 'static> Pipeline<T> {
    /// Enqueue and wake the first stage
    pub fn offer(&self, value: T, timeout: Duration) -> std::result::Result<(), T> {
        self.ring.offer(value, timeout)?;
        if let Some(first) = self.workers.first() {
            first.wake();
        }
        Ok(())
    }

    pub fn try_offer(&self, value: T) -> std::result::Result<(), T> {
        self.offer(value, Duration::ZERO)
    }

    pub fn ring(&self) -> &DeliverRing<T> {
        &self.ring
    }

    pub fn stages(&self) -> &[Arc<DeliverWorker>] {
        &self.workers
    }

    pub fn size(&self) -> usize {
        self.ring.size()
    }

    pub fn shutdown(&self, mode: ShutdownMode) {
        match mode {
            ShutdownMode::Graceful => {
                self.ring.close_write();
                if let Some(first) = self.workers.first() {
                    first.wake();
                }
            }
            ShutdownMode::Immediate => {
                for worker in &self.workers {
                    worker.close();
                }
                self.ring.shutdown(mode);
            }
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("ring", &self.ring)
            .field("stages", &self.workers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::thread::pool::ThreadPool;
    use parking_lot::Mutex;
    use std::time::Instant;

    fn pool(name: &str) -> ThreadPool {
        ThreadPool::new(
            PoolConfig::new(name)
                .with_thread_max(8)
                .with_idle_min(2)
                .with_idle_max(8)
                .with_idle_ring_capacity(64)
                .with_task_queue_capacity(1024),
        )
        .unwrap()
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn test_builder_picks_ring() {
        let pool = pool("builder");
        let executor: Arc<dyn Executor> = Arc::new(pool.clone());
        let fixed = DeliverQueueBuilder::new("fixed")
            .with_initial(64)
            .with_capacity(64)
            .build(executor.clone(), |_: u32, _: &mut ()| -> anyhow::Result<()> { Ok(()) })
            .unwrap();
        assert!(!fixed.ring().is_resizing());

        let resizing = DeliverQueue::<u32>::builder("resizing")
            .build(executor.clone(), |_: u32, _: &mut ()| -> anyhow::Result<()> { Ok(()) })
            .unwrap();
        assert!(resizing.ring().is_resizing());
        assert_eq!(resizing.ring().capacity(), DEFAULT_DELIVER_INITIAL);

        let bad = DeliverQueueBuilder::new("bad")
            .with_initial(128)
            .with_capacity(64)
            .build(executor.clone(), |_: u32, _: &mut ()| -> anyhow::Result<()> { Ok(()) });
        assert!(bad.is_err());
        assert!(DeliverQueueBuilder::new("empty")
            .build_pipeline::<u32>(executor, Vec::new())
            .is_err());

        pool.shutdown(ShutdownMode::Graceful);
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_deliver_queue_delivers_in_order() {
        let pool = pool("deliver-queue");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let queue = DeliverQueue::<u64>::builder("orders")
            .with_initial(4)
            .with_capacity(256)
            .build(Arc::new(pool.clone()), move |item: u64, _: &mut ()| -> anyhow::Result<()> {
                sink_seen.lock().push(item);
                Ok(())
            })
            .unwrap();

        for i in 0..200u64 {
            queue.offer(i, Duration::from_secs(1)).unwrap();
        }
        assert!(wait_until(Duration::from_secs(10), || seen.lock().len() == 200));
        assert_eq!(*seen.lock(), (0..200).collect::<Vec<_>>());
        assert!(wait_until(Duration::from_secs(5), || queue.is_empty()));

        queue.shutdown(ShutdownMode::Graceful);
        assert!(queue.try_offer(999).is_err());
        pool.shutdown(ShutdownMode::Graceful);
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_failing_sink_does_not_stall_queue() {
        let pool = pool("failing-sink");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let queue = DeliverQueue::<u64>::builder("flaky")
            .with_initial(64)
            .with_capacity(64)
            .build(Arc::new(pool.clone()), move |item: u64, _: &mut ()| -> anyhow::Result<()> {
                if item == 3 {
                    anyhow::bail!("item {item} rejected");
                }
                sink_seen.lock().push(item);
                Ok(())
            })
            .unwrap();

        for i in 0..10u64 {
            queue.offer(i, Duration::from_secs(1)).unwrap();
        }
        assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 9));
        assert!(!seen.lock().contains(&3));
        assert!(queue.worker().failures() >= 1);

        pool.shutdown(ShutdownMode::Graceful);
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_pipeline_stages_see_every_item_in_order() {
        let pool = pool("pipeline");
        let logs: Vec<Arc<Mutex<Vec<u64>>>> = (0..3).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();
        let stages: Vec<StageSink<u64>> = logs
            .iter()
            .map(|log| {
                let log = log.clone();
                Box::new(move |item: &u64, _: &mut ()| -> anyhow::Result<()> {
                    log.lock().push(*item);
                    Ok(())
                }) as StageSink<u64>
            })
            .collect();

        let pipeline = DeliverQueueBuilder::new("stages")
            .with_initial(8)
            .with_capacity(1024)
            .build_pipeline(Arc::new(pool.clone()), stages)
            .unwrap();
        assert_eq!(pipeline.stages().len(), 3);

        for i in 0..500u64 {
            pipeline.offer(i, Duration::from_secs(1)).unwrap();
        }
        assert!(wait_until(Duration::from_secs(10), || logs[2].lock().len() == 500));
        let expected: Vec<u64> = (0..500).collect();
        for log in &logs {
            assert_eq!(*log.lock(), expected);
        }
        assert!(wait_until(Duration::from_secs(5), || pipeline.size() == 0));

        pipeline.shutdown(ShutdownMode::Immediate);
        pool.shutdown(ShutdownMode::Graceful);
        assert!(pool.await_termination(Duration::from_secs(5)));
    }
}

//! One producer, one consumer ring with lazy stores on both sides.
//!
//! [`PipeRing::new`] hands out a [`PipeWriter`] and a [`PipeReader`]. Neither
//! handle is `Clone` or `Sync`, so each end has exactly one user at a time.
//! Staged delivery is not available on a pipe.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use super::blocker::{BasicBlocker, ShutdownMode};
use super::core::RingCore;
use super::counter::CounterGroup;
use super::storage::RingStorage;
use super::{Deliver, QueueRing, RingConsumer, RingProducer};
use crate::constants::DELIVER_CHUNK_LAZY;
use crate::error::Result;

/// Storage and counters shared by the two ends of a pipe
pub struct PipeRing<T> {
    core: RingCore<T>,
}

pub struct PipeWriter<T> {
    pipe: Arc<PipeRing<T>>,
    _not_sync: PhantomData<Cell<()>>,
}

pub struct PipeReader<T> {
    pipe: Arc<PipeRing<T>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T> PipeRing<T> {
    /// Create a pipe of `capacity` slots with its own [`BasicBlocker`]
    #[allow(clippy::new_ret_no_self)]
    pub fn new(capacity: usize) -> Result<(PipeWriter<T>, PipeReader<T>)> {
        let storage = RingStorage::new(capacity)?;
        let pipe = Arc::new(Self {
            core: RingCore::new(storage, CounterGroup::new(2, 0), Arc::new(BasicBlocker::new())),
        });

        let writer = PipeWriter {
            pipe: pipe.clone(),
            _not_sync: PhantomData,
        };
        let reader = PipeReader {
            pipe,
            _not_sync: PhantomData,
        };
        Ok((writer, reader))
    }
}

macro_rules! pipe_queue_ring {
    ($handle:ident) => {
        impl<T> QueueRing<T> for $handle<T> {
            fn capacity(&self) -> usize {
                self.pipe.core.capacity()
            }

            fn head(&self) -> u64 {
                self.pipe.core.head()
            }

            fn tail(&self) -> u64 {
                self.pipe.core.tail()
            }

            fn is_write_closed(&self) -> bool {
                self.pipe.core.is_write_closed()
            }

            fn close_write(&self) {
                self.pipe.core.close_write();
            }

            fn wake(&self) {
                self.pipe.core.blocker().wake();
            }

            fn shutdown(&self, mode: ShutdownMode) {
                self.pipe.core.shutdown(mode);
            }
        }
    };
}

pipe_queue_ring!(PipeWriter);
pipe_queue_ring!(PipeReader);

impl<T> RingProducer<T> for PipeWriter<T> {
    fn offer(&self, value: T, timeout: Duration) -> std::result::Result<(), T> {
        self.pipe.core.offer_exclusive(value, timeout)
    }
}

impl<T> RingConsumer<T> for PipeReader<T> {
    fn poll(&self, timeout: Duration) -> Option<T> {
        self.pipe.core.poll_exclusive(timeout)
    }

    fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.pipe.core.peek()
    }

    fn deliver<D, C>(&self, sink: &mut D, context: &mut C) -> anyhow::Result<usize>
    where
        D: Deliver<T, C>,
        C: ?Sized,
    {
        self.pipe.core.deliver(sink, context, DELIVER_CHUNK_LAZY, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_pipe_basic() {
        let (writer, reader) = PipeRing::new(4).unwrap();
        writer.try_offer(1u8).unwrap();
        writer.try_offer(2).unwrap();
        writer.try_offer(3).unwrap();
        assert_eq!(writer.try_offer(4), Err(4));
        assert_eq!(reader.size(), 3);
        assert_eq!(reader.peek(), Some(1));
        assert_eq!(reader.try_poll(), Some(1));
        assert_eq!(reader.try_poll(), Some(2));
        assert_eq!(reader.try_poll(), Some(3));
        assert_eq!(reader.try_poll(), None);
    }

    #[test]
    fn test_pipe_invalid_capacity() {
        assert!(PipeRing::<u8>::new(3).is_err());
    }

    #[test]
    fn test_pipe_across_threads() {
        const COUNT: u64 = 100_000;
        let (writer, reader) = PipeRing::new(256).unwrap();

        let producer = thread::spawn(move || {
            for i in 0..COUNT {
                let mut value = i;
                while let Err(v) = writer.offer(value, Duration::from_millis(5)) {
                    value = v;
                }
            }
            writer.close_write();
        });

        let consumer = thread::spawn(move || {
            let mut expected = 0u64;
            let mut sink = |item: u64, expected: &mut u64| -> anyhow::Result<()> {
                anyhow::ensure!(item == *expected, "expected {} got {}", expected, item);
                *expected += 1;
                Ok(())
            };
            loop {
                reader.deliver(&mut sink, &mut expected).unwrap();
                if reader.is_write_closed() && reader.is_empty() {
                    break;
                }
                if let Some(item) = reader.poll(Duration::from_millis(10)) {
                    sink(item, &mut expected).unwrap();
                }
            }
            expected
        });

        producer.join().unwrap();
        assert_eq!(consumer.join().unwrap(), COUNT, "Count mismatch - data loss detected!");
    }
}

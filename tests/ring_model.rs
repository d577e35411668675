//! Property tests: single-threaded operation sequences against a `VecDeque`
//! model.

use std::collections::VecDeque;

use proptest::prelude::*;
use ringflow::{FixedRing, PipeRing, QueueRing, ResizingRing, RingConsumer, RingProducer, SingleWriterRing};

#[derive(Debug, Clone)]
enum Op {
    Offer(u32),
    Poll,
    Peek,
    Drain,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => any::<u32>().prop_map(Op::Offer),
        3 => Just(Op::Poll),
        1 => Just(Op::Peek),
        1 => Just(Op::Drain),
    ]
}

fn arb_capacity() -> impl Strategy<Value = usize> {
    (1u32..7).prop_map(|shift| 1usize << shift)
}

/// Apply `ops` to a ring whose offers are accepted while fewer than `limit`
/// items are queued.
fn check_bounded<P, C>(producer: &P, consumer: &C, limit: usize, ops: &[Op]) -> Result<(), TestCaseError>
where
    P: RingProducer<u32>,
    C: RingConsumer<u32>,
{
    let mut model = VecDeque::new();
    for op in ops {
        match op {
            Op::Offer(value) => {
                let accepted = producer.try_offer(*value).is_ok();
                prop_assert_eq!(accepted, model.len() < limit);
                if accepted {
                    model.push_back(*value);
                }
            }
            Op::Poll => prop_assert_eq!(consumer.try_poll(), model.pop_front()),
            Op::Peek => prop_assert_eq!(consumer.peek(), model.front().copied()),
            Op::Drain => {
                let mut drained = Vec::new();
                let count = consumer
                    .deliver(
                        &mut |value: u32, out: &mut Vec<u32>| -> anyhow::Result<()> {
                            out.push(value);
                            Ok(())
                        },
                        &mut drained,
                    )
                    .map_err(|err| TestCaseError::fail(err.to_string()))?;
                prop_assert_eq!(count, drained.len());
                prop_assert_eq!(drained, model.drain(..).collect::<Vec<_>>());
            }
        }
        prop_assert_eq!(consumer.size(), model.len());
        prop_assert_eq!(consumer.is_empty(), model.is_empty());
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn fixed_ring_matches_model(capacity in arb_capacity(), ops in prop::collection::vec(arb_op(), 1..200)) {
        let ring = FixedRing::new(capacity).unwrap();
        check_bounded(&ring, &ring, capacity - 1, &ops)?;
    }

    #[test]
    fn single_writer_ring_matches_model(capacity in arb_capacity(), ops in prop::collection::vec(arb_op(), 1..200)) {
        let (writer, ring) = SingleWriterRing::new(capacity).unwrap();
        check_bounded(&writer, &*ring, capacity - 1, &ops)?;
    }

    #[test]
    fn pipe_ring_matches_model(capacity in arb_capacity(), ops in prop::collection::vec(arb_op(), 1..200)) {
        let (writer, reader) = PipeRing::new(capacity).unwrap();
        check_bounded(&writer, &reader, capacity - 1, &ops)?;
    }

    /// Growth keeps FIFO order; offers only fail once the maximum is in use.
    #[test]
    fn resizing_ring_keeps_order(ops in prop::collection::vec(arb_op(), 1..400)) {
        const MAX: usize = 64;
        let ring = ResizingRing::new(2, MAX).unwrap();
        let mut model = VecDeque::new();
        for op in &ops {
            match op {
                Op::Offer(value) => {
                    if ring.try_offer(*value).is_ok() {
                        model.push_back(*value);
                    } else {
                        prop_assert_eq!(ring.capacity(), MAX);
                        prop_assert!(model.len() >= MAX - 1);
                    }
                }
                Op::Poll => prop_assert_eq!(ring.try_poll(), model.pop_front()),
                Op::Peek => prop_assert_eq!(ring.peek(), model.front().copied()),
                Op::Drain => {
                    let mut drained = Vec::new();
                    ring.deliver(
                        &mut |value: u32, out: &mut Vec<u32>| -> anyhow::Result<()> {
                            out.push(value);
                            Ok(())
                        },
                        &mut drained,
                    )
                    .map_err(|err| TestCaseError::fail(err.to_string()))?;
                    prop_assert_eq!(drained, model.drain(..).collect::<Vec<_>>());
                }
            }
            prop_assert_eq!(ring.size(), model.len());
            prop_assert!(ring.capacity() <= MAX);
        }
    }
}

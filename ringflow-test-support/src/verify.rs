//! Ordering and exactly-once verification for ring traffic.
//!
//! Producers tag every item with [`encode`]: the producer id in the high bits
//! and a per-producer sequence in the low 40 bits.

use std::sync::atomic::{AtomicU64, Ordering};

const SEQUENCE_BITS: u32 = 40;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

pub fn encode(producer: usize, sequence: u64) -> u64 {
    ((producer as u64) << SEQUENCE_BITS) | (sequence & SEQUENCE_MASK)
}

pub fn decode(value: u64) -> (usize, u64) {
    ((value >> SEQUENCE_BITS) as usize, value & SEQUENCE_MASK)
}

/// Checks that one consumer sees each producer's items in increasing order.
///
/// Gaps are fine: other consumers take the missing items.
#[derive(Debug, Clone)]
pub struct SequenceChecker {
    next: Vec<u64>,
    errors: u64,
    checked: u64,
}

impl SequenceChecker {
    pub fn new(producers: usize) -> Self {
        Self {
            next: vec![0; producers],
            errors: 0,
            checked: 0,
        }
    }

    /// Record `value`; false when it arrived out of order or is malformed
    pub fn check(&mut self, value: u64) -> bool {
        self.checked += 1;
        let (producer, sequence) = decode(value);
        let Some(next) = self.next.get_mut(producer) else {
            self.errors += 1;
            return false;
        };
        if sequence < *next {
            self.errors += 1;
            return false;
        }
        *next = sequence + 1;
        true
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn checked(&self) -> u64 {
        self.checked
    }
}

/// Bitmap of delivered items shared by all consumers
#[derive(Debug)]
pub struct ExactlyOnce {
    per_producer: u64,
    bits: Vec<AtomicU64>,
    duplicates: AtomicU64,
}

impl ExactlyOnce {
    pub fn new(producers: usize, per_producer: u64) -> Self {
        let total = producers as u64 * per_producer;
        let words = total.div_ceil(64) as usize;
        Self {
            per_producer,
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Mark `value` delivered; false on a duplicate or out-of-range value
    pub fn record(&self, value: u64) -> bool {
        let (producer, sequence) = decode(value);
        if sequence >= self.per_producer {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let index = producer as u64 * self.per_producer + sequence;
        let Some(word) = self.bits.get((index / 64) as usize) else {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let bit = 1u64 << (index % 64);
        if word.fetch_or(bit, Ordering::Relaxed) & bit != 0 {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn delivered(&self) -> u64 {
        self.bits
            .iter()
            .map(|word| word.load(Ordering::Relaxed).count_ones() as u64)
            .sum()
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Items of the first `offered[p]` sequences of each producer not delivered
    pub fn missing(&self, offered: &[u64]) -> u64 {
        let mut missing = 0;
        for (producer, &count) in offered.iter().enumerate() {
            for sequence in 0..count.min(self.per_producer) {
                let index = producer as u64 * self.per_producer + sequence;
                let word = self.bits[(index / 64) as usize].load(Ordering::Relaxed);
                if word & (1 << (index % 64)) == 0 {
                    missing += 1;
                }
            }
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        assert_eq!(decode(encode(3, 17)), (3, 17));
        assert_eq!(decode(encode(0, 0)), (0, 0));
    }

    #[test]
    fn test_sequence_checker_allows_gaps_rejects_reorder() {
        let mut checker = SequenceChecker::new(2);
        assert!(checker.check(encode(0, 0)));
        assert!(checker.check(encode(1, 0)));
        assert!(checker.check(encode(0, 5)));
        assert!(!checker.check(encode(0, 3)));
        assert!(!checker.check(encode(7, 0)));
        assert_eq!(checker.errors(), 2);
        assert_eq!(checker.checked(), 5);
    }

    #[test]
    fn test_exactly_once() {
        let seen = ExactlyOnce::new(2, 100);
        assert!(seen.record(encode(0, 1)));
        assert!(seen.record(encode(1, 99)));
        assert!(!seen.record(encode(0, 1)));
        assert!(!seen.record(encode(0, 100)));
        assert_eq!(seen.delivered(), 2);
        assert_eq!(seen.duplicates(), 2);
        assert_eq!(seen.missing(&[2, 100]), 1 + 99);
    }
}

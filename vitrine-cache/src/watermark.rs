//! Logical write clock and per-key change journal.
//!
//! Every write to the store is stamped with a [`Watermark`] from a single
//! [`LogicalClock`]. A fetch remembers the watermark at which it started; when
//! it completes, the store compares that against later writes to decide what
//! wins, replaying journaled change events on top of the fetched snapshot.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use vitrine_core::ChangeEvent;

/// A point in the store's write history.
///
/// Sequence numbers are strictly increasing across the whole store, so two
/// watermarks from different keys are still comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark {
    pub sequence: i64,
    /// Wall-clock time the sequence was issued.
    pub observed_at: DateTime<Utc>,
}

impl Watermark {
    pub fn new(sequence: i64) -> Self {
        Self {
            sequence,
            observed_at: Utc::now(),
        }
    }

    /// Beginning of time; every issued watermark is newer.
    pub fn zero() -> Self {
        Self {
            sequence: 0,
            observed_at: DateTime::UNIX_EPOCH,
        }
    }

    pub fn is_newer_than(&self, other: &Watermark) -> bool {
        self.sequence > other.sequence
    }

    pub fn is_at_least(&self, other: &Watermark) -> bool {
        self.sequence >= other.sequence
    }

    /// Number of writes between two watermarks.
    pub fn gap(&self, other: &Watermark) -> i64 {
        (self.sequence - other.sequence).abs()
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::zero()
    }
}

/// Monotonic source of watermarks for one store.
#[derive(Debug, Default)]
pub struct LogicalClock {
    sequence: AtomicI64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next watermark.
    pub fn tick(&self) -> Watermark {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Watermark::new(sequence)
    }

    /// Latest issued watermark without advancing the clock.
    pub fn current(&self) -> Watermark {
        Watermark::new(self.sequence.load(Ordering::SeqCst))
    }
}

/// Change events applied to one key while a fetch for it was in flight.
#[derive(Debug, Default, Clone)]
pub struct KeyJournal {
    entries: Vec<(Watermark, ChangeEvent)>,
}

impl KeyJournal {
    pub fn record(&mut self, at: Watermark, event: ChangeEvent) {
        self.entries.push((at, event));
    }

    /// Events recorded strictly after `watermark`, in delivery order.
    pub fn since(&self, watermark: Watermark) -> impl Iterator<Item = &ChangeEvent> + '_ {
        self.entries
            .iter()
            .filter(move |(at, _)| at.is_newer_than(&watermark))
            .map(|(_, event)| event)
    }

    /// Drop events at or before `watermark`; returns how many were removed.
    pub fn prune_through(&mut self, watermark: &Watermark) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(at, _)| at.is_newer_than(watermark));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitrine_core::EntityType;

    #[test]
    fn test_watermark_ordering() {
        let w1 = Watermark::new(1);
        let w2 = Watermark::new(2);

        assert!(w2.is_newer_than(&w1));
        assert!(!w1.is_newer_than(&w2));
        assert!(w2.is_at_least(&w1));
        assert!(w1.is_at_least(&Watermark::new(1)));
        assert_eq!(w2.gap(&w1), 1);
        assert_eq!(w1.gap(&w2), 1);
    }

    #[test]
    fn test_watermark_zero() {
        let zero = Watermark::zero();
        assert_eq!(zero.sequence, 0);
        assert!(Watermark::new(1).is_newer_than(&zero));
    }

    #[test]
    fn test_clock_is_monotonic() {
        let clock = LogicalClock::new();
        assert_eq!(clock.current().sequence, 0);
        let a = clock.tick();
        let b = clock.tick();
        assert!(b.is_newer_than(&a));
        assert_eq!(clock.current().sequence, b.sequence);
    }

    #[test]
    fn test_journal_since_and_prune() {
        let clock = LogicalClock::new();
        let mut journal = KeyJournal::default();

        let start = clock.tick();
        let first = clock.tick();
        journal.record(first, ChangeEvent::delete(EntityType::Order, "a"));
        let second = clock.tick();
        journal.record(second, ChangeEvent::delete(EntityType::Order, "b"));

        let keys: Vec<_> = journal.since(start).map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);

        let keys: Vec<_> = journal.since(first).map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["b"]);

        assert_eq!(journal.prune_through(&first), 1);
        assert_eq!(journal.len(), 1);
        journal.clear();
        assert!(journal.is_empty());
    }
}

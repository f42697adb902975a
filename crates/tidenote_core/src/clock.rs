//! Logical time for last-writer-wins resolution.
//!
//! Every update record carries a Lamport clock value. A [`Stamp`] pairs that
//! value with the writing instance id; stamps are totally ordered by
//! `(clock, instance_id)`, so two writes with the same logical time resolve
//! identically on every peer (the lexicographically greater instance id wins).

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A Lamport clock shared by every store operation of one instance.
#[derive(Debug, Default)]
pub struct LamportClock {
    value: AtomicU64,
}

impl LamportClock {
    /// Create a clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock for a local event and return the new value.
    pub fn tick(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merge a clock value observed on a remote (or previously persisted) record.
    pub fn observe(&self, seen: u64) {
        self.value.fetch_max(seen, Ordering::SeqCst);
    }

    /// Current value without advancing.
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

/// Logical timestamp of a register write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    /// Lamport clock value
    pub clock: u64,
    /// Writing instance, the tie-break key
    pub instance: String,
}

impl Stamp {
    /// Create a new stamp.
    pub fn new(clock: u64, instance: impl Into<String>) -> Self {
        Self {
            clock,
            instance: instance.into(),
        }
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.clock
            .cmp(&other.clock)
            .then_with(|| self.instance.cmp(&other.instance))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_and_observe() {
        let clock = LamportClock::new();
        assert_eq!(clock.tick(), 1);
        clock.observe(10);
        assert_eq!(clock.tick(), 11);
        clock.observe(3);
        assert_eq!(clock.current(), 11);
    }

    #[test]
    fn test_stamp_ordering_breaks_ties_on_instance() {
        let a = Stamp::new(5, "aaaa");
        let b = Stamp::new(5, "bbbb");
        let c = Stamp::new(6, "aaaa");
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.clone().max(b.clone()), b);
    }
}

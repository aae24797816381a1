//! Batched cost recording.
//!
//! Writing every charge straight to the store costs one UPDATE per rate
//! limited operation. Charges are collected here instead and written at most
//! once per flush interval.

/// Cost charged to a consumer but not yet written to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CostAccumulator {
    pending: u64,
    last_flush: Option<i64>,
}

impl CostAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add cost to the pending total.
    pub fn add(&mut self, cost: u64) {
        self.pending = self.pending.saturating_add(cost);
    }

    /// Cost waiting to be flushed.
    pub fn pending(&self) -> u64 {
        self.pending
    }

    /// Whether a flush at `now` respects the interval.
    pub fn is_due(&self, now: i64, interval_secs: i64) -> bool {
        match self.last_flush {
            Some(last) => now - last >= interval_secs,
            None => true,
        }
    }

    /// Drain the pending cost if it is non-zero and a flush is due.
    pub fn take_if_due(&mut self, now: i64, interval_secs: i64) -> Option<u64> {
        if self.pending == 0 || !self.is_due(now, interval_secs) {
            return None;
        }
        Some(self.take(now))
    }

    /// Drain the pending cost regardless of the interval.
    pub fn take(&mut self, now: i64) -> u64 {
        self.last_flush = Some(now);
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_flush_is_due() {
        let mut acc = CostAccumulator::new();
        acc.add(5);
        assert_eq!(acc.take_if_due(100, 1), Some(5));
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn test_flushes_at_most_once_per_interval() {
        let mut acc = CostAccumulator::new();
        acc.add(5);
        assert_eq!(acc.take_if_due(100, 2), Some(5));

        acc.add(3);
        acc.add(4);
        assert_eq!(acc.take_if_due(101, 2), None);
        assert_eq!(acc.pending(), 7);
        assert_eq!(acc.take_if_due(102, 2), Some(7));
    }

    #[test]
    fn test_empty_accumulator_does_not_flush() {
        let mut acc = CostAccumulator::new();
        assert_eq!(acc.take_if_due(100, 1), None);
        // Nothing was written, so the interval did not restart
        acc.add(1);
        assert_eq!(acc.take_if_due(100, 1), Some(1));
    }

    #[test]
    fn test_forced_take_ignores_interval() {
        let mut acc = CostAccumulator::new();
        acc.add(2);
        acc.take(100);
        acc.add(9);
        assert_eq!(acc.take(100), 9);
        assert!(!acc.is_due(100, 1));
    }
}

use std::collections::VecDeque;

/// Rolling error rate over the last `capacity` fetch outcomes.
pub struct RollingErrorRate {
    window: VecDeque<bool>,
    capacity: usize,
}

impl RollingErrorRate {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, is_error: bool) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(is_error);
    }

    pub fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let errors = self.window.iter().filter(|e| **e).count();
        errors as f64 / self.window.len() as f64
    }
}

/// Batch size that halves (floor 5) on a rolling error rate above 10% and
/// doubles (ceiling 50) below 5%; the same rule is shared verbatim by the
/// link validator.
///
/// `record_outcome` only feeds the rolling window; the size itself is
/// recomputed once per batch boundary via `adjust_for_next_batch`, so a long
/// run of same-verdict outcomes inside one batch doesn't compound the
/// halving/doubling multiple times before the caller ever sees a new size.
pub struct AdaptiveBatch {
    size: usize,
    floor: usize,
    ceiling: usize,
    error_rate: RollingErrorRate,
}

impl AdaptiveBatch {
    pub fn new(initial: usize) -> Self {
        Self {
            size: initial.clamp(5, 50),
            floor: 5,
            ceiling: 50,
            error_rate: RollingErrorRate::new(100),
        }
    }

    pub fn record_outcome(&mut self, is_error: bool) {
        self.error_rate.record(is_error);
    }

    /// Recomputes `size` from the current rolling error rate. Called once
    /// per batch boundary (not per outcome) by the frontier and validator.
    pub fn adjust_for_next_batch(&mut self) -> usize {
        let rate = self.error_rate.error_rate();
        if rate > 0.10 {
            self.size = (self.size / 2).max(self.floor);
        } else if rate < 0.05 {
            self.size = (self.size * 2).min(self.ceiling);
        }
        self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves_on_high_error_rate() {
        let mut batch = AdaptiveBatch::new(40);
        for _ in 0..20 {
            batch.record_outcome(true);
        }
        batch.adjust_for_next_batch();
        assert_eq!(batch.size(), 20);
    }

    #[test]
    fn never_drops_below_floor() {
        let mut batch = AdaptiveBatch::new(10);
        for _ in 0..100 {
            batch.record_outcome(true);
        }
        for _ in 0..10 {
            batch.adjust_for_next_batch();
        }
        assert_eq!(batch.size(), 5);
    }

    #[test]
    fn doubles_on_low_error_rate() {
        let mut batch = AdaptiveBatch::new(10);
        for _ in 0..100 {
            batch.record_outcome(false);
        }
        batch.adjust_for_next_batch();
        assert_eq!(batch.size(), 20);
    }

    #[test]
    fn never_exceeds_ceiling() {
        let mut batch = AdaptiveBatch::new(45);
        for _ in 0..100 {
            batch.record_outcome(false);
        }
        for _ in 0..5 {
            batch.adjust_for_next_batch();
        }
        assert_eq!(batch.size(), 50);
    }

    #[test]
    fn size_is_stable_across_many_outcomes_without_adjust() {
        let mut batch = AdaptiveBatch::new(20);
        for _ in 0..99 {
            batch.record_outcome(true);
        }
        assert_eq!(batch.size(), 20);
    }
}

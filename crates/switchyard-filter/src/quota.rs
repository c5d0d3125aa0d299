//! The shared work budget.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::FilterError;

/// Counts traversal and comparison work for one evaluation.
///
/// Every branch of an evaluation charges the same counter, so forked branches
/// add up instead of each getting a fresh budget.
#[derive(Debug)]
pub struct WorkCounter {
    quota: usize,
    used: AtomicUsize,
}

impl WorkCounter {
    pub fn new(quota: usize) -> Self {
        Self {
            quota,
            used: AtomicUsize::new(0),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn increase(&self) -> Result<(), FilterError> {
        self.increase_by(1)
    }

    pub fn increase_by(&self, amount: usize) -> Result<(), FilterError> {
        let used = self
            .used
            .fetch_add(amount, Ordering::Relaxed)
            .saturating_add(amount);
        if used > self.quota {
            tracing::warn!(quota = self.quota, used, "filter evaluation exceeded its quota");
            return Err(FilterError::QuotaExceeded { quota: self.quota });
        }
        Ok(())
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed).min(self.quota)
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    pub fn reset(&self) {
        self.used.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausting_the_budget_fails() {
        let counter = WorkCounter::new(3);
        counter.increase_by(2).unwrap();
        counter.increase().unwrap();
        assert_eq!(
            counter.increase(),
            Err(FilterError::QuotaExceeded { quota: 3 })
        );
        counter.reset();
        assert_eq!(counter.used(), 0);
    }
}

/// Remaining wall-clock allowance for a scan.
///
/// Callers charge the budget with the elapsed time they actually measured,
/// never with a nominal tick, so slow wakeups cannot stretch the deadline.
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBudget {
    total: Duration,
    remaining: Duration,
}

impl TimeBudget {
    /// Create a budget. A zero duration is a caller error and yields `None`.
    pub fn new(total: Duration) -> Option<Self> {
        if total.is_zero() {
            return None;
        }
        Some(Self {
            total,
            remaining: total,
        })
    }

    /// Deduct measured elapsed time. Saturates at zero.
    pub fn consume(&mut self, elapsed: Duration) {
        self.remaining = self.remaining.saturating_sub(elapsed);
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining.is_zero()
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    /// Longest wait allowed right now: the quantum, clipped to what is left.
    pub fn next_wait(&self, quantum: Duration) -> Duration {
        quantum.min(self.remaining)
    }
}

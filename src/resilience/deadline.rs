//! Request-wide deadline threaded through chain execution.

use std::time::{Duration, Instant};

/// Fixed budget measured from creation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    /// Start a deadline of `budget` from now.
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    /// Time since creation.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    /// Whether the budget is spent.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Timeout for the next call: the smaller of `cap` and what is left.
    pub fn call_timeout(&self, cap: Duration) -> Duration {
        cap.min(self.remaining())
    }

    /// Whether sleeping `delay` still leaves time for another call.
    pub fn allows(&self, delay: Duration) -> bool {
        self.remaining() > delay
    }
}

//! Sleep and deadline utilities

use std::time::{Duration, Instant};

/// Hard deadline measured against the monotonic clock.
///
/// Every blocking wait in the stack is a polling loop that checks one of
/// these between polls, so no wait can outlive its budget.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    /// Sleep for `step`, clamped so the deadline is never overshot.
    pub fn pause(&self, step: Duration) {
        let step = step.min(self.remaining());
        if !step.is_zero() {
            std::thread::sleep(step);
        }
    }
}

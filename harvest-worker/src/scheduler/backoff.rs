//! Failure backoff
//!
//! Delay after the n-th consecutive worker-level failure:
//! `min(base × 2^(n-1), max)`.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    /// Consecutive failures recorded since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a failure and returns how long to wait
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay_for(self.failures)
    }

    /// Delay for the given number of consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

//! Bounded retry for store operations
//!
//! Between attempts the connection is revalidated through the store, so a
//! retry after a dropped connection runs on a fresh one.

use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::repository::{JobStore, StoreError};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayGrowth {
    /// Always `delay`
    Fixed,
    /// `delay × attempt`
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub growth: DelayGrowth,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            growth: DelayGrowth::Fixed,
        }
    }

    pub fn linear(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            growth: DelayGrowth::Linear,
        }
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.growth {
            DelayGrowth::Fixed => self.delay,
            DelayGrowth::Linear => self.delay.saturating_mul(attempt),
        }
    }

    /// Total time spent sleeping when every attempt fails
    pub fn total_delay(&self) -> Duration {
        (1..self.max_attempts.max(1))
            .map(|attempt| self.delay_after(attempt))
            .sum()
    }

    /// Runs `op` until it succeeds or attempts run out
    ///
    /// # Arguments
    /// * `store` - Used to revalidate the connection between attempts
    /// * `label` - Names the operation in logs
    /// * `op` - The operation; called once per attempt
    ///
    /// # Returns
    /// The first success, the last error after exhaustion, or the
    /// revalidation error if the connection could not be restored.
    pub async fn run<T, F, Fut>(
        &self,
        store: &dyn JobStore,
        label: &str,
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded after {} attempt(s)", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= max_attempts => {
                    warn!("{} failed after {} attempts: {}", label, max_attempts, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        label, attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;

                    store.ensure_connection().await?;
                    attempt += 1;
                }
            }
        }
    }
}

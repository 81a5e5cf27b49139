//! Bounded retry around one idempotent-safe store step.
//!
//! Only errors for which [`Error::is_transient`] holds are retried. Anything
//! else, and the last transient error once attempts run out, is returned to
//! the caller unchanged.

use std::future::Future;
use std::time::Duration;

use opentelemetry::KeyValue;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// Retry tunables. Deserializes from a `[survey.retry.*]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first. At least 1.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: Backoff,
    /// Add a random 0..=50% of the delay to spread out competing callers.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Short fixed delay: an assignment loser re-samples right away.
    pub fn for_assign() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 25,
            max_delay_ms: 25,
            backoff: Backoff::Fixed,
            jitter: true,
        }
    }

    pub fn for_complete() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff: Backoff::Exponential,
            jitter: false,
        }
    }

    /// Whole-sweep retries are rare and expensive; back off hard.
    pub fn for_reclaim() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            backoff: Backoff::Exponential,
            jitter: true,
        }
    }

    /// No delay between attempts. For tests and in-memory dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            backoff: Backoff::Fixed,
            jitter: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("retry max_attempts must be at least 1".into()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::Config(format!(
                "retry max_delay_ms ({}) is below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }

    /// Delay after failed attempt number `attempt` (1-based), before jitter.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let ms = match self.backoff {
            Backoff::Fixed => self.base_delay_ms,
            Backoff::Exponential => {
                let factor = 1u64
                    .checked_shl(attempt.saturating_sub(1))
                    .unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let ms = delay.as_millis() as u64;
        // Create the rng here so it is never held across an await.
        let extra = rand::rng().random_range(0..=ms / 2);
        Duration::from_millis(ms + extra)
    }

    /// Run `step` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `step` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut step: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match step(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let wait = self.jittered(self.delay_after(attempt));
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    metrics::store_retries().add(1, &[KeyValue::new("operation", operation)]);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_complete()
    }
}

//! Retry with capped exponential backoff.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::types::{Error, Result};

/// How many times a tool call is attempted and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3).
    pub max_attempts: u32,
    /// Delay before the second attempt (default: 1s).
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound on any single delay (default: 10s).
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::config("retry.base_delay must not exceed retry.max_delay"));
        }
        Ok(())
    }

    /// `min(base_delay * 2^attempt, max_delay)`, with `attempt` counted from 0.
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out.
    ///
    /// `op` receives the zero-based attempt number. Timeouts and other
    /// non-retryable errors are returned as-is after a single attempt; an
    /// exhausted budget yields [`Error::RetriesExhausted`] carrying the last
    /// failure.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if attempt + 1 >= attempts {
                return Err(Error::RetriesExhausted {
                    attempts,
                    last: Box::new(err),
                });
            }
            let delay = self.backoff(attempt);
            tracing::debug!(
                "retry_scheduled: attempt={}/{}, delay_ms={}, error={}",
                attempt + 1,
                attempts,
                delay.as_millis(),
                err
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

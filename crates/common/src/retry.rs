//! Retry strategy with exponential backoff.
//!
//! One shape, two policies: the connectivity reconnect policy used around store
//! and queue calls, and the delivery retry policy the worker applies to failed
//! channel attempts. They are configured independently.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Attempts, base delay and multiplicative backoff, with a delay ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    /// Delay before the first retry.
    pub delay: Duration,
    /// Multiplier applied per retry.
    pub backoff: f64,
    /// Upper bound for any computed delay.
    pub max_delay: Duration,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
            backoff: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryStrategy {
    pub fn new(attempts: u32, delay: Duration, backoff: f64, max_delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            backoff,
            max_delay,
        }
    }

    /// Delay after `retry` previous retries: `delay * backoff^retry`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let millis = self.delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            self.max_delay
        }
    }

    /// Whether `attempts_made` attempts use up the budget.
    pub fn is_exhausted(&self, attempts_made: u32) -> bool {
        attempts_made >= self.attempts.max(1)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// strategy's attempts are used up.
pub async fn retry<T, F, Fut>(strategy: &RetryStrategy, what: &str, mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && !strategy.is_exhausted(attempt + 1) => {
                let wait = strategy.delay_for(attempt);
                tracing::warn!(
                    operation = what,
                    attempt = attempt + 1,
                    max_attempts = strategy.attempts,
                    delay_ms = wait.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

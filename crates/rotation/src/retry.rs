//! Backoff for retryable transitions
//!
//! Only errors for which [`RotationError::is_retryable`] holds are retried.
//! Attempts are strictly sequential, so a retried transition never runs
//! concurrently with its previous attempt.
//!
//! [`RotationError::is_retryable`]: crate::RotationError::is_retryable

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::error::RotationResult;

/// How many times, and how far apart, a retryable failure is re-attempted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included
    pub max_attempts: u32,

    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Growth factor between consecutive delays
    pub backoff_multiplier: f32,

    /// Upper bound on any single delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after failed attempt number `attempt` (zero-based), spread by ±10%
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let factor = f64::from(self.backoff_multiplier).powi(attempt as i32)
            * rand::rng().random_range(0.9..=1.1);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(delay)
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// attempts run out; the last error is returned as-is
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut f: F,
) -> RotationResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RotationResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts,
                    error_kind = %e.kind(),
                    error = %e,
                    "Retry attempt failed"
                );

                if attempt + 1 >= max_attempts {
                    return Err(e);
                }

                let backoff = policy.backoff_duration(attempt);
                tracing::debug!(
                    operation = operation_name,
                    backoff_ms = backoff.as_millis() as u64,
                    "Backing off before next retry"
                );
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

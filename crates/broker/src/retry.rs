use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::{Error, SenderConfig};

/// Exponential backoff settings.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Backoff before the first retry.
    pub initial_backoff: Duration,

    /// Growth factor per attempt.
    pub multiplier: f64,

    /// Upper bound for a single backoff.
    pub max_backoff: Duration,
}

impl From<&SenderConfig> for RetryPolicy {
    fn from(config: &SenderConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: config.retry_backoff,
            multiplier: config.retry_backoff_multiplier,
            max_backoff: config.max_retry_backoff,
        }
    }
}

/// Retries fallible async operations with exponential backoff.
#[derive(Clone, Debug)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    /// Creates a retry manager with the given policy.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Backoff slept after the given (zero-based) failed attempt.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self
            .policy
            .multiplier
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let millis = self.policy.initial_backoff.as_secs_f64() * 1000.0 * factor;

        if !millis.is_finite() || millis >= self.policy.max_backoff.as_secs_f64() * 1000.0 {
            return self.policy.max_backoff;
        }

        Duration::from_millis(millis.round() as u64)
    }

    /// Runs `operation(attempt)` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent.
    ///
    /// # Errors
    /// Returns the first non-retryable error unchanged, or `Error::RetriesExhausted` wrapping
    /// the last error.
    pub async fn with_retry<T, F, Fut>(&self, context: &str, mut operation: F) -> Result<T, Error>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt = 0;

        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_retryable() => return Err(error),
                Err(error) if attempt < self.policy.max_retries => {
                    let backoff = self.backoff(attempt);
                    warn!(context, attempt, ?backoff, %error, "attempt failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(error) => {
                    debug!(context, attempts = attempt + 1, "retries exhausted");
                    return Err(Error::RetriesExhausted {
                        context: context.to_string(),
                        attempts: attempt + 1,
                        source: Box::new(error),
                    });
                }
            }
        }
    }
}

//! Bounded retry with exponential backoff
//!
//! Retry is an explicit loop with an enumerated outcome rather than
//! error-driven unwinding, so retry budgets can be tested in isolation.
//! Backoff is deterministic (no jitter): `base * 2^attempt`, capped at
//! `max_delay`, multiplied for quota bursts.

use crate::types::JobConfig;
use docshift_store::StoreError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Retry budget and backoff shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Delay multiplier applied to `QuotaExceeded`
    pub quota_backoff_multiplier: u32,
}

impl RetryPolicy {
    /// Default multiplier for quota bursts
    pub const QUOTA_BACKOFF_MULTIPLIER: u32 = 4;

    /// Create policy
    #[inline]
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            quota_backoff_multiplier: Self::QUOTA_BACKOFF_MULTIPLIER,
        }
    }

    /// Batch retry policy of a job
    #[must_use]
    pub fn for_batches(config: &JobConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        )
    }

    /// Rollback retry policy of a job
    ///
    /// Like `max_retries`, `max_rollback_retries` counts retries after the
    /// first attempt.
    #[must_use]
    pub fn for_rollback(config: &JobConfig) -> Self {
        Self::new(
            config.max_rollback_retries,
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        )
    }

    /// Delay before retry number `retry` (0-based) after `error`
    #[must_use]
    pub fn delay_for(&self, retry: u32, error: &StoreError) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        let mut delay = self.base_delay.saturating_mul(factor);
        if error.is_quota() {
            delay = delay.saturating_mul(self.quota_backoff_multiplier.max(1));
        }
        delay.min(self.max_delay.max(self.base_delay))
    }
}

/// Terminal result of a retried operation
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Operation succeeded on attempt `attempts`
    Succeeded { value: T, attempts: u32 },
    /// Transient failures used up the budget or the deadline
    Exhausted { attempts: u32, last_error: StoreError },
    /// Non-transient failure, not retried
    Fatal { attempts: u32, error: StoreError },
}

impl<T> RetryOutcome<T> {
    /// Number of attempts made
    #[inline]
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Fatal { attempts, .. } => *attempts,
        }
    }

    /// Convert to `Result`, discarding the attempt count
    ///
    /// # Errors
    /// Returns the last store error on `Exhausted` or `Fatal`
    pub fn into_result(self) -> Result<T, StoreError> {
        match self {
            Self::Succeeded { value, .. } => Ok(value),
            Self::Exhausted { last_error, .. } => Err(last_error),
            Self::Fatal { error, .. } => Err(error),
        }
    }
}

/// Run `op` until it succeeds, fails fatally, or the budget runs out
///
/// `op` receives the 1-based attempt number. Only transient store errors
/// are retried. When a backoff sleep would pass `deadline`, the operation is
/// reported `Exhausted` without sleeping.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Option<Instant>,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match op(attempt).await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                }
            }
            Err(error) => error,
        };

        if !error.is_transient() {
            return RetryOutcome::Fatal {
                attempts: attempt,
                error,
            };
        }
        if attempt > policy.max_retries {
            return RetryOutcome::Exhausted {
                attempts: attempt,
                last_error: error,
            };
        }

        let delay = policy.delay_for(attempt - 1, &error);
        if deadline.is_some_and(|d| Instant::now() + delay > d) {
            tracing::debug!(attempt, "retry deadline reached");
            return RetryOutcome::Exhausted {
                attempts: attempt,
                last_error: error,
            };
        }
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying");
        tokio::time::sleep(delay).await;
    }
}

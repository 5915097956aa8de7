//! Retry with exponential backoff, shared by playlist and segment requests.

use rand::RngExt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{AssemblyError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed after the first one.
    pub max_retries: u32,
    /// Delay before the first retry; doubled on each further retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay, jitter included.
    pub max_delay: Duration,
    /// Adds up to half of `base_delay` of random delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the failed attempt `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return delay;
        }

        let spread_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let headroom_ms = u64::try_from(self.max_delay.saturating_sub(delay).as_millis()).unwrap_or(0);
        let limit_ms = spread_ms.min(headroom_ms);
        if limit_ms == 0 {
            return delay;
        }

        let extra = Duration::from_millis(rand::rng().random_range(0..limit_ms));
        (delay + extra).min(self.max_delay)
    }
}

/// Outcome of one attempt as judged by the caller.
pub enum RetryAction<T> {
    Success(T),
    /// Transient failure; try again if the budget allows.
    Retry(AssemblyError),
    /// Terminal failure; give up now.
    Fail(AssemblyError),
}

impl<T> RetryAction<T> {
    /// Classifies a plain result using [`AssemblyError::is_retryable`].
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) if err.is_retryable() => Self::Retry(err),
            Err(err) => Self::Fail(err),
        }
    }
}

/// Runs `operation` until it succeeds, fails terminally, exhausts the policy, or
/// `token` is cancelled. The closure receives the 0-based attempt number.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(AssemblyError::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) if attempt >= policy.max_retries => return Err(err),
            RetryAction::Retry(err) => err,
        };

        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        warn!(
            attempt,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, backing off"
        );

        tokio::select! {
            _ = token.cancelled() => return Err(AssemblyError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

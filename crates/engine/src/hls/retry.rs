// Retry-with-backoff for segment downloads.
//
// Exponential backoff with optional jitter, capped at `max_delay`.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::hls::HlsError;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry; doubles with every further retry.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// Adds up to `base_delay / 2` of random jitter.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy allowing `attempts` tries in total.
    pub fn with_attempts(attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries: attempts.saturating_sub(1),
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt + 1` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let limit = jitter_range_ms.min(remaining_ms);
        if limit == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::rng().random_range(0..limit))
    }
}

/// Result of a single attempt.
pub enum RetryAction<T> {
    Success(T),
    /// Transient failure (network, 5xx, timeout)
    Retry(HlsError),
    /// Permanent failure (4xx, invalid data)
    Fail(HlsError),
}

/// Runs `operation` until it succeeds, fails permanently, runs out of
/// retries, or `token` is cancelled.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, HlsError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(HlsError::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) if attempt >= policy.max_retries => return Err(err),
            RetryAction::Retry(err) => err,
        };

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            attempt = attempt + 1,
            max = policy.max_retries + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(HlsError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

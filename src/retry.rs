//! Retry utilities with exponential backoff.
//!
//! Implements the backoff policy `ChatEngine` requires: HTTP 429 and 5xx
//! responses are retried with `delay = 1000ms * 2^attempt`, capped at 3
//! attempts, no sleep after the final attempt. Context-overflow (HTTP 400 +
//! `ValidationException`) is handled separately by `ContextCompressor`, not
//! by this module.
//!
//! # Examples
//!
//! ```rust,no_run
//! use multigate_core::retry::{retry_with_backoff, RetryConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RetryConfig::default();
//! let result = retry_with_backoff(config, || async {
//!     Ok::<_, multigate_core::Error>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Configuration for the upstream-transient retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, capped at 3 retries.
    pub max_attempts: u32,

    /// Base delay for attempt 0 (1000 ms).
    pub base_delay: Duration,

    /// Exponential multiplier (×2 per attempt).
    pub backoff_multiplier: f64,

    /// Optional random jitter, fraction of the computed delay (0.0 to 1.0).
    /// Kept as an opt-in knob, defaulting to off so retry timing stays
    /// deterministic for tests.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable jitter for production use; leave at 0.0 (default) in tests that
    /// assert on exact delay values.
    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// `1000ms * 2^attempt`, plus optional symmetric jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponential_ms = base_ms * self.backoff_multiplier.powi(attempt as i32);

        if self.jitter_factor == 0.0 {
            return Duration::from_millis(exponential_ms as u64);
        }

        let jitter_range = exponential_ms * self.jitter_factor;
        let jitter = rand::random::<f64>() * jitter_range - (jitter_range / 2.0);
        Duration::from_millis((exponential_ms + jitter).max(0.0) as u64)
    }
}

/// Retry an async operation, retrying only on errors `Error::is_retryable()`
/// reports true for (upstream-transient 429/5xx, timeout, stream errors).
///
/// Returns the last error once `max_attempts` is exhausted, or immediately on
/// any non-retryable error without sleeping.
pub async fn retry_with_backoff<F, Fut, T>(config: RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }

                tracing::debug!(attempt, error = %err, "retrying after transient upstream error");
                last_error = Some(err);

                if attempt + 1 < config.max_attempts {
                    sleep(config.delay_for_attempt(attempt)).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::other("retry failed with no error recorded")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_retry_config_default_matches_spec() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay, Duration::from_millis(1000));
        assert_eq!(config.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_delay_for_attempt_exponential_no_jitter() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn test_retry_success_on_first_attempt() {
        let config = RetryConfig::new().with_base_delay(Duration::from_millis(1));
        let call_count = Arc::new(AtomicUsize::new(0));
        let count_clone = call_count.clone();

        let result = retry_with_backoff(config, move |_attempt| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<i32, Error>(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_then_succeed_exactly_one_retry() {
        // 429 then 200 -> exactly one retry, result returned without
        // surfacing the 429.
        let config = RetryConfig::new().with_base_delay(Duration::from_millis(1));
        let call_count = Arc::new(AtomicUsize::new(0));
        let count_clone = call_count.clone();

        let result = retry_with_backoff(config, move |_attempt| {
            let count = count_clone.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if count < 2 {
                    Err(Error::upstream_transient(429, "rate limited"))
                } else {
                    Ok::<i32, Error>(200)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 200);
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let config = RetryConfig::new()
            .with_max_attempts(2)
            .with_base_delay(Duration::from_millis(1));
        let call_count = Arc::new(AtomicUsize::new(0));
        let count_clone = call_count.clone();

        let result = retry_with_backoff(config, move |_attempt| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, Error>(Error::upstream_transient(503, "unavailable")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_permanent_error() {
        let config = RetryConfig::new().with_base_delay(Duration::from_millis(1));
        let call_count = Arc::new(AtomicUsize::new(0));
        let count_clone = call_count.clone();

        let result = retry_with_backoff(config, move |_attempt| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<i32, Error>(Error::upstream_permanent(403, None, None, "forbidden"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }
}

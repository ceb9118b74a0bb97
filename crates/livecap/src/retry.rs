//! Bounded retry with exponential backoff, used for segment fetches.

use rand::RngExt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::CaptureError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay after the first failure; doubled on every further failure.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Add up to `base_delay / 2` of random jitter.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the failure of `attempt` (0-indexed).
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
        let headroom_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let limit = jitter_range_ms.min(headroom_ms);
        if limit == 0 {
            return capped;
        }

        capped + Duration::from_millis(rand::rng().random_range(0..limit))
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up. The last error is returned on exhaustion.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T, CaptureError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CaptureError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                if attempt + 1 >= attempts {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    target_name = what,
                    attempt = attempt + 1,
                    max = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> CaptureError {
        CaptureError::SegmentFetch {
            uri: "s.ts".to_string(),
            reason: "503".to_string(),
            retryable: true,
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        }
    }

    #[test]
    fn delay_doubles_until_capped() {
        let policy = policy(10);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_under_cap() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy(3)
        };
        for _ in 0..32 {
            assert!(policy.delay_for_attempt(8) <= Duration::from_secs(1));
            let first = policy.delay_for_attempt(0);
            assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_budget_is_spent() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&policy(10), "segment", |_| {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(transient()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&policy(10), "segment", |_| {
            calls.fetch_add(1, Ordering::Relaxed);
            async {
                Err(CaptureError::SegmentFetch {
                    uri: "s.ts".to_string(),
                    reason: "404".to_string(),
                    retryable: false,
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let result = retry_with_backoff(&policy(5), "segment", |attempt| async move {
            if attempt < 2 { Err(transient()) } else { Ok(attempt) }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}

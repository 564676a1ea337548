//! Bounded retry with exponential backoff and jitter.
//!
//! Used by bus publishers (retry a failed publish before surfacing the
//! error) and by receiver loops (pause before re-establishing a dropped
//! subscription). The delay for attempt `n` is `base * 2^n`, capped at
//! `max_delay`, with full jitter applied on top.

use rand::Rng;
use std::time::Duration;

/// Retry policy: attempt cap plus backoff shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Backoff delay after the given zero-based failed attempt, with full
    /// jitter: a uniform sample from `[0, capped_exponential]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        if exp.is_zero() {
            return exp;
        }
        let jittered = rand::thread_rng().gen_range(0..=exp.as_millis() as u64);
        Duration::from_millis(jittered)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    /// Sleep for the backoff delay after the given failed attempt.
    pub async fn wait(&self, attempt: u32) {
        tokio::time::sleep(self.delay_for(attempt)).await;
    }
}

/// Run `op` until it succeeds, the error is non-retriable, or the policy
/// is exhausted. `retriable` decides which errors are worth another try.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut retriable: impl FnMut(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if retriable(&e) && policy.should_retry(attempt) => {
                tracing::debug!(attempt, "operation failed, backing off before retry");
                policy.wait(attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(400));
        for attempt in 0..10 {
            assert!(policy.delay_for(attempt) <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_should_retry_respects_cap() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(10));
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(&policy, |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retriable() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(&policy, |e| *e != "fatal", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("fatal") }
        })
        .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_policy() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(&policy, |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("transient") }
        })
        .await;
        assert_eq!(result, Err("transient"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

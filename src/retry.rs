// =============================================================================
// Retry policy — exponential backoff with jitter over classified errors
// =============================================================================
//
// delay = min(base * base_exp^attempt, max_delay), optionally multiplied by a
// uniform jitter in [0.5, 1.5). Non-retryable errors fail fast; retryable
// ones are re-attempted up to `max_retries` times. With `max_retries = 0` the
// first failure is returned without sleeping.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::error::ExchangeError;

/// Backoff configuration shared by all exchange operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Number of re-attempts after the first failure.
    pub max_retries: u32,
    /// Initial delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Exponential base.
    pub exponential_base: f64,
    /// Multiply each delay by uniform [0.5, 1.5) to avoid thundering herds.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy used for operations that must not retry at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Raw (pre-jitter) delay for a zero-based attempt index.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.exponential_base.powi(attempt as i32);
        let secs = self.base_delay.as_secs_f64() * exp;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

/// Run `op` with the given retry policy.
///
/// `op` is a closure producing a fresh future per attempt. The error type is
/// the classified [`ExchangeError`]; only errors whose `is_retryable()` is
/// true are retried.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt >= policy.max_retries {
                    error!(
                        op = op_name,
                        attempts = attempt + 1,
                        kind = e.kind(),
                        error = %e,
                        "retries exhausted"
                    );
                    return Err(e);
                }
                let delay = policy.jittered(policy.delay_for_attempt(attempt));
                warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    kind = e.kind(),
                    error = %e,
                    "retry scheduled"
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
    use std::sync::Arc;

    fn quick_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            exponential_base: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result = retry_with_backoff(&quick_policy(3), "test", move || {
            let calls = calls_in.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ExchangeError::Network("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result: Result<(), _> = retry_with_backoff(&quick_policy(5), "test", move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::Authentication("bad key".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(ExchangeError::Authentication(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_retries_raises_on_first_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let start = std::time::Instant::now();
        let result: Result<(), _> = retry_with_backoff(&quick_policy(0), "test", move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::Timeout("slow".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(ExchangeError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // No sleep happened on the way out.
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            exponential_base: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(5));
    }
}

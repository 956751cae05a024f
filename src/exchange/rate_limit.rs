// =============================================================================
// Rate limiting — request pacing plus header-driven usage tracking
// =============================================================================
//
// Two mechanisms cooperate:
//   1. A pacer that enforces the configured minimum interval between REST
//      calls (EXCHANGE__RATE_LIMIT_MS).
//   2. A tracker fed from `X-MBX-USED-WEIGHT-1M` response headers; when the
//      reported weight approaches the venue ceiling, further requests are
//      refused locally with a RateLimit error instead of risking a ban.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::ExchangeError;

/// Weight at which we refuse to send more requests (venue limit is 1200/min).
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Weight at which a warning is logged.
const WEIGHT_WARN_THRESHOLD: u32 = 800;

/// Combined pacer + usage tracker shared by all adapter calls.
pub struct RateLimiter {
    min_interval: Duration,
    last_request: tokio::sync::Mutex<Option<Instant>>,
    used_weight_1m: AtomicU32,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: tokio::sync::Mutex::new(None),
            used_weight_1m: AtomicU32::new(0),
        }
    }

    /// Wait until a request costing `weight` may be sent. Fails with a
    /// RateLimit error when the reported 1-minute weight is at the ceiling.
    pub async fn acquire(&self, weight: u32) -> Result<(), ExchangeError> {
        let used = self.used_weight_1m.load(Ordering::Relaxed);
        if used + weight > WEIGHT_HARD_LIMIT {
            warn!(
                used_weight = used,
                requested = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request refused locally to stay under the venue weight limit"
            );
            return Err(ExchangeError::RateLimit(format!(
                "local weight budget exhausted ({used}/{WEIGHT_HARD_LIMIT})"
            )));
        }

        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
        Ok(())
    }

    /// Update the tracked weight from the exchange's response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(weight) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };

        let prev = self.used_weight_1m.swap(weight, Ordering::Relaxed);
        if weight >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request weight crossed warning threshold"
            );
        } else {
            debug!(used_weight_1m = weight, "request weight updated");
        }
    }

    pub fn used_weight(&self) -> u32 {
        self.used_weight_1m.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("min_interval", &self.min_interval)
            .field("used_weight_1m", &self.used_weight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paces_consecutive_requests() {
        let limiter = RateLimiter::new(Duration::from_millis(30));
        let start = Instant::now();
        limiter.acquire(1).await.unwrap();
        limiter.acquire(1).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn refuses_when_weight_budget_exhausted() {
        let limiter = RateLimiter::new(Duration::from_millis(0));
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", "999".parse().unwrap());
        limiter.update_from_headers(&headers);

        assert!(limiter.acquire(1).await.is_ok());
        let err = limiter.acquire(10).await.unwrap_err();
        assert!(matches!(err, ExchangeError::RateLimit(_)));
    }

    #[test]
    fn ignores_missing_or_garbage_headers() {
        let limiter = RateLimiter::new(Duration::from_millis(0));
        let mut headers = reqwest::header::HeaderMap::new();
        limiter.update_from_headers(&headers);
        headers.insert("X-MBX-USED-WEIGHT-1M", "not-a-number".parse().unwrap());
        limiter.update_from_headers(&headers);
        assert_eq!(limiter.used_weight(), 0);
    }
}

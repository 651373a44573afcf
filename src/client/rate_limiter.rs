//! Shared backoff for the completion endpoint.
//!
//! Epistemic foundation:
//! - K_i: 429 responses require exponential backoff
//! - K_i: With thousands of concurrent tasks, one 429 means everyone should wait
//! - I^B: The server's real capacity is unknowable until it pushes back

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest backoff armed by consecutive 429s.
const MAX_BACKOFF_SECS: f64 = 60.0;

/// Endpoint-wide rate limiter.
///
/// Every request waits on the same backoff deadline, so a burst of 429s
/// pauses the whole run instead of each task hammering independently.
#[derive(Debug, Default)]
pub struct RateLimiter {
    /// Backoff until this time
    backoff_until: Mutex<Option<Instant>>,
    /// Consecutive 429 errors
    consecutive_429s: AtomicU32,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn wait_time(&self) -> Duration {
        let until = *self.backoff_until.lock().unwrap_or_else(|e| e.into_inner());
        until
            .map(|t| t.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Wait if a backoff is armed. Returns the duration waited.
    pub async fn wait_if_needed(&self) -> Duration {
        let wait_time = self.wait_time();

        if wait_time > Duration::ZERO {
            debug!(wait_ms = wait_time.as_millis() as u64, "Waiting for rate limit");
            tokio::time::sleep(wait_time).await;
        }

        wait_time
    }

    /// Record a 429 and arm the backoff.
    ///
    /// A usable `retry_after` from the server wins over the computed
    /// exponential delay; NaN, infinite or negative values are ignored.
    pub fn record_429(&self, retry_after_secs: Option<f64>) {
        let consecutive = self.consecutive_429s.fetch_add(1, Ordering::Relaxed) + 1;

        let backoff_secs = retry_after_secs
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .unwrap_or_else(|| 2.0_f64.powi(consecutive as i32))
            .clamp(0.0, MAX_BACKOFF_SECS);
        let until = Instant::now() + Duration::from_secs_f64(backoff_secs);

        let mut guard = self.backoff_until.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none_or(|current| current < until) {
            *guard = Some(until);
        }
        drop(guard);

        warn!(
            consecutive_429s = consecutive,
            backoff_secs = backoff_secs,
            "Rate limited (429), backing off"
        );
    }

    /// Record any response that was not a 429.
    pub fn record_response(&self) {
        if self.consecutive_429s.swap(0, Ordering::Relaxed) > 0 {
            *self.backoff_until.lock().unwrap_or_else(|e| e.into_inner()) = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_wait_by_default() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.wait_time(), Duration::ZERO);
    }

    #[test]
    fn test_429_arms_backoff_and_success_clears_it() {
        let limiter = RateLimiter::new();
        limiter.record_429(Some(30.0));
        assert!(limiter.wait_time() > Duration::from_secs(29));

        limiter.record_response();
        assert_eq!(limiter.wait_time(), Duration::ZERO);
    }

    #[test]
    fn test_unusable_retry_after_falls_back_to_exponential() {
        let limiter = RateLimiter::new();
        limiter.record_429(Some(f64::NAN));
        let first = limiter.wait_time();
        assert!(first > Duration::from_secs(1) && first <= Duration::from_secs(2));

        for bad in [f64::INFINITY, -5.0] {
            limiter.record_response();
            limiter.record_429(Some(bad));
            assert!(limiter.wait_time() <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let limiter = RateLimiter::new();
        limiter.record_429(Some(3600.0));
        assert!(limiter.wait_time() <= Duration::from_secs_f64(MAX_BACKOFF_SECS));
    }

    #[tokio::test]
    async fn test_short_backoff_is_waited_out() {
        let limiter = RateLimiter::new();
        limiter.record_429(Some(0.01));
        limiter.wait_if_needed().await;
        assert_eq!(limiter.wait_time(), Duration::ZERO);
    }
}

//! Retry engine for upstream calls.
//!
//! Wraps any future-producing closure with exponential backoff. The
//! engine never interprets response bodies — it only looks at the HTTP
//! status carried by the error, honors `Retry-After` when the upstream
//! sent one, and records 429s in the caller's rate-limit tracker.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::RetryConfig;
use crate::error::{GatewayError, Result};

/// Wall-clock timestamps of observed 429 responses since process start.
///
/// Operational observable only: reset on restart, appended by the retry
/// loop, read (length + last entry) by `!status` and the metrics surface.
#[derive(Debug, Clone, Default)]
pub struct RateLimitTracker {
    hits: Arc<Mutex<Vec<DateTime<Utc>>>>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) {
        self.hits.lock().expect("rate limit tracker poisoned").push(Utc::now());
    }

    pub fn count(&self) -> usize {
        self.hits.lock().expect("rate limit tracker poisoned").len()
    }

    pub fn last_hit(&self) -> Option<DateTime<Utc>> {
        self.hits
            .lock()
            .expect("rate limit tracker poisoned")
            .last()
            .copied()
    }
}

/// Delay before retry `attempt` (1-based). A parseable `Retry-After`
/// wins over the computed backoff; both are capped at `max_delay_s`.
pub fn compute_delay(attempt: u32, config: &RetryConfig, retry_after: Option<u64>) -> Duration {
    if let Some(secs) = retry_after {
        if secs > 0 {
            return Duration::from_secs_f64((secs as f64).min(config.max_delay_s));
        }
    }
    let delay = config.initial_delay_s * config.backoff_factor.powi(attempt as i32 - 1);
    Duration::from_secs_f64(delay.min(config.max_delay_s))
}

/// Run `operation` with up to `max_retries + 1` attempts.
///
/// Errors whose status is not in `retry_on` are rethrown immediately.
/// Exhaustion maps to [`GatewayError::RateLimitExhausted`] when the last
/// status was 429, [`GatewayError::RetryExhausted`] otherwise.
pub async fn with_retry<T, F, Fut>(
    mut operation: F,
    config: &RetryConfig,
    tracker: &RateLimitTracker,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_status = 0u16;
    let mut last_error = String::new();

    for attempt in 1..=config.max_retries + 1 {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let status = e.upstream_status().unwrap_or(0);
                last_status = status;
                last_error = e.to_string();

                if !config.retry_on.contains(&status) {
                    return Err(e);
                }
                if attempt > config.max_retries {
                    break;
                }

                if status == 429 {
                    tracker.record();
                }

                let delay = compute_delay(attempt, config, e.retry_after());
                tracing::debug!(
                    attempt,
                    status,
                    delay_ms = delay.as_millis() as u64,
                    "retrying upstream call"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    if last_status == 429 {
        Err(GatewayError::RateLimitExhausted {
            attempts: config.max_retries + 1,
            retry_after: None,
        })
    } else {
        Err(GatewayError::RetryExhausted {
            attempts: config.max_retries + 1,
            last_status,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay_s: 0.001,
            backoff_factor: 1.0,
            max_delay_s: 0.01,
            retry_on: vec![429, 500, 503],
        }
    }

    fn upstream_err(status: u16) -> GatewayError {
        GatewayError::Upstream {
            status,
            message: format!("status {status}"),
            retry_after: None,
        }
    }

    #[test]
    fn delay_exponential() {
        let config = RetryConfig::default();
        assert_eq!(compute_delay(1, &config, None), Duration::from_secs(1));
        assert_eq!(compute_delay(2, &config, None), Duration::from_secs(2));
        assert_eq!(compute_delay(3, &config, None), Duration::from_secs(4));
    }

    #[test]
    fn delay_capped_at_max() {
        let config = RetryConfig {
            backoff_factor: 10.0,
            max_delay_s: 5.0,
            ..RetryConfig::default()
        };
        assert_eq!(compute_delay(5, &config, None), Duration::from_secs(5));
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let config = RetryConfig::default();
        assert_eq!(compute_delay(1, &config, Some(30)), Duration::from_secs(30));
    }

    #[test]
    fn retry_after_capped_at_max() {
        let config = RetryConfig {
            max_delay_s: 10.0,
            ..RetryConfig::default()
        };
        assert_eq!(
            compute_delay(1, &config, Some(999)),
            Duration::from_secs(10)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_status_fails_on_first_attempt() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(upstream_err(404)) }
            },
            &fast_config(3),
            &RateLimitTracker::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(GatewayError::Upstream { status: 404, .. })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_500_succeeds_on_third_attempt() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(upstream_err(500))
                    } else {
                        Ok("ok")
                    }
                }
            },
            &fast_config(3),
            &RateLimitTracker::new(),
        )
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_429_exhausts_into_rate_limit_error() {
        let attempts = AtomicU32::new(0);
        let tracker = RateLimitTracker::new();
        let result: Result<()> = with_retry(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(upstream_err(429)) }
            },
            &fast_config(2),
            &tracker,
        )
        .await;

        match result {
            Err(GatewayError::RateLimitExhausted { attempts: a, .. }) => assert_eq!(a, 3),
            other => panic!("expected RateLimitExhausted, got {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // the tracker records each 429 that led to a retry
        assert_eq!(tracker.count(), 2);
        assert!(tracker.last_hit().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_500_exhausts_into_retry_error() {
        let result: Result<()> = with_retry(
            || async { Err(upstream_err(500)) },
            &fast_config(1),
            &RateLimitTracker::new(),
        )
        .await;

        match result {
            Err(GatewayError::RetryExhausted {
                attempts,
                last_status,
                ..
            }) => {
                assert_eq!(attempts, 2);
                assert_eq!(last_status, 500);
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::Network("connection refused".into())) }
            },
            &fast_config(3),
            &RateLimitTracker::new(),
        )
        .await;

        assert!(matches!(result, Err(GatewayError::Network(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}

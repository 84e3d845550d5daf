//! Retry with exponential backoff and jitter.
//!
//! Every attempt gets its own [`CancellationToken`]. When an attempt exceeds
//! its deadline the token is cancelled and the attempt future is dropped, so
//! the in-flight work actually stops instead of finishing in the background.

use super::classify::{classify_error, EnhancedError, RawError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for retry logic
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the exponential delay added as random jitter (0.0..=1.0).
    pub jitter_factor: f64,
    /// Per-attempt deadline.
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            jitter_factor: 0.1,
            timeout: Duration::from_millis(30_000),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_base_delay(mut self, d: Duration) -> Self {
        self.base_delay = d;
        self
    }

    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.max_delay = d;
        self
    }

    pub fn with_jitter_factor(mut self, f: f64) -> Self {
        self.jitter_factor = f;
        self
    }

    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout = d;
        self
    }

    /// Total number of attempts this config allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Delay before the retry that follows failed attempt `attempt` (0-based).
///
/// `random` is a sample from `[0, 1)`; it scales the jitter component.
pub fn backoff_delay(config: &RetryConfig, attempt: u32, random: f64) -> Duration {
    let base_ms = config.base_delay.as_millis() as f64;
    let exponential = base_ms * 2f64.powi(attempt.min(62) as i32);
    let jitter = random * config.jitter_factor * exponential;
    let capped = (exponential + jitter).min(config.max_delay.as_millis() as f64);
    Duration::from_millis(capped.max(0.0) as u64)
}

/// Passed to the `on_retry` callback before each backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    pub delay: Duration,
    pub error: EnhancedError,
}

/// Run `operation` with retries, backoff and a per-attempt timeout.
///
/// Only classified errors escape. Attempts are strictly sequential.
pub async fn retry_with_backoff<T, F, Fut>(
    operation: F,
    config: &RetryConfig,
    on_retry: Option<&mut (dyn FnMut(&RetryEvent) + Send)>,
) -> Result<T, EnhancedError>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, RawError>>,
{
    retry_with_cancellation(operation, config, on_retry, &CancellationToken::new()).await
}

/// Like [`retry_with_backoff`], but stops as soon as `parent` is cancelled.
///
/// Cancellation surfaces as an abort, which classifies as non-retryable.
pub async fn retry_with_cancellation<T, F, Fut>(
    mut operation: F,
    config: &RetryConfig,
    mut on_retry: Option<&mut (dyn FnMut(&RetryEvent) + Send)>,
    parent: &CancellationToken,
) -> Result<T, EnhancedError>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, RawError>>,
{
    let max_attempts = config.max_attempts();
    let mut attempt: u32 = 0;

    loop {
        let token = parent.child_token();
        let outcome = tokio::select! {
            biased;
            _ = parent.cancelled() => Err(RawError::aborted()),
            res = tokio::time::timeout(config.timeout, operation(token.clone())) => match res {
                Ok(inner) => inner,
                Err(elapsed) => {
                    token.cancel();
                    Err(RawError::from(elapsed))
                }
            },
        };

        let raw = match outcome {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(raw) => raw,
        };

        let error = classify_error(&raw);
        if !error.retryable {
            debug!(kind = %error.kind, detail = %error.detail, "non-retryable error");
            return Err(error);
        }
        if attempt + 1 >= max_attempts {
            warn!(
                kind = %error.kind,
                attempts = max_attempts,
                detail = %error.detail,
                "retries exhausted"
            );
            return Err(error);
        }

        let delay = backoff_delay(config, attempt, rand::thread_rng().gen::<f64>());
        attempt += 1;
        warn!(
            attempt,
            kind = %error.kind,
            delay_ms = delay.as_millis() as u64,
            "attempt failed, retrying"
        );
        if let Some(cb) = on_retry.as_mut() {
            cb(&RetryEvent {
                attempt,
                delay,
                error,
            });
        }

        tokio::select! {
            biased;
            _ = parent.cancelled() => return Err(classify_error(&RawError::aborted())),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::ErrorKind;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig::new()
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_timeout(Duration::from_millis(200))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let cfg = RetryConfig::default();
        assert_eq!(backoff_delay(&cfg, 0, 0.0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&cfg, 1, 0.0), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&cfg, 2, 0.0), Duration::from_millis(4000));
        assert_eq!(backoff_delay(&cfg, 4, 0.0), Duration::from_millis(10_000));
        assert_eq!(backoff_delay(&cfg, 40, 0.99), Duration::from_millis(10_000));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let cfg = RetryConfig::default();
        // 1000ms * 0.1 * 0.5 = 50ms of jitter
        assert_eq!(backoff_delay(&cfg, 0, 0.5), Duration::from_millis(1050));
        let upper = backoff_delay(&cfg, 1, 0.999_999);
        assert!(upper >= Duration::from_millis(2000) && upper <= Duration::from_millis(2200));
    }

    #[test]
    fn test_defaults() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.max_attempts(), 4);
        assert_eq!(cfg.timeout, Duration::from_secs(30));
        assert_eq!(cfg.jitter_factor, 0.1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let mut record = |e: &RetryEvent| retries.push(e.attempt);
        let result = retry_with_backoff(
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(RawError::http(503, "unavailable"))
                    } else {
                        Ok("schedule")
                    }
                }
            },
            &fast(),
            Some(&mut record),
        )
        .await;
        assert_eq!(result.unwrap(), "schedule");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_timeout_cancels_attempt() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let cfg = fast()
            .with_max_retries(0)
            .with_timeout(Duration::from_millis(20));
        let flag = cancelled.clone();
        let result: Result<(), _> = retry_with_backoff(
            move |token| {
                let flag = flag.clone();
                async move {
                    tokio::spawn(async move {
                        token.cancelled().await;
                        flag.store(true, Ordering::SeqCst);
                    });
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            },
            &cfg,
            None,
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_parent_cancellation_aborts() {
        let parent = CancellationToken::new();
        parent.cancel();
        let result: Result<(), _> = retry_with_cancellation(
            |_| async { Err(RawError::http(503, "unavailable")) },
            &fast(),
            None,
            &parent,
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
        assert!(!err.retryable);
    }
}

//! Graceful degradation: substitute a registered fallback when the primary
//! operation fails hard after exhausting its retries.

use super::classify::{classify_error, EnhancedError, RawError};
use super::retry::{retry_with_backoff, RetryConfig, RetryEvent};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct DegradationConfig {
    pub retry: RetryConfig,
    /// Gates fallback for both high and critical severities.
    pub enable_fallback: bool,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            enable_fallback: true,
        }
    }
}

impl DegradationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_enable_fallback(mut self, enable: bool) -> Self {
        self.enable_fallback = enable;
        self
    }
}

type FallbackFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, RawError>> + Send + Sync>;

/// Registry of fallback producers keyed by operation type (e.g. `"chat"`).
pub struct GracefulDegradationManager<T> {
    fallbacks: RwLock<HashMap<String, FallbackFn<T>>>,
}

impl<T: Send + 'static> GracefulDegradationManager<T> {
    pub fn new() -> Self {
        Self {
            fallbacks: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_fallback<F, Fut>(&self, operation_type: impl Into<String>, fallback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RawError>> + Send + 'static,
    {
        let f: FallbackFn<T> = Arc::new(move || Box::pin(fallback()));
        self.fallbacks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(operation_type.into(), f);
    }

    pub fn unregister_fallback(&self, operation_type: &str) -> bool {
        self.fallbacks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(operation_type)
            .is_some()
    }

    pub fn has_fallback(&self, operation_type: &str) -> bool {
        self.fallbacks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(operation_type)
    }

    fn fallback_for(&self, operation_type: &str) -> Option<FallbackFn<T>> {
        self.fallbacks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(operation_type)
            .cloned()
    }

    /// Run `primary` with retries; on a severe terminal failure, try the
    /// registered fallback. A failing or missing fallback yields the
    /// primary's classified error.
    pub async fn execute_with_degradation<F, Fut>(
        &self,
        operation_type: &str,
        primary: F,
        config: &DegradationConfig,
    ) -> Result<T, EnhancedError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, RawError>>,
    {
        self.execute_observed(operation_type, primary, config, None)
            .await
            .map(|(value, _)| value)
    }

    /// Same as [`execute_with_degradation`], reporting retries to `on_retry`
    /// and whether the value came from the fallback.
    ///
    /// [`execute_with_degradation`]: Self::execute_with_degradation
    pub async fn execute_observed<F, Fut>(
        &self,
        operation_type: &str,
        primary: F,
        config: &DegradationConfig,
        on_retry: Option<&mut (dyn FnMut(&RetryEvent) + Send)>,
    ) -> Result<(T, bool), EnhancedError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, RawError>>,
    {
        let error = match retry_with_backoff(primary, &config.retry, on_retry).await {
            Ok(value) => return Ok((value, false)),
            Err(error) => error,
        };

        if !(config.enable_fallback && error.severity.is_severe()) {
            return Err(error);
        }
        let Some(fallback) = self.fallback_for(operation_type) else {
            return Err(error);
        };

        info!(operation_type, kind = %error.kind, "primary failed, using fallback");
        match fallback().await {
            Ok(value) => Ok((value, true)),
            Err(raw) => {
                let fallback_error = classify_error(&raw);
                warn!(
                    operation_type,
                    fallback_kind = %fallback_error.kind,
                    detail = %fallback_error.detail,
                    "fallback failed"
                );
                Err(error)
            }
        }
    }
}

impl<T: Send + 'static> Default for GracefulDegradationManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{ErrorKind, Severity};
    use std::time::Duration;

    fn quick() -> DegradationConfig {
        DegradationConfig::new().with_retry(
            RetryConfig::new()
                .with_max_retries(1)
                .with_base_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(2)),
        )
    }

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let mgr = GracefulDegradationManager::<String>::new();
        mgr.register_fallback("chat", || async { Ok("fallback".to_string()) });
        let out = mgr
            .execute_with_degradation("chat", |_| async { Ok("primary".to_string()) }, &quick())
            .await;
        assert_eq!(out.unwrap(), "primary");
    }

    #[tokio::test]
    async fn test_high_severity_uses_fallback() {
        let mgr = GracefulDegradationManager::<String>::new();
        mgr.register_fallback("chat", || async { Ok("cached timetable".to_string()) });
        let out = mgr
            .execute_observed(
                "chat",
                |_| async { Err(RawError::http(502, "bad gateway")) },
                &quick(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out, ("cached timetable".to_string(), true));
    }

    #[tokio::test]
    async fn test_medium_severity_does_not_degrade() {
        let mgr = GracefulDegradationManager::<String>::new();
        mgr.register_fallback("chat", || async { Ok("unused".to_string()) });
        let err = mgr
            .execute_with_degradation(
                "chat",
                |_| async { Err(RawError::new("network down")) },
                &quick(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
        assert_eq!(err.severity, Severity::Medium);
    }

    #[tokio::test]
    async fn test_disabled_fallback_propagates() {
        let mgr = GracefulDegradationManager::<String>::new();
        mgr.register_fallback("chat", || async { Ok("unused".to_string()) });
        let cfg = quick().with_enable_fallback(false);
        let err = mgr
            .execute_with_degradation("chat", |_| async { Err(RawError::http(500, "boom")) }, &cfg)
            .await
            .unwrap_err();
        assert_eq!(err.severity, Severity::High);
    }

    #[tokio::test]
    async fn test_failing_fallback_returns_original_error() {
        let mgr = GracefulDegradationManager::<String>::new();
        mgr.register_fallback("chat", || async { Err(RawError::new("invalid fallback")) });
        let err = mgr
            .execute_with_degradation("chat", |_| async { Err(RawError::http(503, "down")) }, &quick())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
        assert_eq!(err.status, Some(503));
    }

    #[tokio::test]
    async fn test_missing_fallback_propagates() {
        let mgr = GracefulDegradationManager::<u32>::new();
        assert!(!mgr.has_fallback("parse"));
        let err = mgr
            .execute_with_degradation("parse", |_| async { Err(RawError::new("odd")) }, &quick())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unknown);
    }

    #[test]
    fn test_register_and_unregister() {
        let mgr = GracefulDegradationManager::<u32>::new();
        mgr.register_fallback("parse", || async { Ok(0) });
        assert!(mgr.has_fallback("parse"));
        assert!(mgr.unregister_fallback("parse"));
        assert!(!mgr.has_fallback("parse"));
    }
}

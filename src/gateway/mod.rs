//! 聊天网关模块：按顺序组合限流、响应缓存、重试与优雅降级。
//!
//! Chat request orchestration.
//!
//! [`ChatGateway`] is what a chat endpoint calls for every inbound message:
//!
//! 1. the client identity is checked against the [`RateLimiter`]; a rejection
//!    becomes [`Error::RateLimited`] carrying a ready-to-send 429 response
//! 2. cacheable prompts are looked up in the [`ResponseCache`]
//! 3. the model call runs with retries and, on severe failures, the `"chat"`
//!    fallback registered on the builder
//! 4. fresh replies to cacheable prompts are stored
//!
//! The gateway owns the background sweepers for its components and stops
//! them on [`ChatGateway::shutdown`] (or when dropped).
//!
//! ```rust,no_run
//! use planner_resilience::gateway::ChatGatewayBuilder;
//! use planner_resilience::recovery::RawError;
//! use reqwest::header::HeaderMap;
//!
//! # async fn run() -> planner_resilience::Result<()> {
//! let gateway = ChatGatewayBuilder::<String>::new()
//!     .register_fallback("chat", || async { Ok("Showing your saved schedule.".to_string()) })
//!     .build()?;
//!
//! let reply = gateway
//!     .handle(&HeaderMap::new(), "What do I have on Monday?", |_cancel| async {
//!         Err::<String, _>(RawError::http(503, "model unavailable"))
//!     })
//!     .await?;
//! assert!(reply.degraded);
//! gateway.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::cache::{is_cacheable, ResponseCache};
use crate::config::ResilienceConfig;
use crate::error::{Error, ErrorContext};
use crate::recovery::{GracefulDegradationManager, RawError, RetryEvent, StreamingRecoveryManager};
use crate::resilience::{spawn_sweeper, KeyFn, RateLimitDecision, RateLimiter, SweepHandle};
use crate::telemetry::PerformanceMonitor;
use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Operation type under which the chat fallback is registered.
pub const CHAT_OPERATION: &str = "chat";

/// A request turned away by the rate limiter, rendered as an HTTP 429.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRejection {
    pub limit: u32,
    pub reset_time: DateTime<Utc>,
    pub retry_after_secs: u64,
}

impl RateLimitRejection {
    pub const STATUS: u16 = 429;

    pub fn from_decision(decision: &RateLimitDecision) -> Self {
        Self {
            limit: decision.limit,
            reset_time: decision.reset_time,
            retry_after_secs: decision.retry_after_secs(),
        }
    }

    pub fn status(&self) -> u16 {
        Self::STATUS
    }

    /// ISO-8601 reset time with millisecond precision.
    pub fn reset_time_iso(&self) -> String {
        self.reset_time.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn message(&self) -> String {
        format!(
            "Rate limit exceeded. Please try again in {} seconds.",
            self.retry_after_secs
        )
    }

    /// `{ "error", "message", "resetTime" }`
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": "Too many requests",
            "message": self.message(),
            "resetTime": self.reset_time_iso(),
        })
    }

    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from(self.retry_after_secs));
        if let Ok(v) = HeaderValue::from_str(&self.reset_time_iso()) {
            headers.insert("x-ratelimit-reset", v);
        }
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(0u32));
        headers
    }
}

impl fmt::Display for RateLimitRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// A successful chat reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply<T> {
    pub value: T,
    pub request_id: String,
    /// Served from the response cache without calling the model.
    pub cached: bool,
    /// Produced by the registered fallback instead of the model.
    pub degraded: bool,
}

pub struct ChatGatewayBuilder<T> {
    config: ResilienceConfig,
    key_fn: Option<KeyFn>,
    monitor: Option<Arc<PerformanceMonitor>>,
    degradation: GracefulDegradationManager<T>,
    spawn_sweepers: bool,
}

impl<T> ChatGatewayBuilder<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            config: ResilienceConfig::default(),
            key_fn: None,
            monitor: None,
            degradation: GracefulDegradationManager::new(),
            spawn_sweepers: true,
        }
    }

    pub fn with_config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default `x-forwarded-for` + `user-agent` client identity.
    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = Some(key_fn);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Skip the background sweepers (expired entries are still dropped lazily).
    pub fn without_sweepers(mut self) -> Self {
        self.spawn_sweepers = false;
        self
    }

    pub fn register_fallback<F, Fut>(self, operation_type: impl Into<String>, fallback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, RawError>> + Send + 'static,
    {
        self.degradation.register_fallback(operation_type, fallback);
        self
    }

    /// Validate the config and start the gateway.
    ///
    /// Sweepers are spawned on the current tokio runtime, so this must be
    /// called from within one unless [`without_sweepers`](Self::without_sweepers) was used.
    pub fn build(self) -> Result<ChatGateway<T>> {
        self.config.validate()?;

        let limiter = Arc::new(match self.key_fn {
            Some(key_fn) => RateLimiter::with_key_fn(self.config.rate_limit.clone(), key_fn),
            None => RateLimiter::new(self.config.rate_limit.clone()),
        });
        let cache = Arc::new(ResponseCache::new(self.config.cache.clone()));
        let streaming = Arc::new(StreamingRecoveryManager::with_max_age(
            self.config.streaming_max_age,
        ));

        let mut sweepers = Vec::new();
        if self.spawn_sweepers {
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(Error::runtime_with_context(
                    "no tokio runtime available for background sweepers",
                    ErrorContext::new()
                        .with_details("build inside a runtime or call without_sweepers()")
                        .with_source("chat_gateway"),
                ));
            }
            let intervals = &self.config.sweep;
            sweepers.push(spawn_sweeper(limiter.clone(), intervals.rate_limiter));
            sweepers.push(spawn_sweeper(cache.clone(), intervals.cache));
            sweepers.push(spawn_sweeper(streaming.clone(), intervals.streaming));
        }

        info!(
            max_requests = self.config.rate_limit.max_requests,
            window_ms = self.config.rate_limit.window.as_millis() as u64,
            cache_max_size = self.config.cache.max_size,
            max_retries = self.config.retry().max_retries,
            enable_fallback = self.config.degradation.enable_fallback,
            sweepers = sweepers.len(),
            "chat gateway started"
        );

        Ok(ChatGateway {
            config: self.config,
            limiter,
            cache,
            streaming,
            degradation: self.degradation,
            monitor: self.monitor.unwrap_or_default(),
            sweepers: Mutex::new(sweepers),
        })
    }
}

impl<T> Default for ChatGatewayBuilder<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

pub struct ChatGateway<T> {
    config: ResilienceConfig,
    limiter: Arc<RateLimiter>,
    cache: Arc<ResponseCache>,
    streaming: Arc<StreamingRecoveryManager>,
    degradation: GracefulDegradationManager<T>,
    monitor: Arc<PerformanceMonitor>,
    sweepers: Mutex<Vec<SweepHandle>>,
}

impl<T> ChatGateway<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn builder() -> ChatGatewayBuilder<T> {
        ChatGatewayBuilder::new()
    }

    /// Run one chat turn for the client identified by `headers`.
    ///
    /// `operation` is the model call. It receives a per-attempt cancellation
    /// token and may be invoked several times.
    pub async fn handle<F, Fut>(&self, headers: &HeaderMap, input: &str, operation: F) -> Result<ChatReply<T>>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, RawError>>,
    {
        let started = Instant::now();
        let request_id = uuid::Uuid::new_v4().to_string();
        self.monitor.record_request();

        let decision = self.limiter.check_limit(headers);
        if !decision.allowed {
            self.monitor.record_rate_limited();
            let rejection = RateLimitRejection::from_decision(&decision);
            info!(
                request_id = %request_id,
                retry_after_secs = rejection.retry_after_secs,
                "chat request rate limited"
            );
            return Err(Error::RateLimited(rejection));
        }

        let cacheable = is_cacheable(input);
        if cacheable {
            if let Some(value) = self.cache.get::<T>(input) {
                self.monitor.record_cache_hit();
                self.monitor.record_latency(started.elapsed());
                debug!(request_id = %request_id, "served from response cache");
                return Ok(ChatReply { value, request_id, cached: true, degraded: false });
            }
            self.monitor.record_cache_miss();
        }

        let monitor = &self.monitor;
        let rid = request_id.as_str();
        let mut on_retry = |event: &RetryEvent| {
            monitor.record_retry();
            debug!(
                request_id = %rid,
                attempt = event.attempt,
                delay_ms = event.delay.as_millis() as u64,
                kind = %event.error.kind,
                "retrying chat operation"
            );
        };

        let outcome = self
            .degradation
            .execute_observed(CHAT_OPERATION, operation, &self.config.degradation, Some(&mut on_retry))
            .await;

        match outcome {
            Ok((value, degraded)) => {
                if degraded {
                    self.monitor.record_degraded();
                } else if cacheable {
                    if let Err(e) = self.cache.set(input, &value) {
                        warn!(request_id = %request_id, error = %e, "failed to cache chat reply");
                    }
                }
                self.monitor.record_latency(started.elapsed());
                Ok(ChatReply { value, request_id, cached: false, degraded })
            }
            Err(error) => {
                self.monitor.record_failure();
                warn!(
                    request_id = %request_id,
                    kind = %error.kind,
                    severity = ?error.severity,
                    detail = %error.detail,
                    "chat request failed"
                );
                Err(Error::Classified(error))
            }
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn streaming(&self) -> &Arc<StreamingRecoveryManager> {
        &self.streaming
    }

    pub fn degradation(&self) -> &GracefulDegradationManager<T> {
        &self.degradation
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// Stop every background sweeper and wait for them to exit.
    pub async fn shutdown(&self) {
        let handles: Vec<SweepHandle> = {
            let mut guard = self.sweepers.lock().unwrap_or_else(|p| p.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            handle.shutdown().await;
        }
        debug!("chat gateway stopped");
    }
}

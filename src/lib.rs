//! # planner-resilience
//!
//! 学生日程助手聊天接口的韧性层：限流、响应缓存、错误分类、重试退避、流式恢复与优雅降级。
//!
//! Resilience layer for the student-planner chat endpoint.
//!
//! ## Overview
//!
//! Every chat turn goes through the same guard rails before and after the
//! model is called. Inbound traffic is throttled per client, prompts that
//! normalize to something already answered are served from memory, and
//! failed model calls are classified into a small taxonomy that drives
//! retries, fallbacks and the message the student finally sees.
//!
//! ## Key Features
//!
//! - **Rate Limiting**: fixed-window counters keyed by forwarded IP and user agent
//! - **Response Caching**: normalized-prompt keys, TTL expiry, insertion-order eviction
//! - **Error Classification**: status codes, headers and messages mapped to [`recovery::ErrorKind`]
//! - **Retry**: exponential backoff with jitter and a cancellable per-attempt timeout
//! - **Streaming Recovery**: partial output kept per message so a broken stream can resume
//! - **Graceful Degradation**: registered fallbacks for high and critical failures
//! - **Gateway**: [`ChatGateway`] composes all of the above for one chat turn
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use planner_resilience::{ChatGatewayBuilder, ResilienceConfig};
//! use planner_resilience::recovery::RawError;
//! use reqwest::header::HeaderMap;
//!
//! #[tokio::main]
//! async fn main() -> planner_resilience::Result<()> {
//!     let gateway = ChatGatewayBuilder::<String>::new()
//!         .with_config(ResilienceConfig::load(None)?)
//!         .build()?;
//!
//!     let reply = gateway
//!         .handle(&HeaderMap::new(), "Add CS101 on Monday at 9am", |_cancel| async {
//!             Ok::<_, RawError>("Added CS101 to Monday 9:00.".to_string())
//!         })
//!         .await?;
//!     println!("{} (cached: {})", reply.value, reply.cached);
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`gateway`] | Per-request orchestration and the 429 response |
//! | [`resilience`] | Rate limiter and background sweepers |
//! | [`cache`] | Response cache and key normalization |
//! | [`recovery`] | Classification, retry, streaming recovery, degradation |
//! | [`config`] | Layered configuration (defaults, file, environment) |
//! | [`telemetry`] | Performance counters |

pub mod cache;
pub mod config;
pub mod gateway;
pub mod recovery;
pub mod resilience;
pub mod telemetry;

// Re-export main types for convenience
pub use cache::{CacheConfig, ResponseCache};
pub use config::ResilienceConfig;
pub use gateway::{ChatGateway, ChatGatewayBuilder, ChatReply, RateLimitRejection};
pub use recovery::{
    classify_error, EnhancedError, ErrorKind, GracefulDegradationManager, RawError, RetryConfig,
    Severity, StreamingRecoveryManager,
};
pub use resilience::{RateLimiter, RateLimiterConfig};
pub use telemetry::{PerformanceMonitor, PerformanceSnapshot};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};

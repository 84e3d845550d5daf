//! 错误恢复模块：提供错误分类、退避重试、流式恢复与优雅降级。
//!
//! # Error Recovery
//!
//! Everything that happens between "the model call failed" and "the user sees
//! an answer or a readable error":
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`classify`] | Maps raw failures onto [`ErrorKind`] / [`Severity`] |
//! | [`retry`] | Exponential backoff with jitter and per-attempt timeouts |
//! | [`streaming`] | Keeps partial output of interrupted streams |
//! | [`degradation`] | Registered fallbacks for severe terminal failures |
//!
//! ```rust
//! use planner_resilience::recovery::{classify_error, ErrorKind, RawError};
//!
//! let raw = RawError::http(429, "slow down").with_header("retry-after", "45");
//! let e = classify_error(&raw);
//! assert_eq!(e.kind, ErrorKind::RateLimit);
//! assert_eq!(e.retry_after, Some(45));
//! ```

pub mod classify;
pub mod degradation;
pub mod retry;
pub mod streaming;

pub use classify::{
    classify_error, EnhancedError, ErrorKind, ErrorOrigin, RawError, Severity,
    DEFAULT_RETRY_AFTER_SECS,
};
pub use degradation::{DegradationConfig, GracefulDegradationManager};
pub use retry::{backoff_delay, retry_with_backoff, retry_with_cancellation, RetryConfig, RetryEvent};
pub use streaming::{
    RecoveryStrategy, StreamingRecoveryManager, StreamingRecoveryState, DEFAULT_MAX_STATE_AGE,
};

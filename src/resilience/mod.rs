//! 弹性模式模块：提供按客户端的固定窗口限流与后台过期清理。
//!
//! # Resilience Primitives Module
//!
//! Inbound protection for the chat endpoint and the housekeeping that keeps
//! its in-memory state bounded.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`rate_limiter`] | Fixed-window request counter keyed by client identity |
//! | [`sweeper`] | Periodic expiry sweeps with explicit shutdown |
//!
//! ## Rate Limiter
//!
//! ```rust
//! use planner_resilience::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
//! use std::time::Duration;
//!
//! let limiter = RateLimiter::new(
//!     RateLimiterConfig::new()
//!         .with_max_requests(2)
//!         .with_window(Duration::from_secs(1)),
//! );
//!
//! assert!(limiter.check_key("203.0.113.7:planner").allowed);
//! assert!(limiter.check_key("203.0.113.7:planner").allowed);
//! assert!(!limiter.check_key("203.0.113.7:planner").allowed);
//! ```

pub mod rate_limiter;
pub mod sweeper;

pub use rate_limiter::{default_client_key, KeyFn, RateLimitDecision, RateLimiter, RateLimiterConfig};
pub use sweeper::{spawn_sweeper, Sweep, SweepHandle};

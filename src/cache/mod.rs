//! 响应缓存模块：按规范化提示词缓存模型回复，支持 TTL 过期与按插入顺序淘汰。
//!
//! # Response Caching Module
//!
//! Memoizes model responses for prompts that are equivalent up to case,
//! whitespace and punctuation.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ResponseCache`] | Bounded TTL cache with insertion-order eviction |
//! | [`CacheConfig`] | Capacity and default TTL |
//! | [`CacheKey`] | Normalized input plus its `cache_<n>` signature |
//! | [`is_cacheable`] | Whether a prompt is worth caching at all |
//!
//! ## Example
//!
//! ```rust
//! use planner_resilience::cache::{CacheConfig, ResponseCache};
//! use std::time::Duration;
//!
//! let cache = ResponseCache::new(
//!     CacheConfig::new()
//!         .with_max_size(50)
//!         .with_ttl(Duration::from_secs(600)),
//! );
//! cache.set("Add CS101 on Monday!", &"added").unwrap();
//! assert_eq!(cache.get::<String>("add cs101 on monday"), Some("added".to_string()));
//! ```
//!
//! A hit requires both the signature and the normalized input to match, so
//! two prompts whose signatures collide never share an entry.

mod key;
mod manager;

pub use key::{generate_key, is_cacheable, normalize_input, signature, CacheKey};
pub use manager::{CacheConfig, CacheStats, ResponseCache};

//! 性能监控模块：统计聊天请求的限流、缓存命中、重试与降级情况。
//!
//! Performance monitoring for the chat path.
//!
//! A [`PerformanceMonitor`] is a set of lock-free counters handed to the
//! gateway at construction time. Nothing here is global: tests and embedders
//! create their own instance and read it back through [`PerformanceMonitor::snapshot`].
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`PerformanceMonitor`] | Atomic request/cache/retry/degradation counters |
//! | [`PerformanceSnapshot`] | Point-in-time copy with derived ratios |

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    requests: AtomicU64,
    rate_limited: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    degraded: AtomicU64,
    completed: AtomicU64,
    latency_micros: AtomicU64,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the wall time of a request that produced a reply (cached or not).
    pub fn record_latency(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let total_latency = self.latency_micros.load(Ordering::Relaxed);
        let average_latency = if completed == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(total_latency / completed)
        };
        PerformanceSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            completed,
            average_latency_ms: average_latency.as_secs_f64() * 1000.0,
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.requests,
            &self.rate_limited,
            &self.cache_hits,
            &self.cache_misses,
            &self.retries,
            &self.failures,
            &self.degraded,
            &self.completed,
            &self.latency_micros,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Counter values at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    pub requests: u64,
    pub rate_limited: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub retries: u64,
    pub failures: u64,
    pub degraded: u64,
    pub completed: u64,
    pub average_latency_ms: f64,
}

impl PerformanceSnapshot {
    pub fn cache_hit_ratio(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }

    /// Share of requests that ended in a classified error.
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.failures as f64 / self.requests as f64
        }
    }
}

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Windows longer than this are clamped when computing reset times.
const MAX_WINDOW_HORIZON: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Derives the client identity from inbound request headers.
pub type KeyFn = Arc<dyn Fn(&HeaderMap) -> String + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length. Windows are fixed, not sliding.
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 20,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_requests(mut self, n: u32) -> Self {
        self.max_requests = n;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

#[derive(Debug, Clone)]
struct RateLimitEntry {
    count: u32,
    reset_at: Instant,
    reset_time: DateTime<Utc>,
}

impl RateLimitEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.reset_at
    }
}

/// Outcome of a single [`RateLimiter::check_limit`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    /// Wall-clock time at which the current window closes.
    pub reset_time: DateTime<Utc>,
    pub reset_at: Instant,
}

impl RateLimitDecision {
    /// Whole seconds until the window closes, rounded up (at least 1).
    pub fn retry_after_secs(&self) -> u64 {
        let left = self.reset_at.saturating_duration_since(Instant::now());
        let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
        secs.max(1)
    }

    /// `X-RateLimit-*` headers describing this decision.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        if let Ok(v) = HeaderValue::from_str(&self.reset_time.to_rfc3339()) {
            headers.insert("x-ratelimit-reset", v);
        }
        headers
    }
}

/// First `x-forwarded-for` hop joined with the user agent.
pub fn default_client_key(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };
    let ip = header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown");
    let agent = header("user-agent").unwrap_or("unknown");
    format!("{ip}:{agent}")
}

/// Fixed-window request counter keyed by client identity.
///
/// - One entry per key; expired entries are replaced, not merged
/// - Increments for a key are serialized by the map lock
/// - Never fails: exceeding the limit is an ordinary decision
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    key_fn: KeyFn,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        Self::with_key_fn(cfg, Arc::new(default_client_key))
    }

    pub fn with_key_fn(cfg: RateLimiterConfig, key_fn: KeyFn) -> Self {
        Self {
            cfg,
            key_fn,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RateLimitEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("rate limiter lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Identity for an inbound request, as used by [`check_limit`](Self::check_limit).
    pub fn client_key(&self, headers: &HeaderMap) -> String {
        (self.key_fn)(headers)
    }

    /// Count a request from the client identified by `headers`.
    pub fn check_limit(&self, headers: &HeaderMap) -> RateLimitDecision {
        let key = self.client_key(headers);
        self.check_key(&key)
    }

    /// Count a request for an already-derived key.
    pub fn check_key(&self, key: &str) -> RateLimitDecision {
        let max = self.cfg.max_requests;
        let now = Instant::now();
        let mut entries = self.lock();

        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                if entry.count >= max {
                    debug!(key, count = entry.count, "rate limit exceeded");
                    return RateLimitDecision {
                        allowed: false,
                        remaining: 0,
                        limit: max,
                        reset_time: entry.reset_time,
                        reset_at: entry.reset_at,
                    };
                }
                entry.count += 1;
                RateLimitDecision {
                    allowed: true,
                    remaining: max - entry.count,
                    limit: max,
                    reset_time: entry.reset_time,
                    reset_at: entry.reset_at,
                }
            }
            _ => {
                let window = self.cfg.window.min(MAX_WINDOW_HORIZON);
                let entry = RateLimitEntry {
                    count: 1,
                    reset_at: now.checked_add(window).unwrap_or(now),
                    reset_time: chrono::Duration::from_std(window)
                        .ok()
                        .and_then(|d| Utc::now().checked_add_signed(d))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                };
                let decision = RateLimitDecision {
                    allowed: true,
                    remaining: max.saturating_sub(1),
                    limit: max,
                    reset_time: entry.reset_time,
                    reset_at: entry.reset_at,
                };
                entries.insert(key.to_string(), entry);
                decision
            }
        }
    }

    /// Remove every entry whose window has closed. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    /// Number of tracked keys, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }
}

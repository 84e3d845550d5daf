//! Resilience configuration.
//!
//! Values are resolved in layers, later layers winning:
//!
//! 1. built-in defaults ([`ResilienceConfig::default`])
//! 2. a YAML or JSON file (explicit path, or `PLANNER_RESILIENCE_CONFIG`)
//! 3. `PLANNER_*` environment variables
//!
//! File keys use camelCase and every key is optional:
//!
//! ```yaml
//! rateLimit:
//!   maxRequests: 30
//!   windowMs: 60000
//! cache:
//!   maxSize: 200
//!   defaultTtl: 300000
//! retry:
//!   maxRetries: 2
//!   baseDelay: 500
//!   maxDelay: 8000
//!   jitterFactor: 0.2
//!   timeoutMs: 20000
//! enableFallback: true
//! ```

use crate::cache::CacheConfig;
use crate::error::{Error, ErrorContext};
use crate::recovery::{DegradationConfig, RetryConfig, DEFAULT_MAX_STATE_AGE};
use crate::resilience::RateLimiterConfig;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable naming a config file to load.
pub const CONFIG_PATH_ENV: &str = "PLANNER_RESILIENCE_CONFIG";

/// Longest rate-limit window accepted from configuration.
pub const MAX_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// How often each background sweeper runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepIntervals {
    pub rate_limiter: Duration,
    pub cache: Duration,
    pub streaming: Duration,
}

impl Default for SweepIntervals {
    fn default() -> Self {
        Self {
            rate_limiter: Duration::from_secs(60),
            cache: Duration::from_secs(5 * 60),
            streaming: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    pub rate_limit: RateLimiterConfig,
    pub cache: CacheConfig,
    pub degradation: DegradationConfig,
    pub sweep: SweepIntervals,
    pub streaming_max_age: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimiterConfig::default(),
            cache: CacheConfig::default(),
            degradation: DegradationConfig::default(),
            sweep: SweepIntervals::default(),
            streaming_max_age: DEFAULT_MAX_STATE_AGE,
        }
    }
}

impl ResilienceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate_limit(mut self, cfg: RateLimiterConfig) -> Self {
        self.rate_limit = cfg;
        self
    }

    pub fn with_cache(mut self, cfg: CacheConfig) -> Self {
        self.cache = cfg;
        self
    }

    pub fn with_degradation(mut self, cfg: DegradationConfig) -> Self {
        self.degradation = cfg;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.degradation.retry = retry;
        self
    }

    pub fn with_sweep_intervals(mut self, sweep: SweepIntervals) -> Self {
        self.sweep = sweep;
        self
    }

    pub fn with_streaming_max_age(mut self, max_age: Duration) -> Self {
        self.streaming_max_age = max_age;
        self
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.degradation.retry
    }

    /// Defaults, overlaid with `path` (if given, else `PLANNER_RESILIENCE_CONFIG`),
    /// overlaid with environment variables, then validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = Self::new();
        let env_path = std::env::var(CONFIG_PATH_ENV).ok().filter(|p| !p.is_empty());
        match (path, env_path.as_deref()) {
            (Some(p), _) => PartialResilienceConfig::from_file(p)?.apply(&mut cfg),
            (None, Some(p)) => PartialResilienceConfig::from_file(Path::new(p))?.apply(&mut cfg),
            (None, None) => {}
        }
        PartialResilienceConfig::from_env().apply(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overlaid with environment variables only.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::new();
        PartialResilienceConfig::from_env().apply(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &str, details: String) -> Error {
            Error::configuration_with_context(
                format!("invalid value for {}", field),
                ErrorContext::new()
                    .with_field_path(field)
                    .with_details(details)
                    .with_source("config_validation"),
            )
        }

        if self.rate_limit.max_requests < 1 {
            return Err(invalid("rateLimit.maxRequests", "must be at least 1".into()));
        }
        if self.rate_limit.window.is_zero() {
            return Err(invalid("rateLimit.windowMs", "must be positive".into()));
        }
        if self.rate_limit.window > MAX_RATE_LIMIT_WINDOW {
            return Err(invalid(
                "rateLimit.windowMs",
                format!(
                    "{}ms exceeds the {}ms maximum",
                    self.rate_limit.window.as_millis(),
                    MAX_RATE_LIMIT_WINDOW.as_millis()
                ),
            ));
        }
        if self.cache.max_size < 1 {
            return Err(invalid("cache.maxSize", "must be at least 1".into()));
        }
        let retry = self.retry();
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            return Err(invalid(
                "retry.jitterFactor",
                format!("expected 0.0..=1.0, got {}", retry.jitter_factor),
            ));
        }
        if retry.base_delay > retry.max_delay {
            return Err(invalid(
                "retry.baseDelay",
                format!(
                    "{}ms exceeds maxDelay {}ms",
                    retry.base_delay.as_millis(),
                    retry.max_delay.as_millis()
                ),
            ));
        }
        if retry.timeout.is_zero() {
            return Err(invalid("retry.timeoutMs", "must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PartialRateLimit {
    pub max_requests: Option<u32>,
    pub window_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PartialCache {
    pub max_size: Option<usize>,
    /// Milliseconds.
    pub default_ttl: Option<u64>,
}

/// Delays are milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PartialRetry {
    pub max_retries: Option<u32>,
    pub base_delay: Option<u64>,
    pub max_delay: Option<u64>,
    pub jitter_factor: Option<f64>,
    pub timeout_ms: Option<u64>,
}

/// A sparse config layer; `None` leaves the underlying value alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PartialResilienceConfig {
    #[serde(default)]
    pub rate_limit: PartialRateLimit,
    #[serde(default)]
    pub cache: PartialCache,
    #[serde(default)]
    pub retry: PartialRetry,
    pub enable_fallback: Option<bool>,
}

impl PartialResilienceConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// `.json` files are parsed as JSON, everything else as YAML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read config file: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("config_loader"),
            )
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let parsed = if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        };
        debug!(path = %path.display(), "loaded resilience config file");
        parsed.map_err(|e| {
            Error::configuration_with_context(
                format!("cannot parse config file: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("config_loader"),
            )
        })
    }

    /// Read the `PLANNER_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    ///
    /// Unparsable values are skipped with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            name: &str,
        ) -> Option<T> {
            let raw = lookup(name)?;
            match raw.trim().parse::<T>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(var = name, value = %raw, "ignoring unparsable environment override");
                    None
                }
            }
        }

        let enable_fallback = lookup("PLANNER_ENABLE_FALLBACK").and_then(|raw| {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => {
                    warn!(var = "PLANNER_ENABLE_FALLBACK", value = %raw, "ignoring unparsable environment override");
                    None
                }
            }
        });

        Self {
            rate_limit: PartialRateLimit {
                max_requests: parsed(&lookup, "PLANNER_RL_MAX_REQUESTS"),
                window_ms: parsed(&lookup, "PLANNER_RL_WINDOW_MS"),
            },
            cache: PartialCache {
                max_size: parsed(&lookup, "PLANNER_CACHE_MAX_SIZE"),
                default_ttl: parsed(&lookup, "PLANNER_CACHE_TTL_MS"),
            },
            retry: PartialRetry {
                max_retries: parsed(&lookup, "PLANNER_RETRY_MAX"),
                base_delay: parsed(&lookup, "PLANNER_RETRY_BASE_DELAY_MS"),
                max_delay: parsed(&lookup, "PLANNER_RETRY_MAX_DELAY_MS"),
                jitter_factor: None,
                timeout_ms: parsed(&lookup, "PLANNER_RETRY_TIMEOUT_MS"),
            },
            enable_fallback,
        }
    }

    pub fn apply(&self, cfg: &mut ResilienceConfig) {
        if let Some(n) = self.rate_limit.max_requests {
            cfg.rate_limit.max_requests = n;
        }
        if let Some(ms) = self.rate_limit.window_ms {
            cfg.rate_limit.window = Duration::from_millis(ms);
        }
        if let Some(n) = self.cache.max_size {
            cfg.cache.max_size = n;
        }
        if let Some(ms) = self.cache.default_ttl {
            cfg.cache.default_ttl = Duration::from_millis(ms);
        }

        let retry = &mut cfg.degradation.retry;
        if let Some(n) = self.retry.max_retries {
            retry.max_retries = n;
        }
        if let Some(ms) = self.retry.base_delay {
            retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.retry.max_delay {
            retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(f) = self.retry.jitter_factor {
            retry.jitter_factor = f;
        }
        if let Some(ms) = self.retry.timeout_ms {
            retry.timeout = Duration::from_millis(ms);
        }
        if let Some(enabled) = self.enable_fallback {
            cfg.degradation.enable_fallback = enabled;
        }
    }
}

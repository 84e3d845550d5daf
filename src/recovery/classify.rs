//! Error classification: maps raw upstream failures onto the recovery taxonomy.
//!
//! | Kind             | Typical source                          | Retryable |
//! |------------------|-----------------------------------------|-----------|
//! | `network`        | connection failures, 5xx, aborts        | mostly    |
//! | `validation`     | HTTP 400, malformed input               | no        |
//! | `rate_limit`     | HTTP 429                                | yes       |
//! | `tool_execution` | a tool call failed mid-conversation     | yes       |
//! | `streaming`      | the response stream broke               | yes       |
//! | `timeout`        | attempt exceeded its deadline           | yes       |
//! | `unknown`        | anything else                           | yes       |

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use std::fmt;

/// Seconds to wait after a 429 when the upstream sends no `retry-after`.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Validation,
    RateLimit,
    ToolExecution,
    Streaming,
    Timeout,
    Unknown,
}

impl ErrorKind {
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Validation => "validation",
            Self::RateLimit => "rate_limit",
            Self::ToolExecution => "tool_execution",
            Self::Streaming => "streaming",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and critical failures are the ones worth degrading for.
    #[inline]
    pub fn is_severe(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

/// Where a raw failure happened, when the caller knows better than the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOrigin {
    Streaming,
    ToolExecution,
}

/// A raw failure from an outbound operation, before classification.
#[derive(Debug, Clone)]
pub struct RawError {
    pub name: Option<String>,
    pub message: String,
    pub status: Option<u16>,
    pub headers: HeaderMap,
    pub origin: Option<ErrorOrigin>,
}

impl RawError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
            status: None,
            headers: HeaderMap::new(),
            origin: None,
        }
    }

    /// An upstream HTTP failure.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(message).with_status(status)
    }

    /// The attempt deadline elapsed.
    pub fn timeout() -> Self {
        Self::new("operation timed out").with_name("TimeoutError")
    }

    /// The caller cancelled the request.
    pub fn aborted() -> Self {
        Self::new("operation was aborted").with_name("AbortError")
    }

    pub fn streaming(message: impl Into<String>) -> Self {
        Self::new(message).with_origin(ErrorOrigin::Streaming)
    }

    pub fn tool_execution(message: impl Into<String>) -> Self {
        Self::new(message).with_origin(ErrorOrigin::ToolExecution)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_origin(mut self, origin: ErrorOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Attach a response header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(n, v);
        }
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    fn retry_after_secs(&self) -> Option<u64> {
        self.headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
    }
}

impl fmt::Display for RawError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RawError {}

impl From<reqwest::Error> for RawError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return RawError::new(e.to_string()).with_name("TimeoutError");
        }
        if let Some(status) = e.status() {
            return RawError::http(status.as_u16(), e.to_string());
        }
        if e.is_connect() || e.is_request() {
            return RawError::new(format!("network request failed: {e}"));
        }
        if e.is_decode() {
            return RawError::new(format!("invalid response body: {e}"));
        }
        RawError::new(e.to_string())
    }
}

impl From<std::io::Error> for RawError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => RawError::new(e.to_string()).with_name("TimeoutError"),
            std::io::ErrorKind::InvalidData | std::io::ErrorKind::InvalidInput => {
                RawError::new(format!("invalid data: {e}"))
            }
            _ => RawError::new(format!("network i/o failed: {e}")),
        }
    }
}

impl From<serde_json::Error> for RawError {
    fn from(e: serde_json::Error) -> Self {
        RawError::new(format!("invalid JSON: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for RawError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RawError::timeout()
    }
}

/// A classified failure, safe to show to an end user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct EnhancedError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub severity: Severity,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing)]
    pub detail: String,
}

impl EnhancedError {
    fn new(kind: ErrorKind, retryable: bool, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            severity,
            retry_after: None,
            status: None,
            detail: String::new(),
        }
    }

    /// JSON payload for the chat route's error response.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({ "type": self.kind.name(), "message": self.message })
        })
    }
}

fn is_abort_name(name: &str) -> bool {
    let n = name.to_ascii_lowercase();
    n.contains("abort") || n.contains("cancel")
}

fn mentions_timeout(s: &str) -> bool {
    let s = s.to_ascii_lowercase();
    s.contains("timeout") || s.contains("timed out")
}

fn mentions_network(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("fetch") || m.contains("network")
}

fn mentions_validation(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("validation") || m.contains("invalid")
}

/// Classify a raw failure. Pure: the first matching rule wins.
pub fn classify_error(raw: &RawError) -> EnhancedError {
    let name = raw.name.as_deref().unwrap_or("");

    let classified = if is_abort_name(name) {
        EnhancedError::new(ErrorKind::Network, false, Severity::Low, "Request was cancelled.")
    } else if mentions_timeout(name) || mentions_timeout(&raw.message) {
        EnhancedError::new(
            ErrorKind::Timeout,
            true,
            Severity::Medium,
            "Request timed out. Please try again.",
        )
    } else if mentions_network(&raw.message) {
        EnhancedError::new(
            ErrorKind::Network,
            true,
            Severity::Medium,
            "Network error. Please check your connection and try again.",
        )
    } else {
        match raw.status {
            Some(400) => EnhancedError::new(
                ErrorKind::Validation,
                false,
                Severity::Low,
                "Invalid request. Please check your input and try again.",
            ),
            Some(429) => {
                let secs = raw.retry_after_secs().unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                let mut e = EnhancedError::new(
                    ErrorKind::RateLimit,
                    true,
                    Severity::Medium,
                    format!("Too many requests. Please wait {secs} seconds before trying again."),
                );
                e.retry_after = Some(secs);
                e
            }
            Some(500 | 502 | 503 | 504) => EnhancedError::new(
                ErrorKind::Network,
                true,
                Severity::High,
                "The AI service is temporarily unavailable. Please try again shortly.",
            ),
            _ => classify_by_origin(raw),
        }
    };

    EnhancedError {
        status: raw.status,
        detail: raw.message.clone(),
        ..classified
    }
}

fn classify_by_origin(raw: &RawError) -> EnhancedError {
    match raw.origin {
        Some(ErrorOrigin::Streaming) => EnhancedError::new(
            ErrorKind::Streaming,
            true,
            Severity::Medium,
            "The response stream was interrupted. Retrying...",
        ),
        Some(ErrorOrigin::ToolExecution) => EnhancedError::new(
            ErrorKind::ToolExecution,
            true,
            Severity::Medium,
            "A tool failed while processing your request. Retrying...",
        ),
        None if mentions_validation(&raw.message) => EnhancedError::new(
            ErrorKind::Validation,
            false,
            Severity::Low,
            "The request contained invalid data.",
        ),
        None => EnhancedError::new(
            ErrorKind::Unknown,
            true,
            Severity::High,
            "An unexpected error occurred. Please try again.",
        ),
    }
}

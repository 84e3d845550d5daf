//! Cache key generation.
//!
//! Inputs that differ only in case, whitespace or punctuation share a key.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));
static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_\s]").expect("static regex"));

static CACHEABLE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // course codes: CS101, MATH 2210, ECE 201L
        r"(?i)\b[a-z]{2,4}\s?\d{3,4}[a-z]?\b",
        // clock times: 9:30, 14:00, 10:15am
        r"(?i)\b\d{1,2}:\d{2}\s?(am|pm)?\b",
        // bare hours: 9am, 3 pm
        r"(?i)\b\d{1,2}\s?(am|pm)\b",
        // weekdays and their abbreviations
        r"(?i)\b(monday|tuesday|wednesday|thursday|friday|saturday|sunday|mon|tue|tues|wed|thu|thur|thurs|fri|sat|sun)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// `cache_<n>` signature used as the map key.
    pub hash: String,
    /// The normalized input the signature was computed from.
    pub normalized: String,
}

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.hash
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

/// Lowercase, trim, collapse whitespace runs, then drop anything that is not
/// an ASCII word character or whitespace.
pub fn normalize_input(input: &str) -> String {
    let lowered = input.to_lowercase();
    let collapsed = WHITESPACE.replace_all(lowered.trim(), " ");
    NON_WORD.replace_all(&collapsed, "").into_owned()
}

/// 31-multiplier rolling hash over UTF-16 code units, wrapped to `i32`.
pub fn signature(normalized: &str) -> i32 {
    normalized.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit))
    })
}

pub fn generate_key(input: &str) -> CacheKey {
    let normalized = normalize_input(input);
    let hash = format!("cache_{}", signature(&normalized).unsigned_abs());
    CacheKey { hash, normalized }
}

/// Whether `input` mentions a course code, a clock time or a weekday.
///
/// Advisory: the cache itself stores whatever it is given.
pub fn is_cacheable(input: &str) -> bool {
    CACHEABLE_PATTERNS.iter().any(|re| re.is_match(input))
}

//! Response cache.

use super::key::{generate_key, CacheKey};
use crate::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_size: usize,
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_size: 100, default_ttl: Duration::from_secs(5 * 60) }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// Reads whose stored value could not be decoded into the requested type.
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

struct CacheEntry {
    response: serde_json::Value,
    normalized: String,
    inserted_at: Instant,
    /// Insertion order; breaks `Instant` ties when picking the oldest entry.
    seq: u64,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    next_seq: u64,
}

/// Bounded TTL cache keyed by normalized input.
///
/// Values are stored as `serde_json::Value` and deserialized on every read,
/// so callers always get their own copy. When full, the oldest insertion is
/// evicted regardless of how recently it was read.
pub struct ResponseCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
    stats: AtomicStats,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner { entries: HashMap::new(), next_seq: 0 }),
            stats: AtomicStats::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("response cache lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Look up the response cached for `input` (or any input that normalizes the same).
    ///
    /// Stale entries are removed on read.
    pub fn get<T: DeserializeOwned>(&self, input: &str) -> Option<T> {
        let key = generate_key(input);
        let now = Instant::now();
        let value = {
            let mut inner = self.lock();
            let Some(entry) = inner.entries.get(&key.hash) else {
                AtomicStats::bump(&self.stats.misses);
                return None;
            };
            if entry.is_expired(now) {
                inner.entries.remove(&key.hash);
                AtomicStats::bump(&self.stats.expirations);
                AtomicStats::bump(&self.stats.misses);
                return None;
            }
            if entry.normalized != key.normalized {
                debug!(key = %key, "cache signature collision");
                AtomicStats::bump(&self.stats.misses);
                return None;
            }
            entry.response.clone()
        };

        match serde_json::from_value(value) {
            Ok(v) => {
                AtomicStats::bump(&self.stats.hits);
                Some(v)
            }
            Err(e) => {
                debug!(key = %key, error = %e, "cached value has a different shape");
                AtomicStats::bump(&self.stats.errors);
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, input: &str, value: &T) -> Result<()> {
        self.set_with_ttl(input, value, self.config.default_ttl)
    }

    pub fn set_with_ttl<T: Serialize>(&self, input: &str, value: &T, ttl: Duration) -> Result<()> {
        if self.config.max_size == 0 {
            return Ok(());
        }
        let response = serde_json::to_value(value)?;
        let CacheKey { hash, normalized } = generate_key(input);

        let mut inner = self.lock();
        if !inner.entries.contains_key(&hash) && inner.entries.len() >= self.config.max_size {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.seq)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                inner.entries.remove(&k);
                AtomicStats::bump(&self.stats.evictions);
                debug!(evicted = %k, "cache full, evicted oldest entry");
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            hash,
            CacheEntry { response, normalized, inserted_at: Instant::now(), seq, ttl },
        );
        AtomicStats::bump(&self.stats.sets);
        Ok(())
    }

    pub fn delete(&self, input: &str) -> bool {
        let key = generate_key(input);
        self.lock().entries.remove(&key.hash).is_some()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Number of stored entries, including ones that expired but were not yet swept.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.is_expired(now));
        let removed = before - inner.entries.len();
        self.stats.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ParsedCourse {
        code: String,
        days: Vec<String>,
    }

    fn course() -> ParsedCourse {
        ParsedCourse { code: "CS101".into(), days: vec!["Mon".into(), "Wed".into()] }
    }

    #[test]
    fn test_equivalent_inputs_hit() {
        let cache = ResponseCache::default();
        cache.set("Hello  World!", &42u32).unwrap();
        assert_eq!(cache.get::<u32>("hello world"), Some(42));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_returned_value_is_a_copy() {
        let cache = ResponseCache::default();
        cache.set("add cs101", &course()).unwrap();
        let mut first: ParsedCourse = cache.get("add cs101").unwrap();
        first.days.clear();
        let second: ParsedCourse = cache.get("add cs101").unwrap();
        assert_eq!(second, course());
    }

    #[test]
    fn test_oldest_insertion_is_evicted() {
        let cache = ResponseCache::new(CacheConfig::new().with_max_size(3));
        for (i, input) in ["a", "b", "c"].iter().enumerate() {
            cache.set(input, &i).unwrap();
        }
        // reading "a" does not protect it: eviction is by insertion order
        assert_eq!(cache.get::<usize>("a"), Some(0));
        cache.set("d", &3usize).unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get::<usize>("a"), None);
        assert_eq!(cache.get::<usize>("d"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = ResponseCache::new(CacheConfig::new().with_max_size(2));
        cache.set("a", &1).unwrap();
        cache.set("b", &2).unwrap();
        cache.set("A!", &10).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get::<i32>("b"), Some(2));
        assert_eq!(cache.get::<i32>("a"), Some(10));
    }

    #[test]
    fn test_lazy_expiry_on_read() {
        let cache = ResponseCache::new(
            CacheConfig::new().with_max_size(1).with_ttl(Duration::from_millis(50)),
        );
        cache.set("a", &1).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get::<i32>("a"), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_per_entry_ttl_and_sweep() {
        let cache = ResponseCache::default();
        cache.set_with_ttl("short", &1, Duration::from_millis(10)).unwrap();
        cache.set("long", &2).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.get::<i32>("long"), Some(2));
    }

    #[test]
    fn test_shape_mismatch_is_a_miss() {
        let cache = ResponseCache::default();
        cache.set("mon 9am", &"text").unwrap();
        assert_eq!(cache.get::<ParsedCourse>("mon 9am"), None);
        assert_eq!(cache.stats().errors, 1);
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = ResponseCache::default();
        cache.set("x", &1).unwrap();
        cache.set("y", &2).unwrap();
        assert!(cache.delete("X"));
        assert!(!cache.delete("x"));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let cache = ResponseCache::new(CacheConfig::new().with_max_size(0));
        cache.set("x", &1).unwrap();
        assert!(cache.is_empty());
    }
}

//! Behavioural guarantees of the resilience primitives, exercised through the public API.

use futures::{stream, StreamExt};
use planner_resilience::cache::{CacheConfig, ResponseCache};
use planner_resilience::recovery::{
    classify_error, retry_with_backoff, ErrorKind, RawError, RecoveryStrategy, RetryConfig,
    RetryEvent, StreamingRecoveryManager,
};
use planner_resilience::resilience::{RateLimiter, RateLimiterConfig};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig::new()
        .with_max_retries(max_retries)
        .with_base_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(4))
        .with_timeout(Duration::from_millis(500))
}

#[test]
fn test_rate_limit_window_sequence() {
    let limiter = RateLimiter::new(
        RateLimiterConfig::new()
            .with_max_requests(2)
            .with_window(Duration::from_millis(1000)),
    );
    let seq: Vec<(bool, u32)> = (0..3)
        .map(|_| {
            let d = limiter.check_key("student");
            (d.allowed, d.remaining)
        })
        .collect();
    assert_eq!(seq, vec![(true, 1), (true, 0), (false, 0)]);
}

#[test]
fn test_rate_limit_accepts_again_after_reset() {
    let limiter = RateLimiter::new(
        RateLimiterConfig::new()
            .with_max_requests(3)
            .with_window(Duration::from_millis(40)),
    );
    for n in 1..=5u32 {
        let d = limiter.check_key("student");
        assert_eq!(d.allowed, n <= 3, "call {n}");
    }
    std::thread::sleep(Duration::from_millis(60));
    let d = limiter.check_key("student");
    assert!(d.allowed);
    assert_eq!(d.remaining, 2);
}

#[test]
fn test_cache_shares_entry_for_equivalent_prompts() {
    let cache = ResponseCache::default();
    cache.set("Hello  World!", &json!({"reply": "hi"})).unwrap();
    let hit: serde_json::Value = cache.get("hello world").unwrap();
    assert_eq!(hit, json!({"reply": "hi"}));
}

#[test]
fn test_cache_reads_are_independent_copies() {
    let cache = ResponseCache::default();
    cache
        .set("schedule for monday", &json!({"events": ["CS101 9:00"]}))
        .unwrap();

    let mut first: serde_json::Value = cache.get("schedule for monday").unwrap();
    first["events"] = json!([]);
    let second: serde_json::Value = cache.get("schedule for monday").unwrap();
    assert_eq!(second, json!({"events": ["CS101 9:00"]}));
}

#[test]
fn test_cache_evicts_earliest_insert() {
    let max = 4;
    let cache = ResponseCache::new(CacheConfig::new().with_max_size(max));
    for i in 0..=max {
        cache.set(&format!("prompt {i}"), &i).unwrap();
    }
    assert_eq!(cache.len(), max);
    assert_eq!(cache.get::<usize>("prompt 0"), None);
    for i in 1..=max {
        assert_eq!(cache.get::<usize>(&format!("prompt {i}")), Some(i));
    }
}

#[test]
fn test_cache_entry_expires() {
    let cache = ResponseCache::new(
        CacheConfig::new()
            .with_max_size(1)
            .with_ttl(Duration::from_millis(50)),
    );
    cache.set("x", &"y").unwrap();
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(cache.get::<String>("x"), None);
}

#[test]
fn test_classify_429_with_retry_after() {
    let raw = RawError::http(429, "Too Many Requests").with_header("retry-after", "45");
    let e = classify_error(&raw);
    assert_eq!(e.kind, ErrorKind::RateLimit);
    assert!(e.retryable);
    assert_eq!(e.retry_after, Some(45));
}

#[tokio::test]
async fn test_non_retryable_failure_runs_once() {
    let calls = AtomicU32::new(0);
    let mut retries = 0u32;
    let mut on_retry = |_: &RetryEvent| retries += 1;

    let err = retry_with_backoff(
        |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(RawError::http(400, "invalid course code")) }
        },
        &fast_retry(3),
        Some(&mut on_retry),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Validation);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(retries, 0);
}

#[tokio::test]
async fn test_retryable_failure_exhausts_attempts() {
    let calls = AtomicU32::new(0);
    let mut attempts_seen = Vec::new();
    let mut on_retry = |ev: &RetryEvent| attempts_seen.push(ev.attempt);

    let err = retry_with_backoff(
        |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(RawError::http(503, format!("down {n}"))) }
        },
        &fast_retry(3),
        Some(&mut on_retry),
    )
    .await
    .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(attempts_seen, vec![1, 2, 3]);
    assert_eq!(err.kind, ErrorKind::Network);
    assert_eq!(err.detail, "down 3");
}

#[tokio::test]
async fn test_interrupted_stream_resumes_from_partial_content() {
    let manager = Arc::new(StreamingRecoveryManager::new());
    let chunks = vec![
        Ok("Monday: ".to_string()),
        Ok("CS101 at 9:00".to_string()),
        Err(RawError::streaming("connection reset mid-stream")),
    ];

    let received: Vec<_> = manager
        .track("msg-1", RecoveryStrategy::Resume, stream::iter(chunks))
        .collect()
        .await;
    assert_eq!(received.len(), 3);

    let saved = manager.get_state("msg-1").unwrap();
    assert_eq!(saved.partial_content, "Monday: CS101 at 9:00");

    let resumed_from = Arc::new(std::sync::Mutex::new(String::new()));
    let sink = resumed_from.clone();
    let recovered = manager
        .recover_streaming_with_resume(
            "msg-1",
            || async { Err::<(), String>("restart should not run".into()) },
            move |state| async move {
                *sink.lock().unwrap() = state.partial_content;
                Ok(())
            },
        )
        .await;

    assert_eq!(recovered.map(|s| s.retry_count), Some(1));
    assert_eq!(*resumed_from.lock().unwrap(), "Monday: CS101 at 9:00");
    assert!(manager.get_state("msg-1").is_none());
}

#[tokio::test]
async fn test_failed_recovery_keeps_state_and_counts_attempts() {
    let manager = StreamingRecoveryManager::new();
    manager.save_streaming_state("msg-2", String::new(), Vec::new(), RecoveryStrategy::Restart);

    for _ in 0..2 {
        let ok = manager
            .recover_streaming("msg-2", || async { Err::<(), String>("still down".into()) })
            .await;
        assert!(ok.is_none());
    }
    assert_eq!(manager.get_state("msg-2").unwrap().retry_count, 2);
    assert!(manager
        .recover_streaming("missing", || async { Ok::<(), String>(()) })
        .await
        .is_none());
}

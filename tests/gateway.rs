//! End-to-end chat gateway scenarios.

use planner_resilience::config::PartialResilienceConfig;
use planner_resilience::recovery::{ErrorKind, RawError, RetryConfig};
use planner_resilience::resilience::RateLimiterConfig;
use planner_resilience::{ChatGateway, ChatGatewayBuilder, Error, PerformanceMonitor, ResilienceConfig};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PlannerReply {
    text: String,
    events: Vec<String>,
}

fn reply(text: &str) -> PlannerReply {
    PlannerReply {
        text: text.to_string(),
        events: vec!["CS101 09:00".to_string()],
    }
}

fn config() -> ResilienceConfig {
    ResilienceConfig::new()
        .with_rate_limit(
            RateLimiterConfig::new()
                .with_max_requests(5)
                .with_window(Duration::from_secs(60)),
        )
        .with_retry(
            RetryConfig::new()
                .with_max_retries(2)
                .with_base_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5))
                .with_timeout(Duration::from_millis(100)),
        )
}

fn headers(ip: &str) -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert("x-forwarded-for", HeaderValue::from_str(ip).unwrap());
    h.insert("user-agent", HeaderValue::from_static("planner-web/1.0"));
    h
}

fn gateway() -> ChatGateway<PlannerReply> {
    ChatGatewayBuilder::new()
        .with_config(config())
        .register_fallback("chat", || async { Ok(reply("offline")) })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_flaky_model_recovers_then_caches() {
    let gw = gateway();
    let calls = AtomicU32::new(0);

    let first = gw
        .handle(&headers("198.51.100.1"), "What's on Tuesday?", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(RawError::new("fetch failed"))
                } else {
                    Ok(reply("CS101 at 9"))
                }
            }
        })
        .await
        .unwrap();
    assert!(!first.cached && !first.degraded);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let second = gw
        .handle(&headers("198.51.100.1"), "whats on tuesday", |_| async {
            Err(RawError::http(500, "unreachable"))
        })
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(second.value, first.value);

    let snap = gw.monitor().snapshot();
    assert_eq!(snap.requests, 2);
    assert_eq!(snap.cache_hits, 1);
    assert_eq!(snap.cache_misses, 1);
    assert_eq!(snap.retries, 1);
    gw.shutdown().await;
}

#[tokio::test]
async fn test_slow_model_times_out_without_fallback() {
    let gw = gateway();
    let attempts = AtomicU32::new(0);

    let err = gw
        .handle(&headers("198.51.100.2"), "plan my week", |token| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::select! {
                    _ = token.cancelled() => Err(RawError::aborted()),
                    _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(reply("late")),
                }
            }
        })
        .await
        .unwrap_err();

    // timeouts are medium severity: no fallback, the classified error surfaces
    let classified = err.as_classified().unwrap();
    assert_eq!(classified.kind, ErrorKind::Timeout);
    assert_eq!(classified.message, "Request timed out. Please try again.");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(gw.monitor().snapshot().degraded, 0);
    gw.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_clients_share_one_window() {
    let gw = Arc::new(gateway());
    let mut tasks = Vec::new();
    for _ in 0..12 {
        let gw = gw.clone();
        tasks.push(tokio::spawn(async move {
            gw.handle(&headers("203.0.113.9"), "hello", |_| async { Ok(reply("hi")) })
                .await
                .map(|_| ())
        }));
    }

    let mut ok = 0;
    let mut limited = 0;
    for t in tasks {
        match t.await.unwrap() {
            Ok(()) => ok += 1,
            Err(Error::RateLimited(rejection)) => {
                assert_eq!(rejection.status(), 429);
                assert_eq!(rejection.body()["error"], "Too many requests");
                limited += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 5);
    assert_eq!(limited, 7);
    gw.shutdown().await;
}

#[tokio::test]
async fn test_custom_client_key() {
    let gw = ChatGatewayBuilder::<PlannerReply>::new()
        .with_config(config().with_rate_limit(RateLimiterConfig::new().with_max_requests(1)))
        .with_key_fn(Arc::new(|h: &HeaderMap| {
            h.get("x-student-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("anonymous")
                .to_string()
        }))
        .without_sweepers()
        .build()
        .unwrap();

    let mut a = HeaderMap::new();
    a.insert("x-student-id", HeaderValue::from_static("s-1"));
    let mut b = HeaderMap::new();
    b.insert("x-student-id", HeaderValue::from_static("s-2"));

    assert!(gw.handle(&a, "hi", |_| async { Ok(reply("a")) }).await.is_ok());
    assert!(gw.handle(&b, "hi", |_| async { Ok(reply("b")) }).await.is_ok());
    assert!(gw
        .handle(&a, "hi", |_| async { Ok(reply("a")) })
        .await
        .unwrap_err()
        .is_rate_limited());
}

#[tokio::test]
async fn test_shared_monitor_and_file_config() {
    let partial = PartialResilienceConfig::from_yaml_str(
        "rateLimit:\n  maxRequests: 1\nenableFallback: false\n",
    )
    .unwrap();
    let mut cfg = config();
    partial.apply(&mut cfg);

    let monitor = Arc::new(PerformanceMonitor::new());
    let gw = ChatGatewayBuilder::<PlannerReply>::new()
        .with_config(cfg)
        .with_monitor(monitor.clone())
        .register_fallback("chat", || async { Ok(reply("unused")) })
        .build()
        .unwrap();

    let err = gw
        .handle(&headers("192.0.2.1"), "on friday", |_| async {
            Err(RawError::http(503, "down"))
        })
        .await
        .unwrap_err();
    // fallback disabled: the severe error is returned as-is
    assert_eq!(err.as_classified().unwrap().status, Some(503));

    let limited = gw
        .handle(&headers("192.0.2.1"), "on friday", |_| async { Ok(reply("x")) })
        .await
        .unwrap_err();
    assert!(limited.is_rate_limited());

    let snap = monitor.snapshot();
    assert_eq!(snap.failures, 1);
    assert_eq!(snap.rate_limited, 1);
    assert_eq!(snap.degraded, 0);
    gw.shutdown().await;
}

//! resilience-probe: 在模拟的不稳定模型上演练限流、缓存、重试与降级
//!
//! Usage:
//!   resilience-probe run [--config <path>] [--requests <n>] [--failure-rate <p>] [--prompt <text>]
//!   resilience-probe config [--config <path>]       Print the resolved configuration
//!   resilience-probe classify <status> [message]    Classify an upstream failure

use anyhow::{bail, Context};
use planner_resilience::recovery::{classify_error, RawError};
use planner_resilience::{ChatGatewayBuilder, Error, ResilienceConfig};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let result = match args[1].as_str() {
        "run" => cmd_run(&args[2..]).await,
        "config" => cmd_config(&args[2..]),
        "classify" => cmd_classify(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("resilience-probe {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"resilience-probe: chat resilience layer probe

USAGE:
    resilience-probe <COMMAND> [OPTIONS]

COMMANDS:
    run                         Drive the gateway against a simulated flaky model
        --config <path>         YAML or JSON config file
        --requests <n>          Number of chat turns (default 30)
        --failure-rate <p>      Probability a model call fails, 0.0..=1.0 (default 0.3)
        --prompt <text>         Prompt to send (default "What do I have on Monday?")
    config [--config <path>]    Print the resolved configuration
    classify <status> [msg]     Show how an upstream failure is classified
    version                     Show version information
    help                        Show this help message

ENVIRONMENT:
    PLANNER_RESILIENCE_CONFIG   Config file used when --config is absent
    PLANNER_*                   Per-value overrides (see the config module)
    RUST_LOG                    Log filter (default "info")"#
    );
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn load_config(args: &[String]) -> anyhow::Result<ResilienceConfig> {
    let path = flag_value(args, "--config").map(PathBuf::from);
    ResilienceConfig::load(path.as_deref()).context("failed to load resilience config")
}

fn cmd_config(args: &[String]) -> anyhow::Result<()> {
    let cfg = load_config(args)?;
    let retry = cfg.retry();
    println!("rate limit     {} requests / {:?}", cfg.rate_limit.max_requests, cfg.rate_limit.window);
    println!("cache          {} entries, ttl {:?}", cfg.cache.max_size, cfg.cache.default_ttl);
    println!(
        "retry          {} retries, base {:?}, max {:?}, jitter {}, timeout {:?}",
        retry.max_retries, retry.base_delay, retry.max_delay, retry.jitter_factor, retry.timeout
    );
    println!("fallback       {}", cfg.degradation.enable_fallback);
    println!("stream states  kept for {:?}", cfg.streaming_max_age);
    Ok(())
}

fn cmd_classify(args: &[String]) -> anyhow::Result<()> {
    let Some(status) = args.first() else {
        bail!("classify requires an HTTP status");
    };
    let status: u16 = status.parse().with_context(|| format!("invalid status: {status}"))?;
    let message = if args.len() > 1 {
        args[1..].join(" ")
    } else {
        format!("upstream returned {status}")
    };
    let classified = classify_error(&RawError::http(status, message));
    println!("{}", serde_json::to_string_pretty(&classified.to_json())?);
    Ok(())
}

async fn cmd_run(args: &[String]) -> anyhow::Result<()> {
    let cfg = load_config(args)?;
    let requests: u32 = match flag_value(args, "--requests") {
        Some(v) => v.parse().with_context(|| format!("invalid --requests: {v}"))?,
        None => 30,
    };
    let failure_rate: f64 = match flag_value(args, "--failure-rate") {
        Some(v) => v.parse().with_context(|| format!("invalid --failure-rate: {v}"))?,
        None => 0.3,
    };
    if !(0.0..=1.0).contains(&failure_rate) {
        bail!("--failure-rate must be within 0.0..=1.0");
    }
    let prompt = flag_value(args, "--prompt").unwrap_or("What do I have on Monday?");

    let gateway = ChatGatewayBuilder::<String>::new()
        .with_config(cfg)
        .register_fallback("chat", || async {
            Ok("The assistant is busy; here is your saved schedule instead.".to_string())
        })
        .build()?;

    let mut headers = HeaderMap::new();
    headers.insert("x-forwarded-for", HeaderValue::from_static("127.0.0.1"));
    headers.insert("user-agent", HeaderValue::from_static("resilience-probe"));

    let calls = Arc::new(AtomicU32::new(0));
    for turn in 1..=requests {
        let calls = calls.clone();
        let outcome = gateway
            .handle(&headers, prompt, move |cancel| {
                let n = calls.fetch_add(1, Ordering::Relaxed);
                simulated_model(n, failure_rate, cancel)
            })
            .await;

        match outcome {
            Ok(reply) => println!(
                "#{turn:<3} ok        cached={:<5} degraded={:<5} {}",
                reply.cached, reply.degraded, reply.value
            ),
            Err(Error::RateLimited(rejection)) => println!(
                "#{turn:<3} 429       retry after {}s (resets {})",
                rejection.retry_after_secs,
                rejection.reset_time_iso()
            ),
            Err(Error::Classified(e)) => {
                println!("#{turn:<3} {:<9} {}", e.kind.name(), e.message)
            }
            Err(other) => return Err(other.into()),
        }
    }

    let snapshot = gateway.monitor().snapshot();
    println!();
    println!("model calls    {}", calls.load(Ordering::Relaxed));
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    gateway.shutdown().await;
    Ok(())
}

/// A model that fails with one of a few realistic errors `failure_rate` of the time.
async fn simulated_model(
    call: u32,
    failure_rate: f64,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<String, RawError> {
    let (fail, pick, latency_ms) = {
        let mut rng = rand::thread_rng();
        (rng.gen_bool(failure_rate), rng.gen_range(0..4u8), rng.gen_range(5..40u64))
    };

    tokio::select! {
        _ = cancel.cancelled() => return Err(RawError::aborted()),
        _ = tokio::time::sleep(Duration::from_millis(latency_ms)) => {}
    }

    if !fail {
        return Ok(format!("Monday: CS101 at 9:00, MATH 2210 at 13:00 (call {call})"));
    }
    Err(match pick {
        0 => RawError::http(503, "model overloaded"),
        1 => RawError::http(429, "slow down").with_header("retry-after", "2"),
        2 => RawError::new("fetch failed: connection reset"),
        _ => RawError::http(500, "internal error"),
    })
}

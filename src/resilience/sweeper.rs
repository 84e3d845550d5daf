//! Periodic background sweeps with explicit teardown.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Something that holds expiring state and can drop it on demand.
pub trait Sweep: Send + Sync + 'static {
    /// Remove expired state, returning how many items went away.
    fn sweep(&self) -> usize;

    /// Name used in logs.
    fn name(&self) -> &'static str;
}

impl Sweep for super::rate_limiter::RateLimiter {
    fn sweep(&self) -> usize {
        super::rate_limiter::RateLimiter::sweep(self)
    }

    fn name(&self) -> &'static str {
        "rate_limiter"
    }
}

impl Sweep for crate::cache::ResponseCache {
    fn sweep(&self) -> usize {
        crate::cache::ResponseCache::sweep(self)
    }

    fn name(&self) -> &'static str {
        "response_cache"
    }
}

impl Sweep for crate::recovery::StreamingRecoveryManager {
    fn sweep(&self) -> usize {
        crate::recovery::StreamingRecoveryManager::sweep(self)
    }

    fn name(&self) -> &'static str {
        "streaming_recovery"
    }
}

/// Owns a running sweep task. Dropping the handle stops the task.
pub struct SweepHandle {
    name: &'static str,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SweepHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!(sweeper = self.name, "sweeper stopped");
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Run `target.sweep()` every `interval` on the current tokio runtime.
///
/// The first sweep happens one full interval after spawning.
pub fn spawn_sweeper<S: Sweep + ?Sized>(target: Arc<S>, interval: Duration) -> SweepHandle {
    let token = CancellationToken::new();
    let child = token.clone();
    let name = target.name();
    let period = interval.max(Duration::from_millis(1));

    let task = tokio::spawn(async move {
        let now = tokio::time::Instant::now();
        let start = now.checked_add(period).unwrap_or(now);
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = child.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = target.sweep();
                    if removed > 0 {
                        debug!(sweeper = name, removed, "swept expired entries");
                    } else {
                        trace!(sweeper = name, "sweep found nothing to remove");
                    }
                }
            }
        }
    });

    SweepHandle {
        name,
        token,
        task: Some(task),
    }
}

//! Streaming recovery: keeps the partial output of in-flight streamed replies
//! so an interrupted stream can be resumed, restarted or shown as-is.

use super::classify::RawError;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// States older than this are dropped by [`StreamingRecoveryManager::sweep`].
pub const DEFAULT_MAX_STATE_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Continue from the partial content.
    Resume,
    /// Issue the request again from scratch.
    Restart,
    /// Present the partial content as the final answer.
    Fallback,
}

#[derive(Debug, Clone)]
pub struct StreamingRecoveryState {
    pub message_id: String,
    pub partial_content: String,
    pub tool_calls: Vec<serde_json::Value>,
    pub retry_count: u32,
    pub strategy: RecoveryStrategy,
    pub saved_at: Instant,
}

impl StreamingRecoveryState {
    fn new(message_id: &str, strategy: RecoveryStrategy) -> Self {
        Self {
            message_id: message_id.to_string(),
            partial_content: String::new(),
            tool_calls: Vec::new(),
            retry_count: 0,
            strategy,
            saved_at: Instant::now(),
        }
    }

    pub fn has_partial_content(&self) -> bool {
        !self.partial_content.is_empty()
    }
}

/// Keyed store of streaming progress, one entry per message id.
pub struct StreamingRecoveryManager {
    states: Mutex<HashMap<String, StreamingRecoveryState>>,
    max_age: Duration,
}

impl StreamingRecoveryManager {
    pub fn new() -> Self {
        Self::with_max_age(DEFAULT_MAX_STATE_AGE)
    }

    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            max_age,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamingRecoveryState>> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace the saved state for `message_id`.
    ///
    /// The retry count of an existing entry survives the upsert.
    pub fn save_streaming_state(
        &self,
        message_id: &str,
        partial_content: impl Into<String>,
        tool_calls: Vec<serde_json::Value>,
        strategy: RecoveryStrategy,
    ) {
        let mut states = self.lock();
        let retry_count = states.get(message_id).map(|s| s.retry_count).unwrap_or(0);
        states.insert(
            message_id.to_string(),
            StreamingRecoveryState {
                message_id: message_id.to_string(),
                partial_content: partial_content.into(),
                tool_calls,
                retry_count,
                strategy,
                saved_at: Instant::now(),
            },
        );
    }

    /// Append a streamed text chunk, creating the state on first use.
    pub fn append_chunk(&self, message_id: &str, chunk: &str, strategy: RecoveryStrategy) {
        let mut states = self.lock();
        let state = states
            .entry(message_id.to_string())
            .or_insert_with(|| StreamingRecoveryState::new(message_id, strategy));
        state.partial_content.push_str(chunk);
        state.saved_at = Instant::now();
    }

    pub fn record_tool_call(&self, message_id: &str, call: serde_json::Value) {
        let mut states = self.lock();
        let state = states
            .entry(message_id.to_string())
            .or_insert_with(|| StreamingRecoveryState::new(message_id, RecoveryStrategy::Restart));
        state.tool_calls.push(call);
        state.saved_at = Instant::now();
    }

    pub fn get_state(&self, message_id: &str) -> Option<StreamingRecoveryState> {
        self.lock().get(message_id).cloned()
    }

    pub fn clear_state(&self, message_id: &str) -> bool {
        self.lock().remove(message_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wrap a chunk stream so every chunk is recorded under `message_id`.
    ///
    /// Items pass through unchanged. The saved state is left in place when the
    /// stream errors so the caller can recover it; call [`clear_state`] once
    /// the stream has finished cleanly.
    ///
    /// [`clear_state`]: Self::clear_state
    pub fn track<S>(
        self: &Arc<Self>,
        message_id: impl Into<String>,
        strategy: RecoveryStrategy,
        stream: S,
    ) -> impl Stream<Item = Result<String, RawError>>
    where
        S: Stream<Item = Result<String, RawError>>,
    {
        let manager = Arc::clone(self);
        let id = message_id.into();
        manager.save_streaming_state(&id, String::new(), Vec::new(), strategy);
        stream.inspect(move |item| match item {
            Ok(chunk) => manager.append_chunk(&id, chunk, strategy),
            Err(e) => warn!(message_id = %id, error = %e, "stream interrupted"),
        })
    }

    /// Recover an interrupted stream without a resume path.
    ///
    /// On success the saved state is removed from the store and handed back.
    /// For [`RecoveryStrategy::Fallback`] its `partial_content` is the answer
    /// to present. `None` means nothing was recovered and any saved state is
    /// kept for another attempt.
    pub async fn recover_streaming<R, RFut, E>(
        &self,
        message_id: &str,
        restart: R,
    ) -> Option<StreamingRecoveryState>
    where
        R: FnOnce() -> RFut,
        RFut: Future<Output = Result<(), E>>,
        E: Display,
    {
        self.recover_inner(
            message_id,
            restart,
            None::<fn(StreamingRecoveryState) -> std::future::Ready<Result<(), E>>>,
        )
        .await
    }

    /// Recover an interrupted stream, preferring `resume` when the saved
    /// strategy asks for it and there is partial content to resume from.
    ///
    /// Returns the recovered state the same way as
    /// [`recover_streaming`](Self::recover_streaming).
    pub async fn recover_streaming_with_resume<R, RFut, S, SFut, E>(
        &self,
        message_id: &str,
        restart: R,
        resume: S,
    ) -> Option<StreamingRecoveryState>
    where
        R: FnOnce() -> RFut,
        RFut: Future<Output = Result<(), E>>,
        S: FnOnce(StreamingRecoveryState) -> SFut,
        SFut: Future<Output = Result<(), E>>,
        E: Display,
    {
        self.recover_inner(message_id, restart, Some(resume)).await
    }

    async fn recover_inner<R, RFut, S, SFut, E>(
        &self,
        message_id: &str,
        restart: R,
        resume: Option<S>,
    ) -> Option<StreamingRecoveryState>
    where
        R: FnOnce() -> RFut,
        RFut: Future<Output = Result<(), E>>,
        S: FnOnce(StreamingRecoveryState) -> SFut,
        SFut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let state = {
            let mut states = self.lock();
            match states.get_mut(message_id) {
                Some(state) => {
                    state.retry_count += 1;
                    state.clone()
                }
                None => {
                    debug!(message_id, "no streaming state to recover");
                    return None;
                }
            }
        };

        let strategy = state.strategy;
        let retry_count = state.retry_count;
        let outcome = match (strategy, resume) {
            (RecoveryStrategy::Resume, Some(resume)) if state.has_partial_content() => {
                resume(state.clone()).await
            }
            (RecoveryStrategy::Resume | RecoveryStrategy::Restart, _) => restart().await,
            (RecoveryStrategy::Fallback, _) => {
                if state.has_partial_content() {
                    Ok(())
                } else {
                    debug!(message_id, "fallback recovery has no partial content");
                    return None;
                }
            }
        };

        match outcome {
            Ok(()) => {
                info!(message_id, ?strategy, retry_count, "streaming recovered");
                Some(self.lock().remove(message_id).unwrap_or(state))
            }
            Err(e) => {
                warn!(message_id, ?strategy, retry_count, error = %e, "streaming recovery failed");
                None
            }
        }
    }

    /// Drop states older than the configured max age. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let max_age = self.max_age;
        let mut states = self.lock();
        let before = states.len();
        states.retain(|_, s| s.saved_at.elapsed() <= max_age);
        before - states.len()
    }
}

impl Default for StreamingRecoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

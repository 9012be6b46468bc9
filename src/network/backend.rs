//! Shared Store Contract
//!
//! `SyncBackend` is the key-addressable store both clients of a match talk
//! through: point reads and writes, merge updates, atomic read-modify-write,
//! and change subscriptions. Values are schemaless JSON; writing `null`
//! removes a key.
//!
//! Subscriptions are channels. Dropping a [`Subscription`] cancels it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::clock::{ServerClock, ServerTimeSample};

// =============================================================================
// ERRORS
// =============================================================================

/// Store errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// Store unreachable or refusing requests.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Optimistic transaction lost every attempt.
    #[error("transaction conflict after {0} attempts")]
    Conflict(u32),

    /// Value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Path is empty or contains reserved characters.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Connection or store shut down.
    #[error("backend closed")]
    Closed,
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::Serialization(e.to_string())
    }
}

// =============================================================================
// PATHS
// =============================================================================

const RESERVED: [char; 6] = ['.', '#', '$', '[', ']', '/'];

/// Slash-separated store path.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath(String);

impl StorePath {
    /// Parse an untrusted path.
    pub fn parse(path: &str) -> Result<Self, BackendError> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(BackendError::InvalidPath(path.to_string()));
        }
        for segment in trimmed.split('/') {
            if segment.is_empty() || segment.contains(&RESERVED[..5]) {
                return Err(BackendError::InvalidPath(path.to_string()));
            }
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Path of a single segment.
    pub fn root(segment: &str) -> Self {
        Self(sanitize(segment))
    }

    /// Append a segment. Reserved characters become `_`.
    pub fn child(&self, segment: &str) -> Self {
        Self(format!("{}/{}", self.0, sanitize(segment)))
    }

    /// Path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Last segment.
    pub fn key(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Path as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sanitize(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| if RESERVED.contains(&c) { '_' } else { c })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Logical key layout.
pub mod paths {
    use super::StorePath;

    /// `queue`
    pub fn queue() -> StorePath {
        StorePath::root("queue")
    }

    /// `queue/{playerID}`
    pub fn queue_entry(player_id: &str) -> StorePath {
        queue().child(player_id)
    }

    /// `matches/{matchID}`
    pub fn match_root(match_id: &str) -> StorePath {
        StorePath::root("matches").child(match_id)
    }

    /// `matches/{matchID}/shared`
    pub fn match_shared(match_id: &str) -> StorePath {
        match_root(match_id).child("shared")
    }

    /// `matches/{matchID}/players`
    pub fn match_players(match_id: &str) -> StorePath {
        match_root(match_id).child("players")
    }

    /// `matches/{matchID}/players/{playerID}`
    pub fn match_player(match_id: &str, player_id: &str) -> StorePath {
        match_players(match_id).child(player_id)
    }

    /// `matches/{matchID}/events`
    pub fn match_events(match_id: &str) -> StorePath {
        match_root(match_id).child("events")
    }

    /// `matches/{matchID}/events/{eventID}`
    pub fn match_event(match_id: &str, event_id: &str) -> StorePath {
        match_events(match_id).child(event_id)
    }

    /// `leaderboard/{period}`
    pub fn leaderboard(period: &str) -> StorePath {
        StorePath::root("leaderboard").child(period)
    }

    /// `leaderboard/{period}/{playerID}`
    pub fn leaderboard_entry(period: &str, player_id: &str) -> StorePath {
        leaderboard(period).child(player_id)
    }

    /// `results/{period}/{matchID}/{playerID}`
    pub fn match_result(period: &str, match_id: &str, player_id: &str) -> StorePath {
        StorePath::root("results").child(period).child(match_id).child(player_id)
    }
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

/// A child appearing under a subscribed path.
#[derive(Clone, Debug, PartialEq)]
pub struct ChildAdded {
    /// Child key.
    pub key: String,
    /// Child value.
    pub value: Value,
}

/// Stream of change notifications. Dropping it cancels the subscription.
pub struct Subscription<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    on_cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T> Subscription<T> {
    /// Wrap a receiver.
    pub fn new(receiver: mpsc::UnboundedReceiver<T>) -> Self {
        Self { receiver, on_cancel: None }
    }

    /// Wrap a receiver with a hook run on drop.
    pub fn with_cancel(
        receiver: mpsc::UnboundedReceiver<T>,
        on_cancel: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self { receiver, on_cancel: Some(Box::new(on_cancel)) }
    }

    /// Next notification; `None` once the store side is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Next notification if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.receiver.close();
        if let Some(cancel) = self.on_cancel.take() {
            cancel();
        }
    }
}

// =============================================================================
// TRANSACTIONS
// =============================================================================

/// Outcome of a transaction function.
#[derive(Clone, Debug, PartialEq)]
pub enum Transaction {
    /// Store this value (`null` removes).
    Commit(Value),
    /// Leave the stored value alone.
    Abort,
}

/// Result of `transact`.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactResult {
    /// The function's value was stored.
    pub committed: bool,
    /// Value at the path afterwards.
    pub value: Option<Value>,
}

/// Transaction function: current value in, decision out. May run several
/// times.
pub type TransactFn<'a> = &'a (dyn Fn(Option<&Value>) -> Transaction + Send + Sync);

// =============================================================================
// BACKEND TRAIT
// =============================================================================

/// The shared store.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Point read.
    async fn read(&self, path: &StorePath) -> Result<Option<Value>, BackendError>;

    /// Full overwrite. `null` removes.
    async fn write(&self, path: &StorePath, value: Value) -> Result<(), BackendError>;

    /// Merge-write of the given fields, leaving siblings alone.
    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<(), BackendError>;

    /// Remove a key. Idempotent.
    async fn remove(&self, path: &StorePath) -> Result<(), BackendError> {
        self.write(path, Value::Null).await
    }

    /// Atomic read-modify-write, retried on conflict.
    async fn transact(
        &self,
        path: &StorePath,
        apply: TransactFn<'_>,
    ) -> Result<TransactResult, BackendError>;

    /// Current value, then every change.
    async fn subscribe(&self, path: &StorePath) -> Result<Subscription<Option<Value>>, BackendError>;

    /// Existing children, then each child added afterwards.
    async fn subscribe_child_added(
        &self,
        path: &StorePath,
    ) -> Result<Subscription<ChildAdded>, BackendError>;

    /// Read the server's clock. The caller turns the sample into an offset
    /// against its own monotonic time.
    async fn server_time(&self) -> Result<ServerTimeSample, BackendError>;
}

/// Stores that expose a value snapshot and compare-and-set, from which an
/// optimistic `transact` is built.
#[async_trait]
pub trait CompareAndSet: Send + Sync {
    /// Current value.
    async fn snapshot(&self, path: &StorePath) -> Result<Option<Value>, BackendError>;

    /// Store `value` only if the current value equals `expected`. Returns the
    /// value found when the swap did not happen.
    async fn compare_and_set(
        &self,
        path: &StorePath,
        expected: Option<Value>,
        value: Value,
    ) -> Result<Result<(), Option<Value>>, BackendError>;
}

/// Snapshot, apply, compare-and-set; retry up to `max_attempts` times.
pub async fn optimistic_transact<S: CompareAndSet + ?Sized>(
    store: &S,
    path: &StorePath,
    apply: TransactFn<'_>,
    max_attempts: u32,
) -> Result<TransactResult, BackendError> {
    let mut current = store.snapshot(path).await?;

    for attempt in 1..=max_attempts.max(1) {
        let next = match apply(current.as_ref()) {
            Transaction::Abort => return Ok(TransactResult { committed: false, value: current }),
            Transaction::Commit(value) => value,
        };

        match store.compare_and_set(path, current.clone(), next.clone()).await? {
            Ok(()) => {
                let value = if next.is_null() { None } else { Some(next) };
                return Ok(TransactResult { committed: true, value });
            }
            Err(found) => {
                debug!("transaction on {} conflicted (attempt {})", path, attempt);
                current = found;
            }
        }
    }

    Err(BackendError::Conflict(max_attempts.max(1)))
}

/// Keep `clock`'s offset in step with the backend.
pub fn sync_clock(clock: &ServerClock, backend: Arc<dyn SyncBackend>, interval: Duration) {
    clock.start(interval, move || {
        let backend = backend.clone();
        async move {
            match backend.server_time().await {
                Ok(sample) => Some(sample),
                Err(e) => {
                    debug!("server time unavailable: {}", e);
                    None
                }
            }
        }
    });
}

/// Deserialize a stored value, treating malformed data as absent.
pub fn decode<T: serde::de::DeserializeOwned>(value: Option<Value>) -> Option<T> {
    value.and_then(|v| serde_json::from_value(v).ok())
}

//! Relay Protocol Messages
//!
//! Wire format between a [`RemoteBackend`](super::remote::RemoteBackend) and
//! the [`StoreServer`](super::server::StoreServer) relay. JSON text frames,
//! one message per frame, tagged by `type`.

use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Point read.
    Read {
        /// Correlates the reply.
        request_id: u64,
        /// Store path.
        path: String,
    },

    /// Full overwrite.
    Write {
        /// Correlates the reply.
        request_id: u64,
        /// Store path.
        path: String,
        /// New value; `null` removes.
        value: Value,
    },

    /// Merge-write.
    Update {
        /// Correlates the reply.
        request_id: u64,
        /// Store path.
        path: String,
        /// Fields to merge.
        fields: Map<String, Value>,
    },

    /// Remove a key.
    Remove {
        /// Correlates the reply.
        request_id: u64,
        /// Store path.
        path: String,
    },

    /// Conditional write used by optimistic transactions.
    CompareAndSet {
        /// Correlates the reply.
        request_id: u64,
        /// Store path.
        path: String,
        /// Value the client last saw.
        #[serde(default)]
        expected: Option<Value>,
        /// Value to store.
        value: Value,
    },

    /// Start a subscription.
    Subscribe {
        /// Correlates the reply.
        request_id: u64,
        /// Store path.
        path: String,
        /// What to watch.
        mode: SubscriptionMode,
    },

    /// Cancel a subscription.
    Unsubscribe {
        /// Subscription to cancel.
        subscription_id: u64,
    },

    /// Server time request.
    Ping {
        /// Correlates the reply.
        request_id: u64,
        /// Client send time, epoch milliseconds.
        timestamp: f64,
    },
}

/// Subscription kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Value at the path.
    Value,
    /// Children added under the path.
    ChildAdded,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after the handshake.
    Hello {
        /// Relay version.
        server_version: String,
    },

    /// Reply to `Read`.
    ReadResult {
        /// Request being answered.
        request_id: u64,
        /// Stored value.
        #[serde(default)]
        value: Option<Value>,
    },

    /// Reply to `Write`, `Update` and `Remove`.
    Ack {
        /// Request being answered.
        request_id: u64,
    },

    /// Reply to `CompareAndSet`.
    CasResult {
        /// Request being answered.
        request_id: u64,
        /// Whether the swap happened.
        committed: bool,
        /// Value found when it did not.
        #[serde(default)]
        current: Option<Value>,
    },

    /// Reply to `Subscribe`.
    Subscribed {
        /// Request being answered.
        request_id: u64,
        /// Handle for notifications and `Unsubscribe`.
        subscription_id: u64,
    },

    /// Value subscription notification.
    Change {
        /// Subscription.
        subscription_id: u64,
        /// New value.
        #[serde(default)]
        value: Option<Value>,
    },

    /// Child-added notification.
    ChildAdded {
        /// Subscription.
        subscription_id: u64,
        /// Child key.
        key: String,
        /// Child value.
        value: Value,
    },

    /// Reply to `Ping`.
    Pong {
        /// Request being answered.
        request_id: u64,
        /// Echoed client time.
        timestamp: f64,
        /// Relay time, epoch milliseconds.
        server_time: f64,
    },

    /// Request failed.
    Error(ServerError),

    /// Relay is shutting down.
    Shutdown {
        /// Reason.
        reason: String,
    },
}

/// Relay error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    /// Failed request, if attributable.
    pub request_id: Option<u64>,
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unparseable message.
    InvalidMessage,
    /// Bad store path.
    InvalidPath,
    /// Store refused the operation.
    Unavailable,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Request this message answers, if any.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerMessage::ReadResult { request_id, .. }
            | ServerMessage::Ack { request_id }
            | ServerMessage::CasResult { request_id, .. }
            | ServerMessage::Subscribed { request_id, .. }
            | ServerMessage::Pong { request_id, .. } => Some(*request_id),
            ServerMessage::Error(error) => error.request_id,
            _ => None,
        }
    }
}

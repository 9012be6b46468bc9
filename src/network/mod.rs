//! Network Layer
//!
//! The shared store, everything that coordinates through it, and the client
//! loop that ties a local session to it. Match rules live in `game/`; this
//! layer only moves records between the session and the store.
//!
//! ## Module Structure
//!
//! - `backend`: Store trait, paths, subscriptions, optimistic transactions
//! - `memory`: In-process store
//! - `protocol`: Relay wire messages
//! - `server`: WebSocket relay exposing an in-process store
//! - `remote`: Store client for the relay
//! - `identity`: Stable and session player IDs
//! - `matchmaking`: Queue scan, join and match lifecycle writes
//! - `session`: Per-client match state machine
//! - `leaderboard`: Monthly aggregation and ranking
//! - `client`: Event loop driving a session against a store

pub mod backend;
pub mod memory;
pub mod protocol;
pub mod server;
pub mod remote;
pub mod identity;
pub mod matchmaking;
pub mod session;
pub mod leaderboard;
pub mod client;

pub use backend::{paths, BackendError, ChildAdded, StorePath, Subscription, SyncBackend, Transaction};
pub use memory::InMemoryBackend;
pub use protocol::{ClientMessage, ServerMessage};
pub use server::{ServerConfig, StoreServer, StoreServerError};
pub use remote::RemoteBackend;
pub use identity::ArenaIdentity;
pub use matchmaking::{MatchmakingCoordinator, MatchmakingError};
pub use session::{MatchSession, SessionAction, SessionPhase, SessionSnapshot};
pub use leaderboard::{
    period_key, ArenaPlayerMonthlyStats, ArenaPlayerStanding, LeaderboardAggregator, LeaderboardError,
};
pub use client::{ArenaClient, ClientCommand, ClientHandle, ClientStopped};

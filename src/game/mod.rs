//! Match Data and Mechanics
//!
//! Shared records and the pure rules a match is played by. Nothing here
//! performs I/O.
//!
//! ## Module Structure
//!
//! - `state`: Match record, player board snapshot, queue entry
//! - `events`: Append-only match events
//! - `punishment`: Punishment catalogue, countdowns, power-push meter
//! - `score`: Score model and per-match telemetry

pub mod state;
pub mod events;
pub mod punishment;
pub mod score;

// Re-export key types
pub use state::{JoinRejected, MatchState, PlayerBoardState, PlayerId, PlayerProfile, QueueEntry};
pub use events::{EventKind, MultiplayerEvent};
pub use punishment::{ArenaPunishmentState, PowerPushMeter, PunishmentEffects, PunishmentKind};
pub use score::{compute_score, ArenaMatchResult, ScoreBreakdown, ScoreInputs, ScoreTracker};

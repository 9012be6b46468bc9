//! # Sudoku Arena
//!
//! Head-to-head Sudoku: two players solve the same puzzle and the first to
//! complete it wins, with punishments sent across as they play.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       SUDOKU ARENA                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Primitives                                │
//! │  ├── rng.rs      - Seeded Xorshift128+ PRNG                  │
//! │  └── clock.rs    - Server-synchronized clock                 │
//! │                                                              │
//! │  puzzle/         - Puzzle engine (pure)                      │
//! │  ├── grid.rs     - Cells, positions, difficulty              │
//! │  ├── generator.rs- Unique-solution generation                │
//! │  └── validator.rs- Placement and completion checks           │
//! │                                                              │
//! │  game/           - Match records and rules (pure)            │
//! │  ├── state.rs    - Match, board and queue records            │
//! │  ├── events.rs   - Match events                              │
//! │  ├── punishment.rs- Punishments and power-push meter         │
//! │  └── score.rs    - Score model                               │
//! │                                                              │
//! │  network/        - Store and coordination                    │
//! │  ├── backend.rs  - Store trait                               │
//! │  ├── memory.rs   - In-process store                          │
//! │  ├── server.rs   - WebSocket relay                           │
//! │  ├── remote.rs   - Relay client                              │
//! │  ├── matchmaking.rs - Queue and match lifecycle              │
//! │  ├── session.rs  - Client match state machine                │
//! │  ├── leaderboard.rs - Monthly rankings                       │
//! │  └── client.rs   - Client event loop                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism
//!
//! `puzzle/` and `game/` never read the clock or the store. Given the same
//! seed, puzzle generation and punishment picks are identical on every
//! platform; all timing enters as explicit server epochs.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod puzzle;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use config::ArenaConfig;
pub use core::clock::ServerClock;
pub use core::rng::DeterministicRng;
pub use puzzle::{Difficulty, Puzzle, PuzzleGenerator};
pub use game::state::{MatchState, PlayerId, PlayerProfile};
pub use network::{ArenaClient, ArenaIdentity, ClientHandle, InMemoryBackend, SyncBackend};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Players per match.
pub const PLAYERS_PER_MATCH: usize = 2;

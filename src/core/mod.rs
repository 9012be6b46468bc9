//! Core primitives.
//!
//! Seeded randomness and the server-synchronized clock. Nothing in here talks
//! to the store directly.

pub mod rng;
pub mod clock;

// Re-export core types
pub use rng::{DeterministicRng, derive_seed};
pub use clock::{ServerClock, seconds_until};

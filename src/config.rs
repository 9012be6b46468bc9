//! Arena configuration.
//!
//! Every tunable has a default matching the shipped game; any of them can be
//! overridden from the environment.

use std::time::Duration;

use crate::network::memory::DEFAULT_TRANSACT_ATTEMPTS;
use crate::puzzle::Difficulty;

/// Match and matchmaking tunables.
#[derive(Clone, Debug)]
pub struct ArenaConfig {
    /// Queue entries older than this are stale and ignored or removed.
    pub queue_entry_max_age: Duration,
    /// Interval between matchmaking attempts while waiting.
    pub matchmaking_retry_interval: Duration,
    /// Buffer between arming and the shared start so both countdowns render.
    pub start_grace: Duration,
    /// Correct placements needed to fill the power-push meter.
    pub power_push_target: u8,
    /// Cells cleared by the instant "Bye! Bye!" punishment.
    pub clear_cells_count: usize,
    /// Difficulty of newly created matches.
    pub difficulty: Difficulty,
    /// Games needed before a player appears on the leaderboard.
    pub min_matches: u32,
    /// Leaderboard place reported as the cutoff.
    pub leaderboard_cutoff: usize,
    /// Optimistic transaction attempts before giving up.
    pub transact_max_retries: u32,
    /// How long a sent or received emoji stays visible.
    pub emoji_display: Duration,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            queue_entry_max_age: Duration::from_secs(45),
            matchmaking_retry_interval: Duration::from_secs(2),
            start_grace: Duration::from_secs(5),
            power_push_target: 10,
            clear_cells_count: 5,
            difficulty: Difficulty::Hard,
            min_matches: 2,
            leaderboard_cutoff: 50,
            transact_max_retries: DEFAULT_TRANSACT_ATTEMPTS,
            emoji_display: Duration::from_millis(1800),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl ArenaConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_entry_max_age: env_parse("ARENA_QUEUE_MAX_AGE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.queue_entry_max_age),
            matchmaking_retry_interval: env_parse("ARENA_RETRY_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.matchmaking_retry_interval),
            start_grace: env_parse("ARENA_START_GRACE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.start_grace),
            power_push_target: env_parse("ARENA_POWER_PUSH_TARGET")
                .filter(|v: &u8| *v > 0)
                .unwrap_or(defaults.power_push_target),
            clear_cells_count: env_parse("ARENA_CLEAR_CELLS")
                .unwrap_or(defaults.clear_cells_count),
            difficulty: env_parse("ARENA_DIFFICULTY").unwrap_or(defaults.difficulty),
            min_matches: env_parse("ARENA_MIN_MATCHES").unwrap_or(defaults.min_matches),
            leaderboard_cutoff: env_parse("ARENA_LEADERBOARD_CUTOFF")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(defaults.leaderboard_cutoff),
            transact_max_retries: env_parse("ARENA_TRANSACT_RETRIES")
                .filter(|v: &u32| *v > 0)
                .unwrap_or(defaults.transact_max_retries),
            emoji_display: defaults.emoji_display,
        }
    }

    /// Queue entry max age in seconds.
    pub fn queue_max_age_secs(&self) -> f64 {
        self.queue_entry_max_age.as_secs_f64()
    }

    /// Start grace in seconds.
    pub fn start_grace_secs(&self) -> f64 {
        self.start_grace.as_secs_f64()
    }
}

//! Score Model
//!
//! `score = completionRatio * 1000 + 10000 / scoringTime - errors * 5 + maxStreak * 2`,
//! floored at 0.
//!
//! Unfinished boards are scored against a full-board-equivalent pace so a
//! player who stops early cannot win on speed alone.

use serde::{Serialize, Deserialize};

use crate::game::state::PlayerId;
use crate::puzzle::grid::GRID_CELLS;

const FULL_BOARD: f64 = GRID_CELLS as f64;

/// Filled fraction of the board, clamped to [0, 1].
pub fn completion_ratio(completed_squares: u32) -> f64 {
    (completed_squares as f64 / FULL_BOARD).clamp(0.0, 1.0)
}

/// Seconds the score's speed term is computed over.
///
/// A finished board uses the elapsed time; otherwise the pace so far is
/// projected onto all 81 cells. Never below one second.
pub fn scoring_time(elapsed_seconds: f64, completed_squares: u32, did_finish: bool) -> f64 {
    let elapsed = elapsed_seconds.max(1.0);
    if did_finish {
        elapsed
    } else {
        let denominator = completed_squares.max(1) as f64;
        (elapsed / denominator * FULL_BOARD).max(1.0)
    }
}

/// Inputs to a score computation.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScoreInputs {
    /// Filled cells, givens included.
    pub completed_squares: u32,
    /// Seconds since reveal.
    pub elapsed_seconds: f64,
    /// Rejected placements.
    pub errors: u32,
    /// Longest run of correct placements.
    pub max_streak: u32,
    /// Board completed.
    pub did_finish: bool,
}

/// Compute a score, floored at 0.
pub fn compute_score(inputs: &ScoreInputs) -> f64 {
    let time = scoring_time(inputs.elapsed_seconds, inputs.completed_squares, inputs.did_finish);
    let score = completion_ratio(inputs.completed_squares) * 1000.0 + 10000.0 / time
        - inputs.errors as f64 * 5.0
        + inputs.max_streak as f64 * 2.0;
    score.max(0.0)
}

/// Finalized score with the telemetry it was computed from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreBreakdown {
    /// Filled cells.
    pub completed_squares: u32,
    /// Filled fraction.
    pub completion_ratio: f64,
    /// Seconds since reveal, at least 1.
    pub elapsed_seconds: f64,
    /// Seconds used for the speed term.
    pub scoring_time_seconds: f64,
    /// Board completed.
    pub did_finish: bool,
    /// Rejected placements.
    pub errors: u32,
    /// Longest correct run.
    pub max_streak: u32,
    /// Final score.
    pub score: f64,
}

/// Per-match telemetry with an idempotent finalize.
#[derive(Clone, Debug, Default)]
pub struct ScoreTracker {
    errors: u32,
    current_streak: u32,
    max_streak: u32,
    elapsed_seconds: u32,
    finalized: bool,
    submissions: u32,
}

impl ScoreTracker {
    /// Fresh tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// A correct placement.
    pub fn record_correct(&mut self) {
        self.current_streak += 1;
        self.max_streak = self.max_streak.max(self.current_streak);
    }

    /// A rejected placement; breaks the streak.
    pub fn record_error(&mut self) {
        self.errors += 1;
        self.current_streak = 0;
    }

    /// One second of match clock.
    pub fn tick(&mut self) {
        self.elapsed_seconds += 1;
    }

    /// Rejected placements so far.
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Current streak.
    pub fn current_streak(&self) -> u32 {
        self.current_streak
    }

    /// Longest streak.
    pub fn max_streak(&self) -> u32 {
        self.max_streak
    }

    /// Seconds since reveal.
    pub fn elapsed_seconds(&self) -> u32 {
        self.elapsed_seconds
    }

    /// Whether the match score was already finalized.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Number of results produced; never exceeds 1 per match.
    pub fn submissions(&self) -> u32 {
        self.submissions
    }

    fn inputs(&self, completed_squares: u32, did_finish: bool) -> ScoreInputs {
        ScoreInputs {
            completed_squares,
            elapsed_seconds: self.elapsed_seconds.max(1) as f64,
            errors: self.errors,
            max_streak: self.max_streak,
            did_finish,
        }
    }

    /// Live score using the unfinished formula, rounded.
    pub fn live_score(&self, completed_squares: u32) -> u32 {
        compute_score(&self.inputs(completed_squares, false)).round() as u32
    }

    /// Produce the final score once. Later calls return `None`.
    pub fn finalize(&mut self, completed_squares: u32, did_finish: bool) -> Option<ScoreBreakdown> {
        if self.finalized {
            return None;
        }
        self.finalized = true;
        self.submissions += 1;

        let inputs = self.inputs(completed_squares, did_finish);
        Some(ScoreBreakdown {
            completed_squares,
            completion_ratio: completion_ratio(completed_squares),
            elapsed_seconds: inputs.elapsed_seconds,
            scoring_time_seconds: scoring_time(inputs.elapsed_seconds, completed_squares, did_finish),
            did_finish,
            errors: self.errors,
            max_streak: self.max_streak,
            score: compute_score(&inputs),
        })
    }

    /// Start over for a new match.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Immutable per-(match, player) result record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArenaMatchResult {
    /// Stable leaderboard identity.
    #[serde(rename = "playerID")]
    pub player_id: PlayerId,
    /// Name shown on the leaderboard.
    pub display_name: String,
    /// Match the score was earned in.
    #[serde(rename = "matchID")]
    pub match_id: String,
    /// Ranking period, `YYYY-MM`.
    pub period_key: String,
    /// Filled cells.
    pub completed_squares: u32,
    /// Filled fraction.
    pub completion_ratio: f64,
    /// Seconds since reveal.
    pub elapsed_seconds: f64,
    /// Seconds used for the speed term.
    pub scoring_time_seconds: f64,
    /// Board completed.
    pub did_finish: bool,
    /// Rejected placements.
    pub errors: u32,
    /// Longest correct run.
    pub max_streak: u32,
    /// Final score.
    pub score: f64,
    /// Server epoch of finalization.
    pub created_at_epoch: f64,
}

impl ArenaMatchResult {
    /// Result record from a finalized breakdown.
    pub fn from_breakdown(
        player_id: PlayerId,
        display_name: impl Into<String>,
        match_id: impl Into<String>,
        period_key: impl Into<String>,
        breakdown: &ScoreBreakdown,
        created_at_epoch: f64,
    ) -> Self {
        Self {
            player_id,
            display_name: display_name.into(),
            match_id: match_id.into(),
            period_key: period_key.into(),
            completed_squares: breakdown.completed_squares,
            completion_ratio: breakdown.completion_ratio,
            elapsed_seconds: breakdown.elapsed_seconds,
            scoring_time_seconds: breakdown.scoring_time_seconds,
            did_finish: breakdown.did_finish,
            errors: breakdown.errors,
            max_streak: breakdown.max_streak,
            score: breakdown.score,
            created_at_epoch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finished_board_score() {
        let score = compute_score(&ScoreInputs {
            completed_squares: 81,
            elapsed_seconds: 81.0,
            errors: 0,
            max_streak: 81,
            did_finish: true,
        });
        assert_eq!(score.round(), 1285.0);
    }

    #[test]
    fn test_unfinished_pace_projection() {
        // 27 cells in 30s projects to 90s for the whole board.
        assert!((scoring_time(30.0, 27, false) - 90.0).abs() < 1e-9);
        assert_eq!(scoring_time(30.0, 0, false), 2430.0);
        assert_eq!(scoring_time(0.0, 81, true), 1.0);
    }

    #[test]
    fn test_score_floored_at_zero() {
        let score = compute_score(&ScoreInputs {
            completed_squares: 0,
            elapsed_seconds: 600.0,
            errors: 100,
            max_streak: 0,
            did_finish: false,
        });
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_tracker_streaks() {
        let mut tracker = ScoreTracker::new();
        tracker.record_correct();
        tracker.record_correct();
        tracker.record_error();
        tracker.record_correct();
        assert_eq!(tracker.current_streak(), 1);
        assert_eq!(tracker.max_streak(), 2);
        assert_eq!(tracker.errors(), 1);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut tracker = ScoreTracker::new();
        for _ in 0..81 {
            tracker.tick();
        }
        let first = tracker.finalize(81, true).unwrap();
        assert!(first.did_finish);
        assert_eq!(first.scoring_time_seconds, 81.0);

        assert!(tracker.finalize(81, true).is_none());
        assert_eq!(tracker.submissions(), 1);
    }

    #[test]
    fn test_live_score_uses_unfinished_formula() {
        let mut tracker = ScoreTracker::new();
        for _ in 0..10 {
            tracker.tick();
        }
        // 81/81 filled in 10s: 1000 + 1000 = 2000
        assert_eq!(tracker.live_score(81), 2000);
    }

    #[test]
    fn test_result_wire_names() {
        let breakdown = ScoreTracker::new().finalize(40, false).unwrap();
        let result = ArenaMatchResult::from_breakdown(
            PlayerId::from("p-1"),
            "Ada",
            "ABC123",
            "2026-10",
            &breakdown,
            1.0,
        );
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["playerID"], "p-1");
        assert_eq!(value["matchID"], "ABC123");
        assert_eq!(value["periodKey"], "2026-10");
        assert_eq!(value["didFinish"], false);
    }
}

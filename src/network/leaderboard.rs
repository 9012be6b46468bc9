//! Leaderboard
//!
//! Finished matches are written once to `results/{period}/{matchID}/{playerID}`
//! and folded into a running per-player aggregate at
//! `leaderboard/{period}/{playerID}`. The fold runs inside `transact`, so two
//! results for the same player never overwrite each other.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ArenaConfig;
use crate::game::score::ArenaMatchResult;
use crate::game::state::PlayerId;

use super::backend::{paths, BackendError, SyncBackend, Transaction};

/// Leaderboard errors.
#[derive(Debug, Error)]
pub enum LeaderboardError {
    /// Result or aggregate could not be stored.
    #[error("submission of match {match_id} failed: {source}")]
    SubmissionFailed {
        /// Match the result belongs to.
        match_id: String,
        /// Underlying store error.
        source: BackendError,
    },

    /// Store read failed.
    #[error("leaderboard backend error: {0}")]
    Backend(#[from] BackendError),
}

// =============================================================================
// PERIODS
// =============================================================================

/// UTC calendar month of `epoch`, as `YYYY-MM`.
pub fn period_key(epoch: f64) -> String {
    let secs = epoch.floor();
    let secs = if secs.is_finite() { secs as i64 } else { 0 };
    match Utc.timestamp_opt(secs, 0).single() {
        Some(at) => at.format("%Y-%m").to_string(),
        None => "1970-01".to_string(),
    }
}

/// Human-readable period, e.g. `OCTOBER 2026`. Unparseable keys are
/// returned unchanged.
pub fn period_display_name(key: &str) -> String {
    match NaiveDate::parse_from_str(&format!("{}-01", key), "%Y-%m-%d") {
        Ok(date) => date.format("%B %Y").to_string().to_uppercase(),
        Err(_) => key.to_string(),
    }
}

// =============================================================================
// AGGREGATES
// =============================================================================

/// Running aggregate of one player in one period.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArenaPlayerMonthlyStats {
    /// Stable player ID.
    #[serde(rename = "playerID")]
    pub player_id: PlayerId,
    /// Name from the latest result.
    pub display_name: String,
    /// Period.
    pub period_key: String,
    /// Results folded in.
    pub games_played: u32,
    /// Sum of scores.
    pub total_score: f64,
    /// `total_score / games_played`.
    pub average_score: f64,
    /// Highest single score.
    pub best_score: f64,
    /// Enough games to be ranked.
    pub eligible: bool,
    /// `-average_score`, for stores that only sort ascending.
    pub sort_score: f64,
    /// Creation epoch of the latest folded result.
    pub updated_at_epoch: f64,
}

fn number(object: &Map<String, Value>, key: &str) -> Option<f64> {
    match object.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl ArenaPlayerMonthlyStats {
    /// Parse a stored aggregate. Missing numbers read as zero; `key` is the
    /// player ID the record is stored under.
    pub fn from_value(key: &str, period: &str, value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let games_played = number(object, "gamesPlayed").unwrap_or(0.0).max(0.0) as u32;
        let average_score = number(object, "averageScore").unwrap_or(0.0);
        Some(Self {
            player_id: PlayerId::new(key),
            display_name: object
                .get("displayName")
                .and_then(Value::as_str)
                .unwrap_or("Player")
                .to_string(),
            period_key: object
                .get("periodKey")
                .and_then(Value::as_str)
                .unwrap_or(period)
                .to_string(),
            games_played,
            total_score: number(object, "totalScore").unwrap_or(0.0),
            average_score,
            best_score: number(object, "bestScore").unwrap_or(0.0),
            eligible: object.get("eligible").and_then(Value::as_bool).unwrap_or(false),
            sort_score: number(object, "sortScore").unwrap_or(-average_score),
            updated_at_epoch: number(object, "updatedAtEpoch").unwrap_or(0.0),
        })
    }

    /// Fold one result into `current`.
    pub fn fold(current: Option<&Value>, result: &ArenaMatchResult, min_matches: u32) -> Self {
        let object = current.and_then(Value::as_object);
        let read = |key: &str| object.and_then(|o| number(o, key)).unwrap_or(0.0);

        let games_played = read("gamesPlayed").max(0.0) as u32 + 1;
        let total_score = read("totalScore") + result.score;
        let average_score = total_score / games_played.max(1) as f64;
        Self {
            player_id: result.player_id.clone(),
            display_name: result.display_name.clone(),
            period_key: result.period_key.clone(),
            games_played,
            total_score,
            average_score,
            best_score: read("bestScore").max(result.score),
            eligible: games_played >= min_matches,
            sort_score: -average_score,
            updated_at_epoch: result.created_at_epoch,
        }
    }

    /// Serialize for the store.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Ranking order: average descending, then games descending, then the
/// earlier achiever first.
pub fn leaderboard_order(a: &ArenaPlayerMonthlyStats, b: &ArenaPlayerMonthlyStats) -> Ordering {
    b.average_score
        .total_cmp(&a.average_score)
        .then_with(|| b.games_played.cmp(&a.games_played))
        .then_with(|| a.updated_at_epoch.total_cmp(&b.updated_at_epoch))
}

/// A player's position in a period.
#[derive(Clone, Debug, PartialEq)]
pub struct ArenaPlayerStanding {
    /// Period.
    pub period_key: String,
    /// Player average; 0 without results.
    pub average_score: f64,
    /// Player games; 0 without results.
    pub games_played: u32,
    /// 1-based rank among eligible players.
    pub rank: Option<usize>,
    /// Average still needed to reach the cutoff place, when that many
    /// players are eligible.
    pub points_to_cutoff: Option<f64>,
}

// =============================================================================
// AGGREGATOR
// =============================================================================

/// Records results and answers rank queries.
pub struct LeaderboardAggregator {
    backend: Arc<dyn SyncBackend>,
    cutoff: usize,
}

impl LeaderboardAggregator {
    /// Aggregator over `backend`.
    pub fn new(backend: Arc<dyn SyncBackend>, config: &ArenaConfig) -> Self {
        Self { backend, cutoff: config.leaderboard_cutoff.max(1) }
    }

    /// Store `result` and fold it into the player's period aggregate.
    pub async fn record_match_result(
        &self,
        result: &ArenaMatchResult,
        min_matches: u32,
    ) -> Result<ArenaPlayerMonthlyStats, LeaderboardError> {
        let failed = |source: BackendError| LeaderboardError::SubmissionFailed {
            match_id: result.match_id.clone(),
            source,
        };

        let record = serde_json::to_value(result)
            .map_err(|e| failed(BackendError::from(e)))?;
        let result_path = paths::match_result(&result.period_key, &result.match_id, result.player_id.as_str());
        self.backend.write(&result_path, record).await.map_err(failed)?;

        let aggregate_path = paths::leaderboard_entry(&result.period_key, result.player_id.as_str());
        let apply = |current: Option<&Value>| {
            Transaction::Commit(ArenaPlayerMonthlyStats::fold(current, result, min_matches).to_value())
        };
        let outcome = self.backend.transact(&aggregate_path, &apply).await.map_err(failed)?;

        let stats = outcome
            .value
            .as_ref()
            .and_then(|v| ArenaPlayerMonthlyStats::from_value(result.player_id.as_str(), &result.period_key, v))
            .unwrap_or_else(|| ArenaPlayerMonthlyStats::fold(None, result, min_matches));
        info!(
            "recorded {:.0} for {} in {} ({} games, avg {:.1})",
            result.score, result.player_id, result.period_key, stats.games_played, stats.average_score
        );
        Ok(stats)
    }

    /// Every aggregate of `period`, in ranking order.
    pub async fn fetch_all(&self, period: &str) -> Result<Vec<ArenaPlayerMonthlyStats>, LeaderboardError> {
        let value = self.backend.read(&paths::leaderboard(period)).await?;
        let mut all: Vec<_> = match value {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(key, v)| ArenaPlayerMonthlyStats::from_value(key, period, v))
                .collect(),
            _ => Vec::new(),
        };
        all.sort_by(leaderboard_order);
        debug!("loaded {} aggregates for {}", all.len(), period);
        Ok(all)
    }

    /// Top `limit` players with at least `min_matches` games.
    pub async fn fetch_top_players(
        &self,
        period: &str,
        limit: usize,
        min_matches: u32,
    ) -> Result<Vec<ArenaPlayerMonthlyStats>, LeaderboardError> {
        Ok(self
            .fetch_all(period)
            .await?
            .into_iter()
            .filter(|s| s.games_played >= min_matches)
            .take(limit)
            .collect())
    }

    /// Rank and cutoff gap of `player` in `period`.
    pub async fn fetch_player_standing(
        &self,
        period: &str,
        player: &PlayerId,
        min_matches: u32,
    ) -> Result<ArenaPlayerStanding, LeaderboardError> {
        let all = self.fetch_all(period).await?;
        Ok(standing_of(&all, period, player, min_matches, self.cutoff))
    }
}

/// Standing of `player` within `sorted`, which must be in ranking order.
pub fn standing_of(
    sorted: &[ArenaPlayerMonthlyStats],
    period: &str,
    player: &PlayerId,
    min_matches: u32,
    cutoff: usize,
) -> ArenaPlayerStanding {
    let eligible: Vec<_> = sorted.iter().filter(|s| s.games_played >= min_matches).collect();
    let own = sorted.iter().find(|s| s.player_id == *player);
    let rank = eligible.iter().position(|s| s.player_id == *player).map(|i| i + 1);
    let cutoff_average = (cutoff > 0 && eligible.len() >= cutoff).then(|| eligible[cutoff - 1].average_score);

    ArenaPlayerStanding {
        period_key: period.to_string(),
        average_score: own.map_or(0.0, |s| s.average_score),
        games_played: own.map_or(0, |s| s.games_played),
        rank,
        points_to_cutoff: match (own, cutoff_average) {
            (Some(own), Some(cut)) => Some((cut - own.average_score).max(0.0)),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::InMemoryBackend;
    use serde_json::json;

    fn result(player: &str, match_id: &str, score: f64, at: f64) -> ArenaMatchResult {
        ArenaMatchResult {
            player_id: PlayerId::from(player),
            display_name: player.to_uppercase(),
            match_id: match_id.into(),
            period_key: "2026-10".into(),
            completed_squares: 81,
            completion_ratio: 1.0,
            elapsed_seconds: 120.0,
            scoring_time_seconds: 120.0,
            did_finish: true,
            errors: 0,
            max_streak: 10,
            score,
            created_at_epoch: at,
        }
    }

    fn stats(player: &str, average: f64, games: u32, updated: f64) -> ArenaPlayerMonthlyStats {
        ArenaPlayerMonthlyStats {
            player_id: PlayerId::from(player),
            display_name: player.into(),
            period_key: "2026-10".into(),
            games_played: games,
            total_score: average * games as f64,
            average_score: average,
            best_score: average,
            eligible: games >= 2,
            sort_score: -average,
            updated_at_epoch: updated,
        }
    }

    #[test]
    fn test_period_key_is_utc_month() {
        assert_eq!(period_key(0.0), "1970-01");
        // 2026-10-31T23:59:59Z
        assert_eq!(period_key(1_793_491_199.0), "2026-10");
        assert_eq!(period_key(1_793_491_200.0), "2026-11");
        assert_eq!(period_display_name("2026-10"), "OCTOBER 2026");
        assert_eq!(period_display_name("soon"), "soon");
    }

    #[test]
    fn test_fold_running_average() {
        let current = json!({"gamesPlayed": 2, "totalScore": 1800.0, "averageScore": 900.0, "bestScore": 1000.0});
        let folded = ArenaPlayerMonthlyStats::fold(Some(&current), &result("p-a", "M1", 300.0, 50.0), 2);
        assert_eq!(folded.games_played, 3);
        assert_eq!(folded.total_score, 2100.0);
        assert_eq!(folded.average_score, 700.0);
        assert_eq!(folded.best_score, 1000.0);
        assert!(folded.eligible);
        assert_eq!(folded.sort_score, -700.0);
        assert_eq!(folded.updated_at_epoch, 50.0);
    }

    #[test]
    fn test_first_result_is_not_yet_eligible() {
        let folded = ArenaPlayerMonthlyStats::fold(None, &result("p-a", "M1", 420.0, 1.0), 2);
        assert_eq!(folded.games_played, 1);
        assert_eq!(folded.best_score, 420.0);
        assert!(!folded.eligible);
    }

    #[test]
    fn test_ordering_tie_breaks() {
        let mut all = vec![
            stats("late", 500.0, 3, 20.0),
            stats("early", 500.0, 3, 10.0),
            stats("more", 500.0, 4, 30.0),
            stats("best", 900.0, 2, 40.0),
        ];
        all.sort_by(leaderboard_order);
        let order: Vec<_> = all.iter().map(|s| s.player_id.as_str()).collect();
        assert_eq!(order, vec!["best", "more", "early", "late"]);
    }

    #[test]
    fn test_standing_reports_cutoff_gap() {
        let mut all: Vec<_> = (0..5).map(|i| stats(&format!("p-{}", i), 1000.0 - i as f64 * 100.0, 2, 0.0)).collect();
        all.push(stats("p-new", 2000.0, 1, 0.0));
        all.sort_by(leaderboard_order);

        let standing = standing_of(&all, "2026-10", &PlayerId::from("p-4"), 2, 3);
        assert_eq!(standing.rank, Some(5));
        assert_eq!(standing.points_to_cutoff, Some(200.0));

        let top = standing_of(&all, "2026-10", &PlayerId::from("p-0"), 2, 3);
        assert_eq!(top.points_to_cutoff, Some(0.0));

        let ineligible = standing_of(&all, "2026-10", &PlayerId::from("p-new"), 2, 3);
        assert_eq!(ineligible.rank, None);
        assert_eq!(ineligible.games_played, 1);

        let few = standing_of(&all, "2026-10", &PlayerId::from("p-1"), 2, 50);
        assert_eq!(few.rank, Some(2));
        assert_eq!(few.points_to_cutoff, None);
    }

    #[tokio::test]
    async fn test_record_and_rank() {
        let store = InMemoryBackend::new();
        let board = LeaderboardAggregator::new(Arc::new(store.clone()), &ArenaConfig::default());

        board.record_match_result(&result("p-a", "M1", 1000.0, 1.0), 2).await.unwrap();
        board.record_match_result(&result("p-a", "M2", 800.0, 2.0), 2).await.unwrap();
        board.record_match_result(&result("p-b", "M2", 1200.0, 2.0), 2).await.unwrap();

        let stored = store.read(&paths::match_result("2026-10", "M2", "p-b")).await.unwrap().unwrap();
        assert_eq!(stored["score"], json!(1200.0));

        let top = board.fetch_top_players("2026-10", 10, 2).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].player_id, PlayerId::from("p-a"));
        assert_eq!(top[0].average_score, 900.0);

        let standing = board.fetch_player_standing("2026-10", &PlayerId::from("p-b"), 1).await.unwrap();
        assert_eq!(standing.rank, Some(1));
        assert_eq!(standing.games_played, 1);
    }

    #[tokio::test]
    async fn test_concurrent_folds_keep_every_game() {
        let store = InMemoryBackend::new();
        let board = Arc::new(LeaderboardAggregator::new(Arc::new(store.clone()), &ArenaConfig::default()));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let board = board.clone();
            tasks.push(tokio::spawn(async move {
                let r = result("p-a", &format!("M{}", i), 100.0, i as f64);
                board.record_match_result(&r, 2).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let all = board.fetch_all("2026-10").await.unwrap();
        assert_eq!(all[0].games_played, 8);
        assert_eq!(all[0].total_score, 800.0);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_submission() {
        let store = InMemoryBackend::new();
        store.set_unavailable(true);
        let board = LeaderboardAggregator::new(Arc::new(store), &ArenaConfig::default());
        let err = board.record_match_result(&result("p-a", "M1", 1.0, 1.0), 2).await.unwrap_err();
        assert!(matches!(err, LeaderboardError::SubmissionFailed { .. }));
    }
}

//! Matchmaking
//!
//! Pairs two players through the shared store's `queue`. A player either
//! joins the oldest live waiting match, reuses its own waiting match, or
//! creates a new one and waits in the queue.
//!
//! Joins and lifecycle transitions on the shared match record go through
//! `transact`, so two players racing for the same seat never both win it.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ArenaConfig;
use crate::core::clock::ServerClock;
use crate::core::rng::DeterministicRng;
use crate::game::state::{JoinRejected, MatchState, PlayerBoardState, PlayerId, PlayerProfile, QueueEntry};
use crate::puzzle::{Difficulty, Puzzle, PuzzleGenerator};

use super::backend::{paths, BackendError, SyncBackend, Transaction};

// =============================================================================
// ERRORS
// =============================================================================

/// Matchmaking errors.
#[derive(Debug, Error)]
pub enum MatchmakingError {
    /// The store refused or could not be reached.
    #[error("matchmaking unavailable: {0}")]
    Unavailable(#[from] BackendError),

    /// Match record does not exist.
    #[error("match {0} not found")]
    NotFound(String),

    /// The match took another player or finished first.
    #[error("cannot join match {match_id}: {reason}")]
    JoinConflict {
        /// Contested match.
        match_id: String,
        /// Why the join was refused.
        reason: JoinRejected,
    },

    /// Puzzle generation task failed.
    #[error("puzzle generation failed: {0}")]
    Generation(String),
}

// =============================================================================
// PAIRING RULE
// =============================================================================

/// The caller's own queue entry as seen during a scan.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OwnEntry {
    /// Last heartbeat.
    pub created_at_epoch: f64,
    /// Older than the queue max age.
    pub stale: bool,
}

/// Whether `player` should join the match behind a live candidate entry.
///
/// Already being in the match always joins. Otherwise the match must have a
/// free seat and the candidate must outrank the caller's own entry: older,
/// or on equal timestamps the lexically smaller queue key. Missing or stale
/// own entries never outrank a candidate.
pub fn should_join(
    player: &PlayerId,
    own: Option<OwnEntry>,
    candidate_key: &str,
    candidate_created_at: f64,
    shared: &MatchState,
) -> bool {
    if shared.contains(player) {
        return true;
    }
    if shared.is_full() {
        return false;
    }
    match own {
        None => true,
        Some(own) if own.stale => true,
        Some(own) => match candidate_created_at.total_cmp(&own.created_at_epoch) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => candidate_key < player.as_str(),
        },
    }
}

/// Six uppercase characters taken from a fresh UUID.
pub fn new_match_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..6].to_uppercase()
}

/// Initial board record for `player` in a freshly joined or created match.
pub fn initial_board(player: &PlayerId, puzzle: &Puzzle, profile: &PlayerProfile) -> PlayerBoardState {
    PlayerBoardState {
        player_id: player.clone(),
        values: puzzle.values(),
        completion: Default::default(),
        profile_name: Some(profile.display_name.clone()),
        profile_image_base64: profile.image_base64.clone(),
        squares_left: Some(puzzle.empty_count() as u32),
    }
}

/// Result of a lifecycle transition on the shared record.
#[derive(Clone, Debug, PartialEq)]
pub struct SharedUpdate {
    /// The transition was stored.
    pub committed: bool,
    /// Record after the attempt; `None` if it no longer exists.
    pub state: Option<MatchState>,
}

// =============================================================================
// COORDINATOR
// =============================================================================

/// Queue scanning, match creation and shared-record transitions.
pub struct MatchmakingCoordinator {
    backend: Arc<dyn SyncBackend>,
    clock: ServerClock,
    config: ArenaConfig,
    seeds: Mutex<DeterministicRng>,
}

impl MatchmakingCoordinator {
    /// Coordinator over `backend`.
    pub fn new(backend: Arc<dyn SyncBackend>, clock: ServerClock, config: ArenaConfig) -> Self {
        Self {
            backend,
            clock,
            config,
            seeds: Mutex::new(DeterministicRng::from_entropy()),
        }
    }

    /// Seed puzzle generation deterministically.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seeds = Mutex::new(DeterministicRng::new(seed));
        self
    }

    /// Store this coordinator talks to.
    pub fn backend(&self) -> &Arc<dyn SyncBackend> {
        &self.backend
    }

    /// Clock used for queue timestamps.
    pub fn clock(&self) -> &ServerClock {
        &self.clock
    }

    /// Join a waiting match, reuse our own, or create one and enqueue.
    pub async fn enter_queue(
        &self,
        player: &PlayerId,
        profile: &PlayerProfile,
        difficulty: Difficulty,
    ) -> Result<MatchState, MatchmakingError> {
        let now = self.clock.now_epoch();
        let max_age = self.config.queue_max_age_secs();
        let queue = self.backend.read(&paths::queue()).await?;
        let entries = match queue {
            Some(Value::Object(map)) => map,
            _ => Default::default(),
        };

        let own_entry = entries.get(player.as_str()).and_then(QueueEntry::from_value);
        let own = own_entry.as_ref().map(|entry| OwnEntry {
            created_at_epoch: entry.created_at_epoch,
            stale: entry.is_stale(now, max_age),
        });
        if own.is_some_and(|o| o.stale) {
            debug!("removing stale queue entry for {}", player);
            self.remove_entry(player.as_str()).await;
        }

        let mut candidates = Vec::new();
        for (key, value) in &entries {
            if key == player.as_str() {
                continue;
            }
            match QueueEntry::from_value(value) {
                Some(entry) => candidates.push((key.clone(), entry)),
                None => {
                    debug!("removing malformed queue entry {}", key);
                    self.remove_entry(key).await;
                }
            }
        }
        candidates.sort_by(|(ka, a), (kb, b)| {
            a.created_at_epoch.total_cmp(&b.created_at_epoch).then_with(|| ka.cmp(kb))
        });

        for (key, entry) in candidates {
            if entry.is_stale(now, max_age) {
                debug!("removing stale queue entry {}", key);
                self.remove_entry(&key).await;
                continue;
            }
            let Some(shared) = self.load_match(&entry.match_id).await? else {
                debug!("queue entry {} points at missing match {}", key, entry.match_id);
                self.remove_entry(&key).await;
                continue;
            };
            if shared.is_terminal() {
                debug!("queue entry {} points at finished match {}", key, shared.match_id);
                self.remove_entry(&key).await;
                continue;
            }
            if shared.is_full() && !shared.contains(player) {
                debug!("queue entry {} points at full match {}", key, shared.match_id);
                self.remove_entry(&key).await;
                continue;
            }
            if !should_join(player, own, &key, entry.created_at_epoch, &shared) {
                continue;
            }

            match self.join_existing(&shared.match_id, player, profile).await {
                Ok(joined) => {
                    self.remove_entry(&key).await;
                    self.remove_entry(player.as_str()).await;
                    info!("{} joined match {} hosted by {}", player, joined.match_id, key);
                    return Ok(joined);
                }
                Err(MatchmakingError::Unavailable(e)) => return Err(MatchmakingError::Unavailable(e)),
                Err(e) => {
                    warn!("join of {} failed, continuing scan: {}", shared.match_id, e);
                    continue;
                }
            }
        }

        if let (Some(entry), Some(OwnEntry { stale: false, .. })) = (&own_entry, own) {
            match self.load_match(&entry.match_id).await? {
                Some(shared) if shared.contains(player) && !shared.is_full() && !shared.is_terminal() => {
                    let heartbeat = QueueEntry {
                        match_id: shared.match_id.clone(),
                        created_at_epoch: now,
                        profile_name: Some(profile.display_name.clone()),
                    };
                    self.backend
                        .write(&paths::queue_entry(player.as_str()), heartbeat.to_value())
                        .await?;
                    debug!("{} still waiting in {}", player, shared.match_id);
                    return Ok(shared);
                }
                _ => self.remove_entry(player.as_str()).await,
            }
        }

        self.create_match(player, profile, difficulty, now).await
    }

    /// Drop our queue entry. Idempotent.
    pub async fn leave_queue(&self, player: &PlayerId) -> Result<(), MatchmakingError> {
        self.backend.remove(&paths::queue_entry(player.as_str())).await?;
        Ok(())
    }

    /// Attach `player` to `match_id` and write its initial board.
    pub async fn join_existing(
        &self,
        match_id: &str,
        player: &PlayerId,
        profile: &PlayerProfile,
    ) -> Result<MatchState, MatchmakingError> {
        let path = paths::match_shared(match_id);
        let apply = |current: Option<&Value>| {
            let Some(mut state) = current.and_then(MatchState::from_value) else {
                return Transaction::Abort;
            };
            match state.attach_player(player.clone()) {
                Ok(()) => Transaction::Commit(state.to_value()),
                Err(_) => Transaction::Abort,
            }
        };
        let result = self.backend.transact(&path, &apply).await?;
        let state = result.value.as_ref().and_then(MatchState::from_value);

        let state = match (result.committed, state) {
            (_, None) => return Err(MatchmakingError::NotFound(match_id.to_string())),
            (true, Some(state)) => state,
            (false, Some(mut state)) => {
                let reason = match state.attach_player(player.clone()) {
                    Err(reason) => reason,
                    Ok(()) if state.is_terminal() => JoinRejected::Finished,
                    Ok(()) => JoinRejected::Full,
                };
                return Err(MatchmakingError::JoinConflict { match_id: match_id.to_string(), reason });
            }
        };

        let board = initial_board(player, &state.puzzle, profile);
        self.backend
            .write(&paths::match_player(match_id, player.as_str()), board.to_value())
            .await?;
        Ok(state)
    }

    /// Read and parse a shared match record.
    pub async fn load_match(&self, match_id: &str) -> Result<Option<MatchState>, MatchmakingError> {
        let value = self.backend.read(&paths::match_shared(match_id)).await?;
        Ok(value.as_ref().and_then(MatchState::from_value))
    }

    /// Add `player` to the ready list once both players are present.
    pub async fn mark_ready(&self, match_id: &str, player: &PlayerId) -> Result<SharedUpdate, MatchmakingError> {
        self.modify_shared(match_id, |state| {
            state.is_full() && state.contains(player) && !state.is_terminal() && state.mark_ready(player)
        })
        .await
    }

    /// Set the shared start epoch; only the authority succeeds.
    pub async fn arm_countdown(&self, match_id: &str, player: &PlayerId) -> Result<SharedUpdate, MatchmakingError> {
        let now = self.clock.now_epoch();
        let grace = self.config.start_grace_secs();
        self.modify_shared(match_id, |state| state.arm_countdown(player, now, grace)).await
    }

    /// Record `player` as winner unless the match already ended.
    pub async fn announce_winner(&self, match_id: &str, player: &PlayerId) -> Result<SharedUpdate, MatchmakingError> {
        self.modify_shared(match_id, |state| state.set_winner_if_open(player)).await
    }

    /// Record `player` as having quit unless the match already ended.
    pub async fn record_quit(&self, match_id: &str, player: &PlayerId) -> Result<SharedUpdate, MatchmakingError> {
        self.modify_shared(match_id, |state| state.set_quit_if_open(player)).await
    }

    /// Remove `player` from the participants and reset the lifecycle.
    pub async fn detach(&self, match_id: &str, player: &PlayerId) -> Result<SharedUpdate, MatchmakingError> {
        self.modify_shared(match_id, |state| state.detach_player(player)).await
    }

    async fn modify_shared<F>(&self, match_id: &str, modify: F) -> Result<SharedUpdate, MatchmakingError>
    where
        F: Fn(&mut MatchState) -> bool + Send + Sync,
    {
        let path = paths::match_shared(match_id);
        let apply = |current: Option<&Value>| {
            let Some(mut state) = current.and_then(MatchState::from_value) else {
                return Transaction::Abort;
            };
            if modify(&mut state) {
                Transaction::Commit(state.to_value())
            } else {
                Transaction::Abort
            }
        };
        let result = self.backend.transact(&path, &apply).await?;
        Ok(SharedUpdate {
            committed: result.committed,
            state: result.value.as_ref().and_then(MatchState::from_value),
        })
    }

    async fn create_match(
        &self,
        player: &PlayerId,
        profile: &PlayerProfile,
        difficulty: Difficulty,
        now: f64,
    ) -> Result<MatchState, MatchmakingError> {
        let puzzle = self.generate(difficulty).await?;
        let match_id = new_match_id();
        let state = MatchState::new(match_id.clone(), puzzle, player.clone());

        self.backend.write(&paths::match_shared(&match_id), state.to_value()).await?;
        let board = initial_board(player, &state.puzzle, profile);
        self.backend
            .write(&paths::match_player(&match_id, player.as_str()), board.to_value())
            .await?;
        let entry = QueueEntry {
            match_id: match_id.clone(),
            created_at_epoch: now,
            profile_name: Some(profile.display_name.clone()),
        };
        self.backend.write(&paths::queue_entry(player.as_str()), entry.to_value()).await?;

        info!("{} created match {} ({})", player, match_id, difficulty);
        Ok(state)
    }

    async fn generate(&self, difficulty: Difficulty) -> Result<Puzzle, MatchmakingError> {
        let seed = match self.seeds.lock() {
            Ok(mut rng) => rng.next_u64(),
            Err(poisoned) => poisoned.into_inner().next_u64(),
        };
        tokio::task::spawn_blocking(move || PuzzleGenerator::new(seed).generate(difficulty))
            .await
            .map_err(|e| MatchmakingError::Generation(e.to_string()))
    }

    async fn remove_entry(&self, key: &str) {
        if let Err(e) = self.backend.remove(&paths::queue_entry(key)).await {
            debug!("failed to remove queue entry {}: {}", key, e);
        }
    }
}

//! Match Session
//!
//! Per-client state machine for one arena match:
//! `WaitingForOpponent -> Preparing -> Playing -> {Won | Lost | OpponentQuit}`.
//!
//! The session performs no I/O. Every handler takes the current server time
//! and returns the [`SessionAction`]s the driver must carry out against the
//! store, which keeps the whole match lifecycle testable without a backend.

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::ArenaConfig;
use crate::core::clock::seconds_until;
use crate::core::rng::DeterministicRng;
use crate::game::events::{keys, EventKind, MultiplayerEvent};
use crate::game::punishment::{
    cells_to_clear, ArenaPunishmentState, PowerPushMeter, PunishmentEffects, PunishmentKind,
};
use crate::game::score::{ArenaMatchResult, ScoreTracker};
use crate::game::state::{MatchState, PlayerBoardState, PlayerId, PlayerProfile};
use crate::puzzle::grid::{BoardValues, Cell, CellPosition, CompletionState};
use crate::puzzle::validator::{completed_digits, digit_completed, evaluate_completions, is_placement_legal};

use super::leaderboard::period_key;

/// Name shown for an opponent that has not published one.
pub const DEFAULT_OPPONENT_NAME: &str = "Player 2";

// =============================================================================
// PHASES AND ACTIONS
// =============================================================================

/// Where the local client is in the match lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    /// No opponent yet, or waiting for both sides to be ready.
    WaitingForOpponent,
    /// Start armed; counting down to the reveal.
    Preparing,
    /// Board revealed.
    Playing,
    /// Local board completed first.
    Won,
    /// Opponent completed first.
    Lost,
    /// Opponent forfeited.
    OpponentQuit,
    /// Local player forfeited or left.
    Left,
}

impl SessionPhase {
    /// Match is over for this client.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionPhase::Won | SessionPhase::Lost | SessionPhase::OpponentQuit | SessionPhase::Left
        )
    }
}

/// Store work produced by a session handler.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionAction {
    /// Merge our board snapshot into `players/{me}`. Best-effort.
    SyncBoard(PlayerBoardState),
    /// Append an event. Best-effort.
    SendEvent(MultiplayerEvent),
    /// Add us to `readyPlayerIDs`.
    MarkReady,
    /// Set `startedAtEpoch`; only succeeds for the authority.
    ArmCountdown,
    /// Record us as winner if the match is still open.
    AnnounceWinner,
    /// Record our forfeit if the match is still open.
    RecordQuit,
    /// Remove us from `playerIDs` before the reveal.
    Detach,
    /// Drop our queue entry.
    LeaveQueue,
    /// Hand the finalized result to the leaderboard.
    SubmitResult(ArenaMatchResult),
}

/// Opponent details mirrored from their board snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct OpponentView {
    /// Display name.
    pub name: String,
    /// Base64 avatar.
    pub image_base64: Option<String>,
    /// Empty cells left on their board.
    pub squares_left: u32,
    /// Their board values; display only.
    pub values: BoardValues,
    /// At least one snapshot received.
    pub has_snapshot: bool,
}

impl OpponentView {
    fn waiting(squares_left: u32) -> Self {
        Self {
            name: DEFAULT_OPPONENT_NAME.to_string(),
            image_base64: None,
            squares_left,
            values: Vec::new(),
            has_snapshot: false,
        }
    }
}

/// Something shown until `until_epoch`.
#[derive(Clone, Debug, PartialEq)]
pub struct TimedNotice {
    /// What is shown.
    pub text: String,
    /// Server epoch at which it disappears.
    pub until_epoch: f64,
}

/// Read-only view published to the UI after every handler.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSnapshot {
    /// Locked or waiting match.
    pub match_id: Option<String>,
    /// Lifecycle phase.
    pub phase: SessionPhase,
    /// Whole seconds until the reveal while preparing.
    pub countdown: Option<u32>,
    /// Local board.
    pub board: Vec<Cell>,
    /// Selected cell.
    pub selected: Option<CellPosition>,
    /// Empty cells left locally.
    pub squares_left: u32,
    /// Opponent details.
    pub opponent: OpponentView,
    /// Rows, columns and boxes completed this match.
    pub completion: CompletionState,
    /// Digits placed nine times.
    pub completed_digits: BTreeSet<u8>,
    /// Live score.
    pub live_score: u32,
    /// Rejected placements.
    pub errors: u32,
    /// Filled power-push segments.
    pub power_segments: u8,
    /// Punishment currently counting down.
    pub punishment: Option<ArenaPunishmentState>,
    /// Label of the last received punishment.
    pub punishment_label: Option<String>,
    /// Effects in force.
    pub effects: PunishmentEffects,
    /// Punishment we just sent.
    pub outgoing_notice: Option<TimedNotice>,
    /// Emoji we sent.
    pub sent_emoji: Option<TimedNotice>,
    /// Emoji the opponent sent.
    pub opponent_emoji: Option<TimedNotice>,
    /// Seconds since reveal.
    pub elapsed_seconds: u32,
}

// =============================================================================
// SESSION
// =============================================================================

/// Live state of one client in one match.
pub struct MatchSession {
    player: PlayerId,
    leaderboard_id: PlayerId,
    profile: PlayerProfile,
    config: ArenaConfig,
    rng: DeterministicRng,

    token: u64,
    match_state: Option<MatchState>,
    locked_match_id: Option<String>,
    presentation_started: bool,
    phase: SessionPhase,
    countdown: Option<u32>,

    board: Vec<Cell>,
    selected: Option<CellPosition>,
    completion: CompletionState,
    completed_digits: BTreeSet<u8>,
    squares_left: u32,
    opponent: OpponentView,

    score: ScoreTracker,
    live_score: u32,
    meter: PowerPushMeter,
    punishment: Option<ArenaPunishmentState>,
    punishment_label: Option<String>,
    effects: PunishmentEffects,
    outgoing_notice: Option<TimedNotice>,
    sent_emoji: Option<TimedNotice>,
    opponent_emoji: Option<TimedNotice>,
    handled_events: BTreeSet<String>,
    result: Option<ArenaMatchResult>,
}

impl MatchSession {
    /// Session for `player`; results are credited to `leaderboard_id`.
    pub fn new(
        player: PlayerId,
        leaderboard_id: PlayerId,
        profile: PlayerProfile,
        config: ArenaConfig,
        seed: u64,
    ) -> Self {
        let meter = PowerPushMeter::new(config.power_push_target);
        Self {
            player,
            leaderboard_id,
            profile,
            config,
            rng: DeterministicRng::new(seed),
            token: 0,
            match_state: None,
            locked_match_id: None,
            presentation_started: false,
            phase: SessionPhase::WaitingForOpponent,
            countdown: None,
            board: Vec::new(),
            selected: None,
            completion: CompletionState::default(),
            completed_digits: BTreeSet::new(),
            squares_left: 0,
            opponent: OpponentView::waiting(0),
            score: ScoreTracker::new(),
            live_score: 0,
            meter,
            punishment: None,
            punishment_label: None,
            effects: PunishmentEffects::default(),
            outgoing_notice: None,
            sent_emoji: None,
            opponent_emoji: None,
            handled_events: BTreeSet::new(),
            result: None,
        }
    }

    // ===== ACCESSORS =====

    /// Session player ID.
    pub fn player(&self) -> &PlayerId {
        &self.player
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Current match record, as last seen.
    pub fn match_state(&self) -> Option<&MatchState> {
        self.match_state.as_ref()
    }

    /// Match whose updates are accepted, once paired.
    pub fn locked_match_id(&self) -> Option<&str> {
        self.locked_match_id.as_deref()
    }

    /// Current match ID, locked or waiting.
    pub fn match_id(&self) -> Option<&str> {
        self.match_state.as_ref().map(|m| m.match_id.as_str())
    }

    /// Still looking for an opponent.
    pub fn is_searching(&self) -> bool {
        self.phase == SessionPhase::WaitingForOpponent && self.locked_match_id.is_none()
    }

    /// Score telemetry.
    pub fn score(&self) -> &ScoreTracker {
        &self.score
    }

    /// Result produced at finalization, if any.
    pub fn result(&self) -> Option<&ArenaMatchResult> {
        self.result.as_ref()
    }

    /// Leaving now would forfeit.
    pub fn should_confirm_quit(&self) -> bool {
        self.phase == SessionPhase::Playing
    }

    /// UI view.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            match_id: self.match_id().map(str::to_string),
            phase: self.phase,
            countdown: self.countdown,
            board: self.board.clone(),
            selected: self.selected,
            squares_left: self.squares_left,
            opponent: self.opponent.clone(),
            completion: self.completion.clone(),
            completed_digits: self.completed_digits.clone(),
            live_score: self.live_score,
            errors: self.score.errors(),
            power_segments: self.meter.segments(),
            punishment: self.punishment,
            punishment_label: self.punishment_label.clone(),
            effects: self.effects,
            outgoing_notice: self.outgoing_notice.clone(),
            sent_emoji: self.sent_emoji.clone(),
            opponent_emoji: self.opponent_emoji.clone(),
            elapsed_seconds: self.score.elapsed_seconds(),
        }
    }

    // ===== MATCHMAKING RESULTS =====

    /// Token for a matchmaking attempt. Results carrying an older token are
    /// dropped by [`adopt_match`](Self::adopt_match).
    pub fn begin_search(&mut self) -> u64 {
        self.token += 1;
        self.token
    }

    /// Apply the result of `enter_queue`.
    pub fn adopt_match(&mut self, token: u64, state: MatchState, now_epoch: f64) -> Vec<SessionAction> {
        if token != self.token || self.phase == SessionPhase::Left {
            debug!("dropping stale matchmaking result for {}", state.match_id);
            return Vec::new();
        }
        if self.locked_match_id.is_some() {
            debug!("already paired; ignoring matchmaking result {}", state.match_id);
            return Vec::new();
        }

        self.board = state.puzzle.cells.clone();
        self.squares_left = count_empty(&self.board);
        self.opponent = OpponentView::waiting(self.squares_left);
        self.presentation_started = false;
        self.outgoing_notice = None;
        self.punishment_label = None;
        self.handled_events.clear();
        self.match_state = Some(state.clone());

        let mut actions = vec![SessionAction::SyncBoard(self.board_state())];
        if state.is_full() {
            self.locked_match_id = Some(state.match_id.clone());
        }
        actions.extend(self.on_shared_state(Some(state), now_epoch));
        actions
    }

    // ===== STORE NOTIFICATIONS =====

    /// New value of `matches/{id}/shared`.
    pub fn on_shared_state(&mut self, state: Option<MatchState>, now_epoch: f64) -> Vec<SessionAction> {
        let Some(state) = state else {
            return Vec::new();
        };
        if self.match_id() != Some(state.match_id.as_str()) {
            return Vec::new();
        }
        if let Some(locked) = &self.locked_match_id {
            if *locked != state.match_id {
                return Vec::new();
            }
        }
        if self.phase.is_terminal() {
            self.match_state = Some(state);
            return Vec::new();
        }

        let mut actions = Vec::new();
        self.match_state = Some(state.clone());

        if !state.is_full() {
            if matches!(self.phase, SessionPhase::WaitingForOpponent | SessionPhase::Preparing) {
                self.reset_to_waiting();
            }
        } else {
            if self.locked_match_id.is_none() {
                info!("{} locked match {}", self.player, state.match_id);
                self.locked_match_id = Some(state.match_id.clone());
            }
            actions.extend(self.maybe_present(now_epoch));
        }

        if let Some(quitter) = &state.quit_player_id {
            self.handle_quit(quitter);
            return actions;
        }
        if let Some(winner) = &state.winner_player_id {
            let won = *winner == self.player;
            actions.extend(self.finish(won, now_epoch));
            return actions;
        }

        actions.extend(self.try_mark_ready());
        actions.extend(self.try_arm_countdown());
        actions
    }

    /// Opponent board snapshot. Never touches the local puzzle.
    pub fn on_opponent_board(&mut self, board: PlayerBoardState, now_epoch: f64) -> Vec<SessionAction> {
        if board.player_id == self.player || self.match_state.is_none() {
            return Vec::new();
        }
        self.opponent.name = board
            .profile_name
            .clone()
            .unwrap_or_else(|| DEFAULT_OPPONENT_NAME.to_string());
        self.opponent.squares_left = board.remaining_squares();
        if board.profile_image_base64.is_some() {
            self.opponent.image_base64 = board.profile_image_base64.clone();
        }
        self.opponent.values = board.values;
        self.opponent.has_snapshot = true;

        let mut actions = self.try_mark_ready();
        actions.extend(self.maybe_present(now_epoch));
        actions
    }

    /// Event appended to the match log.
    pub fn on_event(&mut self, event: MultiplayerEvent, now_epoch: f64) -> Vec<SessionAction> {
        if event.source_player_id == self.player {
            return Vec::new();
        }
        if !self.handled_events.insert(event.id.clone()) {
            return Vec::new();
        }

        match event.kind {
            EventKind::Emoji => {
                if let Some(emoji) = event.get(keys::EMOJI) {
                    self.opponent_emoji = Some(TimedNotice {
                        text: emoji.to_string(),
                        until_epoch: now_epoch + self.config.emoji_display.as_secs_f64(),
                    });
                }
                Vec::new()
            }
            EventKind::Punishment => {
                if event.target_player_id.as_ref() != Some(&self.player) {
                    return Vec::new();
                }
                let Some(kind) = event.get(keys::TYPE).and_then(PunishmentKind::from_label) else {
                    return Vec::new();
                };
                let end_epoch = event.end_epoch();
                if !kind.is_instant() && end_epoch.is_some_and(|end| end <= now_epoch) {
                    debug!("dropping expired {} from {}", kind.label(), event.source_player_id);
                    return Vec::new();
                }
                self.apply_punishment(kind, end_epoch, now_epoch)
            }
            EventKind::MatchEnded => {
                if let Some(quitter) = event.get(keys::QUIT) {
                    self.handle_quit(&PlayerId::new(quitter));
                    Vec::new()
                } else if let Some(winner) = event.get(keys::WINNER) {
                    let won = winner == self.player.as_str();
                    self.finish(won, now_epoch)
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    // ===== PLAYER INPUT =====

    /// Select a cell.
    pub fn select(&mut self, position: CellPosition) {
        self.selected = Some(position);
    }

    /// Place `digit` in the selected cell.
    pub fn place(&mut self, digit: u8, now_epoch: f64) -> Vec<SessionAction> {
        if self.phase != SessionPhase::Playing || self.effects.move_blocked {
            return Vec::new();
        }
        let Some(position) = self.selected else {
            return Vec::new();
        };
        let index = position.index();
        let Some(cell) = self.board.get(index) else {
            return Vec::new();
        };
        if cell.is_given || cell.value == Some(cell.solution) {
            return Vec::new();
        }

        let values = self.values();
        let correct = is_placement_legal(digit, position, &values) && cell.solution == digit;
        if !correct {
            self.score.record_error();
            self.meter.reset();
            self.update_live_score();
            return Vec::new();
        }

        self.board[index].value = Some(digit);
        self.score.record_correct();
        let values = self.values();
        let delta = evaluate_completions(position, &values, &mut self.completion);
        if digit_completed(digit, &values) && self.completed_digits.insert(digit) {
            debug!("digit {} completed", digit);
        }
        if delta.has_any() {
            debug!("completed units at {:?}: {:?}", position, delta);
        }
        self.squares_left = count_empty(&self.board);

        let mut actions = vec![SessionAction::SyncBoard(self.board_state())];
        if self.meter.advance() {
            actions.extend(self.dispatch_punishment(now_epoch));
        }
        self.update_live_score();

        if self.board.iter().all(Cell::is_solved) {
            info!("{} completed the board", self.player);
            actions.extend(self.finish(true, now_epoch));
        }
        actions
    }

    /// Send an emoji reaction to the opponent.
    pub fn send_emoji(&mut self, emoji: &str, now_epoch: f64) -> Vec<SessionAction> {
        let Some(state) = &self.match_state else {
            return Vec::new();
        };
        let target = state.opponent_of(&self.player).cloned();
        self.sent_emoji = Some(TimedNotice {
            text: emoji.to_string(),
            until_epoch: now_epoch + self.config.emoji_display.as_secs_f64(),
        });
        vec![SessionAction::SendEvent(MultiplayerEvent::emoji(
            &self.player,
            target.as_ref(),
            emoji,
            now_epoch,
        ))]
    }

    /// Forfeit the match.
    pub fn quit(&mut self, now_epoch: f64) -> Vec<SessionAction> {
        self.token += 1;
        let in_match = self.match_state.is_some();
        let was_terminal = self.phase.is_terminal();
        self.phase = SessionPhase::Left;
        self.countdown = None;

        if !in_match || was_terminal {
            return vec![SessionAction::LeaveQueue];
        }
        info!("{} quit match {:?}", self.player, self.match_id());
        vec![
            SessionAction::SendEvent(MultiplayerEvent::quit(&self.player, now_epoch)),
            SessionAction::RecordQuit,
            SessionAction::LeaveQueue,
        ]
    }

    /// Leave the arena. Forfeits once the board is revealed; before that
    /// the player is detached so the opponent goes back to matchmaking.
    pub fn leave(&mut self, now_epoch: f64) -> Vec<SessionAction> {
        if self.should_confirm_quit() {
            return self.quit(now_epoch);
        }
        self.token += 1;
        let revealed = self.phase != SessionPhase::WaitingForOpponent && self.phase != SessionPhase::Preparing;
        let in_match = self.match_state.is_some();
        self.phase = SessionPhase::Left;
        self.countdown = None;

        if in_match && !revealed {
            info!("{} left match {:?} before the reveal", self.player, self.match_id());
            vec![SessionAction::Detach, SessionAction::LeaveQueue]
        } else {
            vec![SessionAction::LeaveQueue]
        }
    }

    // ===== TIMERS =====

    /// One second of match clock.
    pub fn tick_clock(&mut self) {
        if self.phase != SessionPhase::Playing {
            return;
        }
        self.score.tick();
        self.update_live_score();
    }

    /// Countdown poll while preparing. Reveals the board at zero.
    pub fn tick_countdown(&mut self, now_epoch: f64) -> Vec<SessionAction> {
        if self.phase != SessionPhase::Preparing {
            return Vec::new();
        }
        let Some(start) = self.match_state.as_ref().and_then(|m| m.started_at_epoch) else {
            return Vec::new();
        };
        let remaining = seconds_until(start, now_epoch);
        self.countdown = Some(remaining);
        if remaining == 0 {
            self.reveal()
        } else {
            Vec::new()
        }
    }

    /// Re-derive the punishment countdown from its absolute expiry.
    pub fn tick_punishment(&mut self, now_epoch: f64) {
        let Some(active) = self.punishment.as_mut() else {
            return;
        };
        if active.refresh(now_epoch) {
            debug!("{} expired", active.kind.label());
            self.punishment = None;
            self.punishment_label = None;
            self.effects.clear();
        }
    }

    /// Hide emoji and notices whose display time has passed.
    pub fn expire_notices(&mut self, now_epoch: f64) {
        for notice in [&mut self.sent_emoji, &mut self.opponent_emoji, &mut self.outgoing_notice] {
            if notice.as_ref().is_some_and(|n| n.until_epoch <= now_epoch) {
                *notice = None;
            }
        }
    }

    // ===== INTERNALS =====

    fn values(&self) -> BoardValues {
        self.board.iter().map(|c| c.value).collect()
    }

    fn filled_count(&self) -> u32 {
        self.board.iter().filter(|c| c.value.is_some()).count() as u32
    }

    fn board_state(&self) -> PlayerBoardState {
        PlayerBoardState {
            player_id: self.player.clone(),
            values: self.values(),
            completion: self.completion.clone(),
            profile_name: Some(self.profile.display_name.clone()),
            profile_image_base64: None,
            squares_left: Some(self.squares_left),
        }
    }

    fn update_live_score(&mut self) {
        self.live_score = self.score.live_score(self.filled_count());
    }

    fn reset_to_waiting(&mut self) {
        debug!("{} back to waiting", self.player);
        self.phase = SessionPhase::WaitingForOpponent;
        self.countdown = None;
        self.presentation_started = false;
        self.locked_match_id = None;
        self.opponent = OpponentView::waiting(self.squares_left);
    }

    fn maybe_present(&mut self, now_epoch: f64) -> Vec<SessionAction> {
        if self.presentation_started || self.phase.is_terminal() {
            return Vec::new();
        }
        let Some(state) = &self.match_state else {
            return Vec::new();
        };
        if !state.is_full() {
            return Vec::new();
        }
        let Some(start) = state.started_at_epoch else {
            self.phase = SessionPhase::WaitingForOpponent;
            return Vec::new();
        };

        self.presentation_started = true;
        self.locked_match_id = Some(state.match_id.clone());
        let remaining = seconds_until(start, now_epoch);
        if remaining == 0 {
            return self.reveal();
        }
        info!("{} counting down {}s in {}", self.player, remaining, state.match_id);
        self.phase = SessionPhase::Preparing;
        self.countdown = Some(remaining);
        Vec::new()
    }

    fn ready_prerequisites_met(&self) -> bool {
        let full = self.match_state.as_ref().is_some_and(MatchState::is_full);
        full && self.opponent.has_snapshot && !self.opponent.name.trim().is_empty()
    }

    fn try_mark_ready(&mut self) -> Vec<SessionAction> {
        if self.phase.is_terminal() || !self.ready_prerequisites_met() {
            return Vec::new();
        }
        let player = self.player.clone();
        let Some(state) = self.match_state.as_mut() else {
            return Vec::new();
        };
        if state.is_terminal() || !state.mark_ready(&player) {
            return Vec::new();
        }
        debug!("{} ready in {}", player, state.match_id);
        vec![SessionAction::MarkReady]
    }

    fn try_arm_countdown(&self) -> Vec<SessionAction> {
        let Some(state) = &self.match_state else {
            return Vec::new();
        };
        let armable = state.started_at_epoch.is_none() && !state.is_terminal() && state.all_ready();
        if armable && state.authority() == Some(&self.player) {
            vec![SessionAction::ArmCountdown]
        } else {
            Vec::new()
        }
    }

    fn reveal(&mut self) -> Vec<SessionAction> {
        info!("{} revealed board of {:?}", self.player, self.match_id());
        self.phase = SessionPhase::Playing;
        self.countdown = None;
        self.completion = CompletionState::default();
        self.completed_digits = completed_digits(&self.values());
        self.outgoing_notice = None;
        self.punishment = None;
        self.punishment_label = None;
        self.effects.clear();
        self.score.reset();
        self.meter.reset();
        self.live_score = 0;
        self.result = None;
        vec![SessionAction::SyncBoard(self.board_state())]
    }

    fn dispatch_punishment(&mut self, now_epoch: f64) -> Vec<SessionAction> {
        let Some(target) = self.match_state.as_ref().and_then(|m| m.opponent_of(&self.player)).cloned() else {
            return Vec::new();
        };
        let kind = PunishmentKind::roll(&mut self.rng);
        let end_epoch = (!kind.is_instant()).then(|| now_epoch + kind.duration_secs() as f64);
        info!("{} sends {} to {}", self.player, kind.label(), target);

        self.outgoing_notice = Some(TimedNotice {
            text: kind.label().to_string(),
            until_epoch: end_epoch.unwrap_or(now_epoch + self.config.emoji_display.as_secs_f64()),
        });
        vec![SessionAction::SendEvent(MultiplayerEvent::punishment(
            &self.player,
            &target,
            kind.label(),
            end_epoch,
            now_epoch,
        ))]
    }

    fn apply_punishment(&mut self, kind: PunishmentKind, end_epoch: Option<f64>, now_epoch: f64) -> Vec<SessionAction> {
        if self.phase != SessionPhase::Playing {
            return Vec::new();
        }
        info!("{} received {}", self.player, kind.label());
        self.punishment_label = Some(kind.label().to_string());
        self.effects.clear();

        if kind.is_instant() {
            for index in cells_to_clear(&self.board, self.config.clear_cells_count, &mut self.rng) {
                self.board[index].value = None;
            }
            self.completed_digits = completed_digits(&self.values());
            self.squares_left = count_empty(&self.board);
            self.punishment = None;
            self.update_live_score();
            return vec![SessionAction::SyncBoard(self.board_state())];
        }

        self.effects = PunishmentEffects::roll(kind, &mut self.rng);
        self.punishment = Some(ArenaPunishmentState::start(kind, end_epoch, now_epoch));
        Vec::new()
    }

    fn handle_quit(&mut self, quitter: &PlayerId) {
        if *quitter == self.player || self.phase.is_terminal() {
            return;
        }
        info!("{} quit; {} wins by forfeit", quitter, self.player);
        self.phase = SessionPhase::OpponentQuit;
        self.countdown = None;
        self.effects.clear();
        self.punishment = None;
    }

    fn finish(&mut self, won: bool, now_epoch: f64) -> Vec<SessionAction> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        self.phase = if won { SessionPhase::Won } else { SessionPhase::Lost };
        self.countdown = None;
        self.effects.clear();
        self.punishment = None;

        let mut actions = Vec::new();
        if won {
            actions.push(SessionAction::SendEvent(MultiplayerEvent::winner(&self.player, now_epoch)));
            actions.push(SessionAction::AnnounceWinner);
        }
        actions.extend(self.finalize_score(won, now_epoch));
        actions
    }

    /// Finalize the score once per match and emit the result.
    fn finalize_score(&mut self, did_finish: bool, now_epoch: f64) -> Vec<SessionAction> {
        let Some(match_id) = self.match_id().map(str::to_string) else {
            return Vec::new();
        };
        let Some(breakdown) = self.score.finalize(self.filled_count(), did_finish) else {
            return Vec::new();
        };
        let result = ArenaMatchResult::from_breakdown(
            self.leaderboard_id.clone(),
            self.profile.display_name.clone(),
            match_id,
            period_key(now_epoch),
            &breakdown,
            now_epoch,
        );
        info!("{} finalized score {:.0} (finished: {})", self.player, result.score, did_finish);
        self.result = Some(result.clone());
        vec![SessionAction::SubmitResult(result)]
    }
}

fn count_empty(board: &[Cell]) -> u32 {
    board.iter().filter(|c| c.value.is_none()).count() as u32
}

/// Board fields for a merge-write. The avatar key is dropped even when set,
/// so syncs never rewrite the one stored when the player joined.
pub fn board_update_fields(board: &PlayerBoardState) -> Map<String, Value> {
    match board.to_value() {
        Value::Object(mut map) => {
            map.remove("profileImageBase64");
            map
        }
        _ => Map::new(),
    }
}

//! Shared Match Records
//!
//! Records stored in the shared store: the match itself, each player's board
//! snapshot and queue entries. Remote payloads are parsed defensively; a
//! truncated or oddly-shaped board never fails a whole update.

use std::fmt;

use serde::{Serialize, Deserialize};
use serde_json::Value;

use crate::puzzle::grid::{normalize_values, BoardValues, CompletionState, Puzzle, GRID_CELLS};

// =============================================================================
// PLAYER ID
// =============================================================================

/// Session-scoped player identifier.
///
/// Implements Ord; the smallest ID in a match is its authority.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl PlayerId {
    /// Wrap a string ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the ID string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Display name and avatar supplied by the profile collaborator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlayerProfile {
    /// Display name.
    pub display_name: String,
    /// Base64 avatar bytes, if any.
    pub image_base64: Option<String>,
}

impl PlayerProfile {
    /// Profile with a name and no avatar.
    pub fn named(display_name: impl Into<String>) -> Self {
        Self { display_name: display_name.into(), image_base64: None }
    }
}

// =============================================================================
// MATCH STATE
// =============================================================================

/// Why a player could not be attached to a match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum JoinRejected {
    /// Already two players.
    #[error("match is full")]
    Full,
    /// A quit or winner is recorded.
    #[error("match already finished")]
    Finished,
}

/// Shared match record at `matches/{matchID}/shared`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchState {
    /// Six-character match code.
    #[serde(rename = "matchID")]
    pub match_id: String,
    /// Puzzle both players solve.
    pub puzzle: Puzzle,
    /// Participants in join order, at most two.
    #[serde(rename = "playerIDs", default)]
    pub player_ids: Vec<PlayerId>,
    /// Server epoch at which the board is revealed.
    #[serde(rename = "startedAtEpoch", default, skip_serializing_if = "Option::is_none")]
    pub started_at_epoch: Option<f64>,
    /// Players that have seen their opponent, kept sorted.
    #[serde(rename = "readyPlayerIDs", default, skip_serializing_if = "Option::is_none")]
    pub ready_player_ids: Option<Vec<PlayerId>>,
    /// Player that forfeited.
    #[serde(rename = "quitPlayerID", default, skip_serializing_if = "Option::is_none")]
    pub quit_player_id: Option<PlayerId>,
    /// Player that completed the board first.
    #[serde(rename = "winnerPlayerID", default, skip_serializing_if = "Option::is_none")]
    pub winner_player_id: Option<PlayerId>,
}

impl MatchState {
    /// New single-player match.
    pub fn new(match_id: impl Into<String>, puzzle: Puzzle, host: PlayerId) -> Self {
        Self {
            match_id: match_id.into(),
            puzzle,
            player_ids: vec![host],
            started_at_epoch: None,
            ready_player_ids: None,
            quit_player_id: None,
            winner_player_id: None,
        }
    }

    /// Parse a stored record.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Serialize for the store.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Quit or winner recorded.
    pub fn is_terminal(&self) -> bool {
        self.quit_player_id.is_some() || self.winner_player_id.is_some()
    }

    /// Two players present.
    pub fn is_full(&self) -> bool {
        self.player_ids.len() >= crate::PLAYERS_PER_MATCH
    }

    /// Whether `player` participates.
    pub fn contains(&self, player: &PlayerId) -> bool {
        self.player_ids.contains(player)
    }

    /// Lexically smallest participant.
    pub fn authority(&self) -> Option<&PlayerId> {
        self.player_ids.iter().min()
    }

    /// The other participant.
    pub fn opponent_of(&self, player: &PlayerId) -> Option<&PlayerId> {
        self.player_ids.iter().find(|p| *p != player)
    }

    /// Both players present and every one of them marked ready.
    pub fn all_ready(&self) -> bool {
        let ready = self.ready_player_ids.as_deref().unwrap_or(&[]);
        self.is_full() && self.player_ids.iter().all(|p| ready.contains(p))
    }

    /// Add `player` to the sorted ready list. Returns false if already there.
    pub fn mark_ready(&mut self, player: &PlayerId) -> bool {
        let ready = self.ready_player_ids.get_or_insert_with(Vec::new);
        if ready.contains(player) {
            return false;
        }
        ready.push(player.clone());
        ready.sort();
        true
    }

    /// Clear start, readiness and terminal fields.
    pub fn reset_lifecycle(&mut self) {
        self.started_at_epoch = None;
        self.ready_player_ids = None;
        self.quit_player_id = None;
        self.winner_player_id = None;
    }

    /// Append `player` and reset the lifecycle fields. A player already in
    /// the match is accepted unchanged.
    pub fn attach_player(&mut self, player: PlayerId) -> Result<(), JoinRejected> {
        if self.contains(&player) {
            return Ok(());
        }
        if self.is_terminal() {
            return Err(JoinRejected::Finished);
        }
        if self.is_full() {
            return Err(JoinRejected::Full);
        }
        self.player_ids.push(player);
        self.reset_lifecycle();
        Ok(())
    }

    /// Remove `player` and reset the lifecycle fields. Returns false if the
    /// player was not present.
    pub fn detach_player(&mut self, player: &PlayerId) -> bool {
        let before = self.player_ids.len();
        self.player_ids.retain(|p| p != player);
        if self.player_ids.len() == before {
            return false;
        }
        self.reset_lifecycle();
        true
    }

    /// Set the start epoch if `by` is the authority, everyone is ready and no
    /// start is set yet.
    pub fn arm_countdown(&mut self, by: &PlayerId, now_epoch: f64, grace_secs: f64) -> bool {
        if self.started_at_epoch.is_some() || self.is_terminal() || !self.all_ready() {
            return false;
        }
        if self.authority() != Some(by) {
            return false;
        }
        self.started_at_epoch = Some(now_epoch + grace_secs);
        true
    }

    /// Record the winner unless the match already ended.
    pub fn set_winner_if_open(&mut self, winner: &PlayerId) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.winner_player_id = Some(winner.clone());
        true
    }

    /// Record a forfeit unless the match already ended. Also clears the
    /// start and readiness.
    pub fn set_quit_if_open(&mut self, quitter: &PlayerId) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.quit_player_id = Some(quitter.clone());
        self.ready_player_ids = None;
        self.started_at_epoch = None;
        true
    }
}

// =============================================================================
// PLAYER BOARD STATE
// =============================================================================

/// A player's board snapshot at `matches/{matchID}/players/{playerID}`.
///
/// Written only by its owner.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerBoardState {
    /// Owner.
    #[serde(rename = "playerID")]
    pub player_id: PlayerId,
    /// 81 board values.
    pub values: BoardValues,
    /// Completed units.
    #[serde(default)]
    pub completion: CompletionState,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
    /// Base64 avatar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image_base64: Option<String>,
    /// Empty cells left.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub squares_left: Option<u32>,
}

impl PlayerBoardState {
    /// Empty squares left, falling back to counting empty values.
    pub fn remaining_squares(&self) -> u32 {
        self.squares_left
            .unwrap_or_else(|| self.values.iter().filter(|v| v.is_none()).count() as u32)
    }

    /// Serialize for the store.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse a remote snapshot. Only `playerID` is required; everything else
    /// is normalized.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let player_id = object.get("playerID")?.as_str()?.to_string();

        let values = object.get("values").map(parse_board_values).unwrap_or_default();
        let completion = object
            .get("completion")
            .and_then(|c| serde_json::from_value(c.clone()).ok())
            .unwrap_or_default();
        let text = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);

        Some(Self {
            player_id: PlayerId(player_id),
            values: normalize_values(&values),
            completion,
            profile_name: text("profileName"),
            profile_image_base64: text("profileImageBase64"),
            squares_left: object
                .get("squaresLeft")
                .and_then(Value::as_u64)
                .map(|n| n.min(GRID_CELLS as u64) as u32),
        })
    }
}

fn parse_digit(value: &Value) -> Option<u8> {
    let digit = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    (1..=9).contains(&digit).then_some(digit as u8)
}

/// Board values from an array, or from an object keyed by cell index.
pub fn parse_board_values(value: &Value) -> BoardValues {
    match value {
        Value::Array(items) => normalize_values(&items.iter().map(parse_digit).collect::<Vec<_>>()),
        Value::Object(map) => {
            let mut values = vec![None; GRID_CELLS];
            for (key, item) in map {
                if let Ok(index) = key.parse::<usize>() {
                    if index < GRID_CELLS {
                        values[index] = parse_digit(item);
                    }
                }
            }
            values
        }
        _ => vec![None; GRID_CELLS],
    }
}

// =============================================================================
// QUEUE ENTRY
// =============================================================================

/// Waiting-queue entry at `queue/{playerID}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Match the player is waiting in.
    #[serde(rename = "matchID")]
    pub match_id: String,
    /// Server epoch of the last heartbeat.
    #[serde(rename = "createdAtEpoch")]
    pub created_at_epoch: f64,
    /// Display name.
    #[serde(rename = "profileName", default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
}

impl QueueEntry {
    /// Parse a stored entry; `None` when `matchID` or the timestamp is
    /// missing. Timestamps may be numbers or numeric strings.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let match_id = object.get("matchID")?.as_str()?.to_string();
        let created_at_epoch = match object.get("createdAtEpoch")? {
            Value::Number(n) => n.as_f64()?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        Some(Self {
            match_id,
            created_at_epoch,
            profile_name: object.get("profileName").and_then(Value::as_str).map(str::to_string),
        })
    }

    /// Serialize for the store.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Older than `max_age_secs` at `now_epoch`.
    pub fn is_stale(&self, now_epoch: f64, max_age_secs: f64) -> bool {
        now_epoch - self.created_at_epoch > max_age_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::puzzle::{Difficulty, PuzzleGenerator};
    use serde_json::json;

    fn sample_match() -> MatchState {
        let puzzle = PuzzleGenerator::new(1).generate(Difficulty::Simple);
        MatchState::new("ABC123", puzzle, PlayerId::from("p-b"))
    }

    #[test]
    fn test_attach_appends_in_join_order() {
        let mut state = sample_match();
        state.started_at_epoch = Some(5.0);
        state.attach_player(PlayerId::from("p-a")).unwrap();
        assert_eq!(state.player_ids, vec![PlayerId::from("p-b"), PlayerId::from("p-a")]);
        assert_eq!(state.started_at_epoch, None);
        assert_eq!(state.authority(), Some(&PlayerId::from("p-a")));

        assert_eq!(state.attach_player(PlayerId::from("p-c")), Err(JoinRejected::Full));
    }

    #[test]
    fn test_attach_rejects_finished_match() {
        let mut state = sample_match();
        state.winner_player_id = Some(PlayerId::from("p-b"));
        assert_eq!(state.attach_player(PlayerId::from("p-a")), Err(JoinRejected::Finished));
    }

    #[test]
    fn test_arm_requires_authority_and_readiness() {
        let mut state = sample_match();
        state.attach_player(PlayerId::from("p-a")).unwrap();
        let a = PlayerId::from("p-a");
        let b = PlayerId::from("p-b");

        assert!(!state.arm_countdown(&a, 100.0, 5.0));
        state.mark_ready(&b);
        assert!(!state.all_ready());
        state.mark_ready(&a);
        assert_eq!(state.ready_player_ids, Some(vec![a.clone(), b.clone()]));

        assert!(!state.arm_countdown(&b, 100.0, 5.0));
        assert!(state.arm_countdown(&a, 100.0, 5.0));
        assert_eq!(state.started_at_epoch, Some(105.0));
        assert!(!state.arm_countdown(&a, 200.0, 5.0));
    }

    #[test]
    fn test_terminal_fields_set_once() {
        let mut state = sample_match();
        let b = PlayerId::from("p-b");
        assert!(state.set_winner_if_open(&b));
        assert!(!state.set_quit_if_open(&b));
        assert!(state.is_terminal());
    }

    #[test]
    fn test_detach_resets_lifecycle() {
        let mut state = sample_match();
        state.attach_player(PlayerId::from("p-a")).unwrap();
        state.mark_ready(&PlayerId::from("p-a"));
        assert!(state.detach_player(&PlayerId::from("p-a")));
        assert_eq!(state.player_ids.len(), 1);
        assert!(state.ready_player_ids.is_none());
        assert!(!state.detach_player(&PlayerId::from("p-z")));
    }

    #[test]
    fn test_match_state_wire_names() {
        let mut state = sample_match();
        state.quit_player_id = Some(PlayerId::from("p-b"));
        let value = state.to_value();
        assert_eq!(value["matchID"], json!("ABC123"));
        assert_eq!(value["playerIDs"], json!(["p-b"]));
        assert_eq!(value["quitPlayerID"], json!("p-b"));
        assert!(value.get("startedAtEpoch").is_none());

        assert_eq!(MatchState::from_value(&value), Some(state));
    }

    #[test]
    fn test_board_state_parses_truncated_values() {
        let value = json!({
            "playerID": "p-a",
            "values": [1, null, "3", 12],
            "profileName": "Ada",
        });
        let board = PlayerBoardState::from_value(&value).unwrap();
        assert_eq!(board.values.len(), 81);
        assert_eq!(&board.values[..4], &[Some(1), None, Some(3), None]);
        assert_eq!(board.remaining_squares(), 79);
        assert_eq!(board.profile_name.as_deref(), Some("Ada"));
    }

    #[test]
    fn test_board_state_parses_index_keyed_values() {
        let value = json!({
            "playerID": "p-a",
            "values": {"0": 5, "80": 9, "99": 1},
            "squaresLeft": 12,
        });
        let board = PlayerBoardState::from_value(&value).unwrap();
        assert_eq!(board.values[0], Some(5));
        assert_eq!(board.values[80], Some(9));
        assert_eq!(board.remaining_squares(), 12);

        assert!(PlayerBoardState::from_value(&json!({"values": []})).is_none());
    }

    #[test]
    fn test_queue_entry_staleness() {
        let entry = QueueEntry::from_value(&json!({"matchID": "X", "createdAtEpoch": 100.0})).unwrap();
        assert!(!entry.is_stale(140.0, 45.0));
        assert!(entry.is_stale(146.0, 45.0));
        assert!(QueueEntry::from_value(&json!({"createdAtEpoch": 1})).is_none());
        let textual = QueueEntry::from_value(&json!({"matchID": "X", "createdAtEpoch": "12.5"}));
        assert_eq!(textual.map(|e| e.created_at_epoch), Some(12.5));
    }
}

//! Match Events
//!
//! Append-only records at `matches/{matchID}/events/{eventID}`. Events are
//! immutable once written; consumers drop the ones they authored.

use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};
use serde_json::Value;

use crate::game::state::PlayerId;

/// Event type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// A cell value changed.
    CellUpdate,
    /// A unit was completed.
    Completion,
    /// Generic sabotage.
    Sabotage,
    /// Emoji reaction.
    Emoji,
    /// Opponent-targeted punishment.
    Punishment,
    /// Power-up appeared.
    PowerSpawn,
    /// Power-up claimed.
    PowerClaim,
    /// Win or forfeit.
    MatchEnded,
    /// Anything this build does not know; ignored.
    #[serde(other)]
    Unknown,
}

/// Payload keys.
pub mod keys {
    /// Emoji name.
    pub const EMOJI: &str = "emoji";
    /// Punishment label.
    pub const TYPE: &str = "type";
    /// Punishment expiry, server epoch seconds.
    pub const END_EPOCH: &str = "endEpoch";
    /// Winner of a finished match.
    pub const WINNER: &str = "winnerPlayerID";
    /// Player that forfeited.
    pub const QUIT: &str = "quitPlayerID";
}

/// One shared event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiplayerEvent {
    /// Unique ID, also the store key.
    pub id: String,
    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Author.
    #[serde(rename = "sourcePlayerID")]
    pub source_player_id: PlayerId,
    /// Recipient, for targeted events.
    #[serde(rename = "targetPlayerID", default, skip_serializing_if = "Option::is_none")]
    pub target_player_id: Option<PlayerId>,
    /// String payload.
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
    /// Server epoch at creation.
    #[serde(rename = "createdAtEpoch")]
    pub created_at_epoch: f64,
}

impl MultiplayerEvent {
    fn new(
        kind: EventKind,
        source: &PlayerId,
        target: Option<&PlayerId>,
        payload: BTreeMap<String, String>,
        now_epoch: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            source_player_id: source.clone(),
            target_player_id: target.cloned(),
            payload,
            created_at_epoch: now_epoch,
        }
    }

    /// Emoji reaction aimed at `target`.
    pub fn emoji(source: &PlayerId, target: Option<&PlayerId>, emoji: &str, now_epoch: f64) -> Self {
        let payload = BTreeMap::from([(keys::EMOJI.to_string(), emoji.to_string())]);
        Self::new(EventKind::Emoji, source, target, payload, now_epoch)
    }

    /// Punishment with label and optional absolute expiry.
    pub fn punishment(
        source: &PlayerId,
        target: &PlayerId,
        label: &str,
        end_epoch: Option<f64>,
        now_epoch: f64,
    ) -> Self {
        let mut payload = BTreeMap::from([(keys::TYPE.to_string(), label.to_string())]);
        if let Some(end) = end_epoch {
            payload.insert(keys::END_EPOCH.to_string(), end.to_string());
        }
        Self::new(EventKind::Punishment, source, Some(target), payload, now_epoch)
    }

    /// Match won by `source`.
    pub fn winner(source: &PlayerId, now_epoch: f64) -> Self {
        let payload = BTreeMap::from([(keys::WINNER.to_string(), source.0.clone())]);
        Self::new(EventKind::MatchEnded, source, None, payload, now_epoch)
    }

    /// Match forfeited by `source`.
    pub fn quit(source: &PlayerId, now_epoch: f64) -> Self {
        let payload = BTreeMap::from([(keys::QUIT.to_string(), source.0.clone())]);
        Self::new(EventKind::MatchEnded, source, None, payload, now_epoch)
    }

    /// Payload entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }

    /// Parsed `endEpoch`, if present and numeric.
    pub fn end_epoch(&self) -> Option<f64> {
        self.get(keys::END_EPOCH).and_then(|s| s.trim().parse().ok())
    }

    /// Serialize for the store.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse a stored event. `key` fills in a missing `id`; numeric and
    /// boolean payload values are stringified.
    pub fn from_value(key: &str, value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let kind = object
            .get("type")
            .and_then(|t| serde_json::from_value(t.clone()).ok())
            .unwrap_or(EventKind::Unknown);
        let source = object.get("sourcePlayerID")?.as_str()?;

        let mut payload = BTreeMap::new();
        if let Some(Value::Object(map)) = object.get("payload") {
            for (k, v) in map {
                let text = match v {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                payload.insert(k.clone(), text);
            }
        }

        Some(Self {
            id: object
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or(key)
                .to_string(),
            kind,
            source_player_id: PlayerId::new(source),
            target_player_id: object
                .get("targetPlayerID")
                .and_then(Value::as_str)
                .map(PlayerId::new),
            payload,
            created_at_epoch: object.get("createdAtEpoch").and_then(Value::as_f64).unwrap_or(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_punishment_payload() {
        let a = PlayerId::from("p-a");
        let b = PlayerId::from("p-b");
        let event = MultiplayerEvent::punishment(&a, &b, "Fade!", Some(110.5), 100.5);
        assert_eq!(event.kind, EventKind::Punishment);
        assert_eq!(event.get(keys::TYPE), Some("Fade!"));
        assert_eq!(event.end_epoch(), Some(110.5));

        let instant = MultiplayerEvent::punishment(&a, &b, "Bye! Bye!", None, 100.5);
        assert_eq!(instant.end_epoch(), None);
    }

    #[test]
    fn test_wire_format() {
        let event = MultiplayerEvent::winner(&PlayerId::from("p-a"), 10.0);
        let value = event.to_value();
        assert_eq!(value["type"], json!("matchEnded"));
        assert_eq!(value["sourcePlayerID"], json!("p-a"));
        assert_eq!(value["payload"]["winnerPlayerID"], json!("p-a"));
        assert!(value.get("targetPlayerID").is_none());
        assert_eq!(MultiplayerEvent::from_value(&event.id, &value), Some(event));
    }

    #[test]
    fn test_unknown_type_and_numeric_payload() {
        let value = json!({
            "type": "confetti",
            "sourcePlayerID": "p-b",
            "payload": {"endEpoch": 123.5, "flag": true, "nested": {}},
            "createdAtEpoch": 1
        });
        let event = MultiplayerEvent::from_value("evt-1", &value).unwrap();
        assert_eq!(event.kind, EventKind::Unknown);
        assert_eq!(event.id, "evt-1");
        assert_eq!(event.end_epoch(), Some(123.5));
        assert_eq!(event.get("flag"), Some("true"));
        assert!(event.get("nested").is_none());
    }

    #[test]
    fn test_missing_source_rejected() {
        assert!(MultiplayerEvent::from_value("k", &json!({"type": "emoji"})).is_none());
    }
}

//! Punishments and the Power-Push Meter
//!
//! Filling the meter with consecutive correct placements sends a random
//! punishment to the opponent. Timed punishments carry an absolute server
//! expiry so both clients count down to the same instant.

use serde::{Serialize, Deserialize};

use crate::core::clock::seconds_until;
use crate::core::rng::DeterministicRng;
use crate::puzzle::grid::Cell;

// =============================================================================
// PUNISHMENT KIND
// =============================================================================

/// Punishment catalogue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PunishmentKind {
    /// Input blocked.
    Pause,
    /// One row or column hidden.
    Hidden,
    /// Several filled cells cleared, instantly.
    ByeBye,
    /// One digit faded.
    Fade,
    /// One box blacked out.
    Square,
}

impl PunishmentKind {
    /// Every kind, in roll order.
    pub const ALL: [PunishmentKind; 5] = [
        PunishmentKind::Pause,
        PunishmentKind::Hidden,
        PunishmentKind::ByeBye,
        PunishmentKind::Fade,
        PunishmentKind::Square,
    ];

    /// Wire label, also shown to players.
    pub fn label(self) -> &'static str {
        match self {
            PunishmentKind::Pause => "Pause!",
            PunishmentKind::Hidden => "Hidden!",
            PunishmentKind::ByeBye => "Bye! Bye!",
            PunishmentKind::Fade => "Fade!",
            PunishmentKind::Square => "Square!",
        }
    }

    /// Parse a wire label.
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.label() == label)
    }

    /// Nominal duration in seconds; 0 for instant kinds.
    pub fn duration_secs(self) -> u32 {
        match self {
            PunishmentKind::Pause => 5,
            PunishmentKind::Hidden => 10,
            PunishmentKind::ByeBye => 0,
            PunishmentKind::Fade => 10,
            PunishmentKind::Square => 10,
        }
    }

    /// No countdown.
    pub fn is_instant(self) -> bool {
        self.duration_secs() == 0
    }

    /// Pick a kind uniformly.
    pub fn roll(rng: &mut DeterministicRng) -> Self {
        Self::ALL[rng.next_int(Self::ALL.len() as u32) as usize]
    }
}

// =============================================================================
// ACTIVE STATE
// =============================================================================

/// Session-local countdown of a received punishment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArenaPunishmentState {
    /// Kind in effect.
    pub kind: PunishmentKind,
    /// Whole seconds left, re-derived every tick.
    pub remaining_seconds: u32,
    /// Absolute server expiry.
    pub expires_at_epoch: f64,
}

impl ArenaPunishmentState {
    /// Start a countdown. Without a carried expiry the nominal duration is
    /// counted from `now_epoch`.
    pub fn start(kind: PunishmentKind, end_epoch: Option<f64>, now_epoch: f64) -> Self {
        let expires_at_epoch = end_epoch.unwrap_or(now_epoch + kind.duration_secs() as f64);
        Self {
            kind,
            remaining_seconds: seconds_until(expires_at_epoch, now_epoch),
            expires_at_epoch,
        }
    }

    /// Re-derive the remaining time. Returns true once expired.
    pub fn refresh(&mut self, now_epoch: f64) -> bool {
        self.remaining_seconds = seconds_until(self.expires_at_epoch, now_epoch);
        self.remaining_seconds == 0
    }
}

/// Visual and input effects of the active punishment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PunishmentEffects {
    /// Placements ignored.
    pub move_blocked: bool,
    /// Hidden row.
    pub hidden_row: Option<u8>,
    /// Hidden column.
    pub hidden_column: Option<u8>,
    /// Faded digit.
    pub faded_digit: Option<u8>,
    /// Blacked-out box.
    pub blacked_box: Option<u8>,
}

impl PunishmentEffects {
    /// Effects for a timed kind. Instant kinds produce no lasting effect.
    pub fn roll(kind: PunishmentKind, rng: &mut DeterministicRng) -> Self {
        let mut effects = Self::default();
        match kind {
            PunishmentKind::Pause => effects.move_blocked = true,
            PunishmentKind::Hidden => {
                let line = rng.next_int(9) as u8;
                if rng.next_coin() {
                    effects.hidden_row = Some(line);
                } else {
                    effects.hidden_column = Some(line);
                }
            }
            PunishmentKind::Fade => effects.faded_digit = Some(rng.next_int_range(1, 9) as u8),
            PunishmentKind::Square => effects.blacked_box = Some(rng.next_int(9) as u8),
            PunishmentKind::ByeBye => {}
        }
        effects
    }

    /// Any effect in place.
    pub fn is_active(&self) -> bool {
        *self != Self::default()
    }

    /// Remove all effects.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Indices of up to `count` filled, non-given cells, chosen at random.
pub fn cells_to_clear(cells: &[Cell], count: usize, rng: &mut DeterministicRng) -> Vec<usize> {
    let mut candidates: Vec<usize> = cells
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.is_given && c.value.is_some())
        .map(|(i, _)| i)
        .collect();
    rng.shuffle(&mut candidates);
    candidates.truncate(count);
    candidates
}

// =============================================================================
// POWER-PUSH METER
// =============================================================================

/// Counter of consecutive correct placements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PowerPushMeter {
    segments: u8,
    target: u8,
}

impl Default for PowerPushMeter {
    fn default() -> Self {
        Self::new(10)
    }
}

impl PowerPushMeter {
    /// Empty meter that fills at `target`.
    pub fn new(target: u8) -> Self {
        Self { segments: 0, target: target.max(1) }
    }

    /// Filled segments.
    pub fn segments(&self) -> u8 {
        self.segments
    }

    /// Segments needed to fire.
    pub fn target(&self) -> u8 {
        self.target
    }

    /// Add one segment. Returns true and empties the meter when it fills.
    pub fn advance(&mut self) -> bool {
        self.segments = (self.segments + 1).min(self.target);
        if self.segments >= self.target {
            self.segments = 0;
            true
        } else {
            false
        }
    }

    /// Empty the meter.
    pub fn reset(&mut self) {
        self.segments = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_round_trip() {
        for kind in PunishmentKind::ALL {
            assert_eq!(PunishmentKind::from_label(kind.label()), Some(kind));
        }
        assert_eq!(PunishmentKind::from_label("Boom!"), None);
        assert!(PunishmentKind::ByeBye.is_instant());
        assert_eq!(PunishmentKind::Pause.duration_secs(), 5);
    }

    #[test]
    fn test_countdown_tracks_absolute_expiry() {
        let mut state = ArenaPunishmentState::start(PunishmentKind::Fade, Some(110.0), 100.2);
        assert_eq!(state.remaining_seconds, 10);

        assert!(!state.refresh(105.5));
        assert_eq!(state.remaining_seconds, 5);

        assert!(state.refresh(110.0));
        assert_eq!(state.remaining_seconds, 0);
    }

    #[test]
    fn test_countdown_without_expiry_uses_duration() {
        let state = ArenaPunishmentState::start(PunishmentKind::Pause, None, 50.0);
        assert_eq!(state.expires_at_epoch, 55.0);
        assert_eq!(state.remaining_seconds, 5);
    }

    #[test]
    fn test_effects_per_kind() {
        let mut rng = DeterministicRng::new(9);
        assert!(PunishmentEffects::roll(PunishmentKind::Pause, &mut rng).move_blocked);

        let hidden = PunishmentEffects::roll(PunishmentKind::Hidden, &mut rng);
        assert!(hidden.hidden_row.is_some() != hidden.hidden_column.is_some());

        let fade = PunishmentEffects::roll(PunishmentKind::Fade, &mut rng);
        assert!(matches!(fade.faded_digit, Some(1..=9)));

        let mut square = PunishmentEffects::roll(PunishmentKind::Square, &mut rng);
        assert!(matches!(square.blacked_box, Some(0..=8)));
        square.clear();
        assert!(!square.is_active());

        assert!(!PunishmentEffects::roll(PunishmentKind::ByeBye, &mut rng).is_active());
    }

    #[test]
    fn test_cells_to_clear_skips_givens_and_empties() {
        let cells: Vec<Cell> = (0..10)
            .map(|i| Cell {
                row: 0,
                column: i % 9,
                solution: 1,
                is_given: i < 3,
                value: if i < 8 { Some(1) } else { None },
            })
            .collect();
        let mut rng = DeterministicRng::new(4);
        let picked = cells_to_clear(&cells, 5, &mut rng);
        assert_eq!(picked.len(), 5);
        assert!(picked.iter().all(|&i| (3..8).contains(&i)));

        assert_eq!(cells_to_clear(&cells, 50, &mut rng).len(), 5);
    }

    #[test]
    fn test_meter_fires_at_target() {
        let mut meter = PowerPushMeter::new(3);
        assert!(!meter.advance());
        assert!(!meter.advance());
        assert!(meter.advance());
        assert_eq!(meter.segments(), 0);

        meter.advance();
        meter.reset();
        assert_eq!(meter.segments(), 0);
    }
}

//! Grid and Puzzle Definitions
//!
//! An implicit 9x9 grid stored row-major in 81 slots, grouped into nine 3x3
//! boxes numbered left-to-right, top-to-bottom.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Deserialize};

/// Cells per side.
pub const GRID_SIDE: usize = 9;

/// Cells per grid.
pub const GRID_CELLS: usize = 81;

/// Board values as they travel between clients: `None` is an empty cell.
pub type BoardValues = Vec<Option<u8>>;

// =============================================================================
// CELL POSITION
// =============================================================================

/// Row/column address of a cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellPosition {
    /// Row (0-8).
    pub row: u8,
    /// Column (0-8).
    pub column: u8,
}

impl CellPosition {
    /// Create a position. Returns `None` when outside the grid.
    pub fn new(row: u8, column: u8) -> Option<Self> {
        if (row as usize) < GRID_SIDE && (column as usize) < GRID_SIDE {
            Some(Self { row, column })
        } else {
            None
        }
    }

    /// Position of a row-major index.
    pub fn from_index(index: usize) -> Option<Self> {
        if index < GRID_CELLS {
            Some(Self {
                row: (index / GRID_SIDE) as u8,
                column: (index % GRID_SIDE) as u8,
            })
        } else {
            None
        }
    }

    /// Row-major index.
    #[inline]
    pub fn index(self) -> usize {
        self.row as usize * GRID_SIDE + self.column as usize
    }

    /// Index of the 3x3 box containing this cell.
    #[inline]
    pub fn box_index(self) -> u8 {
        (self.row / 3) * 3 + self.column / 3
    }
}

// =============================================================================
// DIFFICULTY
// =============================================================================

/// Puzzle difficulty; each level targets a number of empty cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    /// 29 empty cells.
    Simple,
    /// 40 empty cells.
    Medium,
    /// 46 empty cells.
    Hard,
    /// 55 empty cells.
    Master,
}

impl Difficulty {
    /// All levels, easiest first.
    pub const ALL: [Difficulty; 4] = [
        Difficulty::Simple,
        Difficulty::Medium,
        Difficulty::Hard,
        Difficulty::Master,
    ];

    /// Target number of empty cells.
    pub fn empty_cells(self) -> usize {
        match self {
            Difficulty::Simple => 29,
            Difficulty::Medium => 40,
            Difficulty::Hard => 46,
            Difficulty::Master => 55,
        }
    }

    /// Display title.
    pub fn title(self) -> &'static str {
        match self {
            Difficulty::Simple => "Simple",
            Difficulty::Medium => "Medium",
            Difficulty::Hard => "Hard",
            Difficulty::Master => "Master",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Unknown difficulty name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown difficulty: {0}")]
pub struct ParseDifficultyError(pub String);

impl FromStr for Difficulty {
    type Err = ParseDifficultyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(Difficulty::Simple),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            "master" => Ok(Difficulty::Master),
            other => Err(ParseDifficultyError(other.to_string())),
        }
    }
}

// =============================================================================
// PUZZLE
// =============================================================================

/// One puzzle cell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    /// Row (0-8).
    pub row: u8,
    /// Column (0-8).
    pub column: u8,
    /// Digit of the unique solution.
    pub solution: u8,
    /// Pre-filled by generation; never editable.
    pub is_given: bool,
    /// Digit currently shown in the cell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u8>,
}

impl Cell {
    /// Position of this cell.
    pub fn position(&self) -> CellPosition {
        CellPosition { row: self.row, column: self.column }
    }

    /// Whether the shown digit is the solution digit.
    pub fn is_solved(&self) -> bool {
        self.value == Some(self.solution)
    }
}

/// A generated puzzle. Immutable after generation except for cell values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Puzzle {
    /// Unique puzzle identifier.
    pub id: String,
    /// Requested difficulty.
    pub difficulty: Difficulty,
    /// 81 cells, row-major.
    pub cells: Vec<Cell>,
}

impl Puzzle {
    /// Current values of all cells.
    pub fn values(&self) -> BoardValues {
        self.cells.iter().map(|c| c.value).collect()
    }

    /// Number of cells without a value.
    pub fn empty_count(&self) -> usize {
        self.cells.iter().filter(|c| c.value.is_none()).count()
    }

    /// Solution digits, row-major.
    pub fn solution(&self) -> [u8; GRID_CELLS] {
        let mut grid = [0u8; GRID_CELLS];
        for (slot, cell) in grid.iter_mut().zip(&self.cells) {
            *slot = cell.solution;
        }
        grid
    }

    /// Givens as a dense grid (0 = empty).
    pub fn givens(&self) -> [u8; GRID_CELLS] {
        let mut grid = [0u8; GRID_CELLS];
        for (slot, cell) in grid.iter_mut().zip(&self.cells) {
            if cell.is_given {
                *slot = cell.solution;
            }
        }
        grid
    }
}

// =============================================================================
// COMPLETION STATE
// =============================================================================

/// Completed rows, columns and boxes. Only grows during a match.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionState {
    /// Completed row indices.
    #[serde(default)]
    pub completed_rows: BTreeSet<u8>,
    /// Completed column indices.
    #[serde(default)]
    pub completed_columns: BTreeSet<u8>,
    /// Completed box indices.
    #[serde(default)]
    pub completed_boxes: BTreeSet<u8>,
}

/// Units newly completed by one placement.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletionDelta {
    /// Rows completed by this placement.
    pub new_rows: BTreeSet<u8>,
    /// Columns completed by this placement.
    pub new_columns: BTreeSet<u8>,
    /// Boxes completed by this placement.
    pub new_boxes: BTreeSet<u8>,
}

impl CompletionDelta {
    /// Whether anything was completed.
    pub fn has_any(&self) -> bool {
        !self.new_rows.is_empty() || !self.new_columns.is_empty() || !self.new_boxes.is_empty()
    }
}

/// Pad or truncate remote board values to exactly 81 slots, dropping
/// out-of-range digits.
pub fn normalize_values(values: &[Option<u8>]) -> BoardValues {
    let mut normalized: BoardValues = values
        .iter()
        .take(GRID_CELLS)
        .map(|v| v.filter(|d| (1..=9).contains(d)))
        .collect();
    normalized.resize(GRID_CELLS, None);
    normalized
}

/// Dense grid (0 = empty) to board values.
pub fn grid_to_values(grid: &[u8; GRID_CELLS]) -> BoardValues {
    grid.iter().map(|&d| if d == 0 { None } else { Some(d) }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_index_round_trip() {
        for index in 0..GRID_CELLS {
            let pos = CellPosition::from_index(index).unwrap();
            assert_eq!(pos.index(), index);
        }
        assert!(CellPosition::from_index(81).is_none());
        assert!(CellPosition::new(9, 0).is_none());
    }

    #[test]
    fn test_box_index() {
        assert_eq!(CellPosition::new(0, 0).unwrap().box_index(), 0);
        assert_eq!(CellPosition::new(1, 5).unwrap().box_index(), 1);
        assert_eq!(CellPosition::new(4, 4).unwrap().box_index(), 4);
        assert_eq!(CellPosition::new(8, 2).unwrap().box_index(), 6);
        assert_eq!(CellPosition::new(8, 8).unwrap().box_index(), 8);
    }

    #[test]
    fn test_difficulty_targets() {
        let targets: Vec<usize> = Difficulty::ALL.iter().map(|d| d.empty_cells()).collect();
        assert_eq!(targets, vec![29, 40, 46, 55]);
        assert_eq!("Master".parse::<Difficulty>().unwrap(), Difficulty::Master);
        assert!("extreme".parse::<Difficulty>().is_err());
    }

    #[test]
    fn test_difficulty_serializes_lowercase() {
        let json = serde_json::to_string(&Difficulty::Hard).unwrap();
        assert_eq!(json, "\"hard\"");
    }

    #[test]
    fn test_normalize_values_pads_and_truncates() {
        let short = vec![Some(1), None, Some(12)];
        let padded = normalize_values(&short);
        assert_eq!(padded.len(), 81);
        assert_eq!(padded[0], Some(1));
        assert_eq!(padded[2], None);

        let long = vec![Some(5); 100];
        assert_eq!(normalize_values(&long).len(), 81);
    }

    #[test]
    fn test_cell_omits_empty_value() {
        let cell = Cell { row: 0, column: 1, solution: 4, is_given: false, value: None };
        let json = serde_json::to_value(&cell).unwrap();
        assert!(json.get("value").is_none());
        assert_eq!(json["isGiven"], serde_json::json!(false));
    }
}

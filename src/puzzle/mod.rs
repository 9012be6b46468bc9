//! Puzzle engine.
//!
//! Generates uniquely-solvable grids and validates placements against them.
//! Generation is total: it always returns a puzzle.

pub mod grid;
pub mod generator;
pub mod validator;

pub use grid::{
    BoardValues, Cell, CellPosition, CompletionDelta, CompletionState, Difficulty, Puzzle,
    GRID_CELLS, GRID_SIDE,
};
pub use generator::{count_solutions, PuzzleGenerator};
pub use validator::{
    box_completed, column_completed, completed_digits, digit_completed, evaluate_completions,
    is_placement_legal, row_completed,
};

//! Placement Validation
//!
//! Legality and completion checks over board values. All functions are pure;
//! callers own the board.

use std::collections::BTreeSet;

use super::grid::{CellPosition, CompletionDelta, CompletionState, GRID_CELLS, GRID_SIDE};

#[inline]
fn value_at(values: &[Option<u8>], row: usize, column: usize) -> Option<u8> {
    values.get(row * GRID_SIDE + column).copied().flatten()
}

/// Whether `digit` can go at `pos` without repeating in its row, column or
/// box. The target cell itself is not considered.
pub fn is_placement_legal(digit: u8, pos: CellPosition, values: &[Option<u8>]) -> bool {
    if !(1..=9).contains(&digit) {
        return false;
    }
    let row = pos.row as usize;
    let column = pos.column as usize;
    if row >= GRID_SIDE || column >= GRID_SIDE {
        return false;
    }

    for c in 0..GRID_SIDE {
        if c != column && value_at(values, row, c) == Some(digit) {
            return false;
        }
    }
    for r in 0..GRID_SIDE {
        if r != row && value_at(values, r, column) == Some(digit) {
            return false;
        }
    }

    let box_row = row / 3 * 3;
    let box_column = column / 3 * 3;
    for r in box_row..box_row + 3 {
        for c in box_column..box_column + 3 {
            if (r != row || c != column) && value_at(values, r, c) == Some(digit) {
                return false;
            }
        }
    }
    true
}

/// True iff the nine digits are exactly {1..9}.
fn is_complete_unit(digits: impl Iterator<Item = Option<u8>>) -> bool {
    let mut seen = 0u16;
    let mut count = 0;
    for digit in digits {
        match digit {
            Some(d @ 1..=9) => {
                seen |= 1 << d;
                count += 1;
            }
            _ => return false,
        }
    }
    count == GRID_SIDE && seen == 0b11_1111_1110
}

/// Whether `row` is filled with exactly {1..9}.
pub fn row_completed(row: u8, values: &[Option<u8>]) -> bool {
    let row = row as usize;
    row < GRID_SIDE && is_complete_unit((0..GRID_SIDE).map(|c| value_at(values, row, c)))
}

/// Whether `column` is filled with exactly {1..9}.
pub fn column_completed(column: u8, values: &[Option<u8>]) -> bool {
    let column = column as usize;
    column < GRID_SIDE && is_complete_unit((0..GRID_SIDE).map(|r| value_at(values, r, column)))
}

/// Whether box `index` is filled with exactly {1..9}.
pub fn box_completed(index: u8, values: &[Option<u8>]) -> bool {
    let index = index as usize;
    if index >= GRID_SIDE {
        return false;
    }
    let box_row = index / 3 * 3;
    let box_column = index % 3 * 3;
    is_complete_unit(
        (0..GRID_SIDE).map(|i| value_at(values, box_row + i / 3, box_column + i % 3)),
    )
}

/// Whether all nine instances of `digit` are on the board.
pub fn digit_completed(digit: u8, values: &[Option<u8>]) -> bool {
    values.iter().take(GRID_CELLS).filter(|v| **v == Some(digit)).count() >= GRID_SIDE
}

/// Every digit that currently appears nine times.
pub fn completed_digits(values: &[Option<u8>]) -> BTreeSet<u8> {
    (1..=9).filter(|d| digit_completed(*d, values)).collect()
}

/// Record any row, column or box newly completed by a placement at `pos`.
///
/// Already-completed units are never removed from `state`.
pub fn evaluate_completions(
    pos: CellPosition,
    values: &[Option<u8>],
    state: &mut CompletionState,
) -> CompletionDelta {
    let mut delta = CompletionDelta::default();

    if !state.completed_rows.contains(&pos.row) && row_completed(pos.row, values) {
        state.completed_rows.insert(pos.row);
        delta.new_rows.insert(pos.row);
    }
    if !state.completed_columns.contains(&pos.column) && column_completed(pos.column, values) {
        state.completed_columns.insert(pos.column);
        delta.new_columns.insert(pos.column);
    }
    let box_index = pos.box_index();
    if !state.completed_boxes.contains(&box_index) && box_completed(box_index, values) {
        state.completed_boxes.insert(box_index);
        delta.new_boxes.insert(box_index);
    }

    delta
}

/// Whether a dense grid is a complete, valid solution.
pub fn is_valid_solution(grid: &[u8; GRID_CELLS]) -> bool {
    let values: Vec<Option<u8>> = grid.iter().map(|&d| Some(d)).collect();
    (0..9u8).all(|i| {
        row_completed(i, &values) && column_completed(i, &values) && box_completed(i, &values)
    })
}

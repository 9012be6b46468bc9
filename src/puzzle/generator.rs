//! Puzzle Generation
//!
//! Two phases:
//! 1. Fill an empty grid by randomized backtracking (row-major, shuffled
//!    candidates per cell).
//! 2. Remove cells in shuffled order, keeping a removal only while the
//!    remaining grid still has exactly one solution.
//!
//! Both the fill and the solution counter run on an explicit stack so depth is
//! bounded by the 81 cells rather than the call stack.

use tracing::debug;

use crate::core::rng::DeterministicRng;
use super::grid::{Cell, Difficulty, Puzzle, GRID_CELLS, GRID_SIDE};

/// One backtracking frame: a cell and the digits not yet tried there.
#[derive(Debug)]
struct Frame {
    index: usize,
    candidates: Vec<u8>,
}

/// Whether `digit` fits at `index` in a dense grid (0 = empty), ignoring the
/// cell itself.
fn fits(grid: &[u8; GRID_CELLS], index: usize, digit: u8) -> bool {
    let row = index / GRID_SIDE;
    let column = index % GRID_SIDE;

    for i in 0..GRID_SIDE {
        let in_row = row * GRID_SIDE + i;
        let in_column = i * GRID_SIDE + column;
        if (in_row != index && grid[in_row] == digit)
            || (in_column != index && grid[in_column] == digit)
        {
            return false;
        }
    }

    let box_row = row / 3 * 3;
    let box_column = column / 3 * 3;
    for r in box_row..box_row + 3 {
        for c in box_column..box_column + 3 {
            let other = r * GRID_SIDE + c;
            if other != index && grid[other] == digit {
                return false;
            }
        }
    }
    true
}

/// Count solutions of a dense grid, stopping once `limit` is reached.
///
/// Returns 0 for grids whose givens already conflict.
pub fn count_solutions(grid: &[u8; GRID_CELLS], limit: usize) -> usize {
    if limit == 0 {
        return 0;
    }
    let mut work = *grid;

    for index in 0..GRID_CELLS {
        let digit = work[index];
        if digit != 0 && (digit > 9 || !fits(&work, index, digit)) {
            return 0;
        }
    }

    // Most constrained cells first; the order is fixed for the whole search.
    let mut empties: Vec<usize> = (0..GRID_CELLS).filter(|&i| work[i] == 0).collect();
    if empties.is_empty() {
        return 1;
    }
    empties.sort_by_key(|&i| (1..=9).filter(|&d| fits(&work, i, d)).count());

    let mut next_digit = vec![1u8; empties.len()];
    let mut depth = 0usize;
    let mut count = 0usize;

    loop {
        let cell = empties[depth];
        work[cell] = 0;

        let mut placed = false;
        while next_digit[depth] <= 9 {
            let digit = next_digit[depth];
            next_digit[depth] += 1;
            if fits(&work, cell, digit) {
                work[cell] = digit;
                placed = true;
                break;
            }
        }

        if placed {
            if depth + 1 == empties.len() {
                count += 1;
                if count >= limit {
                    return count;
                }
            } else {
                depth += 1;
                next_digit[depth] = 1;
            }
        } else if depth == 0 {
            return count;
        } else {
            depth -= 1;
        }
    }
}

/// Generates uniquely-solvable puzzles.
#[derive(Debug, Clone)]
pub struct PuzzleGenerator {
    rng: DeterministicRng,
}

impl PuzzleGenerator {
    /// Generator with a fixed seed; the same seed yields the same puzzles.
    pub fn new(seed: u64) -> Self {
        Self { rng: DeterministicRng::new(seed) }
    }

    /// Generator seeded from process entropy.
    pub fn from_entropy() -> Self {
        Self { rng: DeterministicRng::from_entropy() }
    }

    /// Generate a puzzle for `difficulty`.
    ///
    /// Always returns a puzzle with exactly one solution. Hard levels may stop
    /// short of their target empty count when no further cell can be removed.
    pub fn generate(&mut self, difficulty: Difficulty) -> Puzzle {
        let solution = self.fill_grid();
        let puzzle_grid = self.remove_cells(&solution, difficulty.empty_cells());

        let cells = (0..GRID_CELLS)
            .map(|index| {
                let is_given = puzzle_grid[index] != 0;
                Cell {
                    row: (index / GRID_SIDE) as u8,
                    column: (index % GRID_SIDE) as u8,
                    solution: solution[index],
                    is_given,
                    value: is_given.then_some(solution[index]),
                }
            })
            .collect::<Vec<_>>();

        let id = self.next_id();
        let empty = cells.iter().filter(|c| !c.is_given).count();
        debug!(
            "generated puzzle {} ({}): {} empty of {} targeted",
            id,
            difficulty,
            empty,
            difficulty.empty_cells()
        );

        Puzzle { id, difficulty, cells }
    }

    fn shuffled_digits(&mut self) -> Vec<u8> {
        let mut digits: Vec<u8> = (1..=9).collect();
        self.rng.shuffle(&mut digits);
        digits
    }

    fn next_id(&mut self) -> String {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.rng.next_u64().to_le_bytes());
        bytes[8..].copy_from_slice(&self.rng.next_u64().to_le_bytes());
        uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()
    }

    /// Randomized backtracking fill of an empty grid.
    fn fill_grid(&mut self) -> [u8; GRID_CELLS] {
        let mut grid = [0u8; GRID_CELLS];
        let mut stack = vec![Frame { index: 0, candidates: self.shuffled_digits() }];

        while let Some(frame) = stack.last_mut() {
            let index = frame.index;
            grid[index] = 0;

            let mut placed = false;
            while let Some(digit) = frame.candidates.pop() {
                if fits(&grid, index, digit) {
                    grid[index] = digit;
                    placed = true;
                    break;
                }
            }

            if !placed {
                stack.pop();
                continue;
            }
            if index + 1 == GRID_CELLS {
                return grid;
            }
            let candidates = self.shuffled_digits();
            stack.push(Frame { index: index + 1, candidates });
        }

        // An empty 9x9 grid always has a fill; keep generation total anyway.
        pattern_solution()
    }

    /// Remove cells in shuffled order while uniqueness holds.
    fn remove_cells(&mut self, solution: &[u8; GRID_CELLS], target: usize) -> [u8; GRID_CELLS] {
        let mut grid = *solution;
        let mut positions: Vec<usize> = (0..GRID_CELLS).collect();
        self.rng.shuffle(&mut positions);

        let mut removed = 0usize;
        for index in positions {
            if removed >= target {
                break;
            }
            let backup = grid[index];
            grid[index] = 0;
            if count_solutions(&grid, 2) == 1 {
                removed += 1;
            } else {
                grid[index] = backup;
            }
        }
        grid
    }
}

fn pattern_solution() -> [u8; GRID_CELLS] {
    let mut grid = [0u8; GRID_CELLS];
    for (index, slot) in grid.iter_mut().enumerate() {
        let r = index / GRID_SIDE;
        let c = index % GRID_SIDE;
        *slot = ((r * 3 + r / 3 + c) % 9 + 1) as u8;
    }
    grid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::puzzle::validator::is_valid_solution;

    #[test]
    fn test_count_solutions_limits() {
        let empty = [0u8; GRID_CELLS];
        assert_eq!(count_solutions(&empty, 2), 2);
        assert_eq!(count_solutions(&empty, 0), 0);

        let full = pattern_solution();
        assert_eq!(count_solutions(&full, 2), 1);

        let mut conflicting = [0u8; GRID_CELLS];
        conflicting[0] = 4;
        conflicting[1] = 4;
        assert_eq!(count_solutions(&conflicting, 2), 0);
    }

    #[test]
    fn test_fill_produces_valid_solution() {
        let mut generator = PuzzleGenerator::new(7);
        for _ in 0..5 {
            let grid = generator.fill_grid();
            assert!(is_valid_solution(&grid));
        }
    }

    #[test]
    fn test_generated_puzzle_is_unique() {
        let mut generator = PuzzleGenerator::new(42);
        for difficulty in [Difficulty::Simple, Difficulty::Medium, Difficulty::Hard] {
            let puzzle = generator.generate(difficulty);
            assert_eq!(puzzle.cells.len(), GRID_CELLS);
            assert!(is_valid_solution(&puzzle.solution()));
            assert_eq!(count_solutions(&puzzle.givens(), 2), 1);
            assert!(puzzle.empty_count() <= difficulty.empty_cells());
        }
    }

    #[test]
    fn test_givens_match_solution() {
        let puzzle = PuzzleGenerator::new(3).generate(Difficulty::Simple);
        for cell in &puzzle.cells {
            if cell.is_given {
                assert_eq!(cell.value, Some(cell.solution));
            } else {
                assert_eq!(cell.value, None);
            }
        }
        assert_eq!(puzzle.empty_count(), Difficulty::Simple.empty_cells());
    }

    #[test]
    fn test_refilling_a_hole_keeps_uniqueness() {
        let puzzle = PuzzleGenerator::new(11).generate(Difficulty::Medium);
        let solution = puzzle.solution();
        let givens = puzzle.givens();

        for index in (0..GRID_CELLS).filter(|&i| givens[i] == 0).take(10) {
            let mut grid = givens;
            grid[index] = solution[index];
            assert_eq!(count_solutions(&grid, 2), 1);
        }
    }

    #[test]
    fn test_same_seed_same_puzzle() {
        let a = PuzzleGenerator::new(99).generate(Difficulty::Medium);
        let b = PuzzleGenerator::new(99).generate(Difficulty::Medium);
        assert_eq!(a, b);

        let c = PuzzleGenerator::new(100).generate(Difficulty::Medium);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_master_stays_unique() {
        let puzzle = PuzzleGenerator::new(5).generate(Difficulty::Master);
        assert_eq!(count_solutions(&puzzle.givens(), 2), 1);
        assert!(puzzle.empty_count() <= 55);
        assert!(puzzle.empty_count() >= 40);
    }
}

//! Benchmarks for puzzle generation and placement validation.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sudoku_arena::puzzle::{count_solutions, is_placement_legal, Difficulty, PuzzleGenerator};

fn bench_generate(c: &mut Criterion) {
    let mut group = c.benchmark_group("puzzle_generation");
    group.sample_size(20);

    for difficulty in Difficulty::ALL {
        group.bench_with_input(BenchmarkId::new("generate", difficulty), &difficulty, |b, &difficulty| {
            let mut generator = PuzzleGenerator::new(42);
            b.iter(|| generator.generate(black_box(difficulty)))
        });
    }

    group.finish();
}

fn bench_uniqueness_check(c: &mut Criterion) {
    let puzzle = PuzzleGenerator::new(7).generate(Difficulty::Master);
    let givens = puzzle.givens();

    c.bench_function("count_solutions_master", |b| {
        b.iter(|| count_solutions(black_box(&givens), 2))
    });
}

fn bench_placement(c: &mut Criterion) {
    let puzzle = PuzzleGenerator::new(7).generate(Difficulty::Hard);
    let values = puzzle.values();
    let empty: Vec<_> = puzzle.cells.iter().filter(|cell| cell.value.is_none()).collect();

    c.bench_function("placement_legal_all_empty", |b| {
        b.iter(|| {
            empty
                .iter()
                .filter(|cell| is_placement_legal(cell.solution, cell.position(), black_box(&values)))
                .count()
        })
    });
}

criterion_group!(benches, bench_generate, bench_uniqueness_check, bench_placement);
criterion_main!(benches);

//! Decision-cycle Benchmarks
//!
//! Measures the coordinator-side hot paths that run once per cycle:
//! - Reorder buffer admission + commit under shuffled arrivals
//! - Steal planning across lane counts
//! - Adaptive controller update

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::time::Duration;

use blockeig_core::adaptive::{AdaptiveController, Observation};
use blockeig_core::block::{MatrixProfile, ResultEntry, ResultKind};
use blockeig_core::config::EngineConfig;
use blockeig_core::reorder::{Admission, ReorderBuffer};
use blockeig_core::scheduler::{plan_steal, LaneView};

/// Deterministic arrival order for `blocks` results.
fn shuffled_arrivals(blocks: u16, seed: u64) -> Vec<u16> {
    let mut order: Vec<u16> = (0..blocks).collect();
    order.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
    order
}

/// One full iteration through the buffer; stalled entries retry after advance.
fn drive_iteration(capacity: usize, order: &[u16]) -> f64 {
    let mut buffer = ReorderBuffer::new(capacity, order.len() * 2);
    for _ in 0..order.len() {
        let _ = buffer.issue_sequence();
    }
    let mut pending: Vec<u16> = order.iter().rev().copied().collect();
    while let Some(seq) = pending.pop() {
        let entry = ResultEntry::new(seq as u8, seq, [seq as f64, 1.0], ResultKind::Normal, 0);
        if let Ok(Admission::Stalled) = buffer.submit_result(entry) {
            pending.push(seq);
        }
        if let Ok(Some(out)) = buffer.advance() {
            return out.norm;
        }
    }
    0.0
}

fn bench_reorder_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("reorder_iteration");
    group.measurement_time(Duration::from_secs(5));

    let order = shuffled_arrivals(128, 42);
    for capacity in [8usize, 32, 256].iter() {
        group.bench_with_input(
            BenchmarkId::new("shuffled_128_blocks", capacity),
            capacity,
            |b, &capacity| b.iter(|| drive_iteration(capacity, black_box(&order))),
        );
    }

    let in_order: Vec<u16> = (0..128).collect();
    group.bench_function("in_order_128_blocks", |b| {
        b.iter(|| drive_iteration(32, black_box(&in_order)))
    });

    group.finish();
}

fn bench_steal_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("steal_planning");

    for lanes in [4usize, 16, 64].iter() {
        let views: Vec<LaneView> = (0..*lanes)
            .map(|i| LaneView {
                depth: (i * 7) % 5,
                idle: i % 3 == 0,
            })
            .collect();
        group.bench_with_input(BenchmarkId::new("plan_steal", lanes), &views, |b, views| {
            b.iter(|| plan_steal(black_box(views)))
        });
    }

    group.finish();
}

fn bench_controller_adapt(c: &mut Criterion) {
    let config = EngineConfig::default();
    let mut controller = AdaptiveController::new(&config);
    let mut step = 0u32;

    c.bench_function("controller_adapt", |b| {
        b.iter(|| {
            step = step % 64 + 1;
            let observation = Observation {
                iterations: step,
                max_error: 1.0 / (step as f64 * step as f64),
                profile: MatrixProfile::new(80, 6),
                workload: (step % 16) as u8,
                congested: step % 7 == 0,
                deadline_approaching: false,
            };
            controller.adapt(black_box(&observation))
        })
    });
}

criterion_group!(
    benches,
    bench_reorder_iteration,
    bench_steal_planning,
    bench_controller_adapt
);
criterion_main!(benches);

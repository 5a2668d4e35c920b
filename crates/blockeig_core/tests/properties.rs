use std::collections::VecDeque;
use std::sync::Arc;

use proptest::collection::vec;
use proptest::prelude::*;

use blockeig_core::adaptive::{compute_threshold, Trend, THRESHOLD_MAX, THRESHOLD_MIN};
use blockeig_core::block::{Block, MatrixProfile, Payload, ResultEntry, ResultKind, Task};
use blockeig_core::lanes::{LaneQueues, Queued};
use blockeig_core::reorder::{Admission, ErrorCode, IterationVector, ReorderBuffer};
use blockeig_core::scheduler::{plan_steal, LaneView, StealOutcome, StealPlan, WorkStealingScheduler};

fn trend_from(i: u8) -> Trend {
    match i % 4 {
        0 => Trend::Accelerating,
        1 => Trend::Decelerating,
        2 => Trend::Oscillating,
        _ => Trend::Stable,
    }
}

fn fill(queues: &LaneQueues, depths: &[usize]) {
    let mut id = 0u16;
    for (lane, &depth) in depths.iter().enumerate() {
        for _ in 0..depth {
            let block = Arc::new(Block::new(id as u8, 1, Payload::Sparse { entries: vec![] }, false));
            queues
                .push(
                    lane,
                    Queued {
                        task: Task::new(block, 0, id),
                        kind: ResultKind::Normal,
                    },
                )
                .unwrap();
            id += 1;
        }
    }
}

/// Feed `order` into a buffer, retrying stalled entries after each advance.
fn run_arrivals(capacity: usize, order: &[u16]) -> (Vec<f64>, ReorderBuffer) {
    let n = order.len();
    let mut buffer = ReorderBuffer::new(capacity, 2 * n);
    for _ in 0..n {
        buffer.issue_sequence().unwrap();
    }
    let mut pending: VecDeque<u16> = order.iter().copied().collect();
    let mut output = None;
    let mut guard = 0;
    while let Some(seq) = pending.pop_front() {
        let value = (seq + 1) as f64;
        let entry = ResultEntry::new(seq as u8, seq, [value, -value], ResultKind::Normal, 0);
        if buffer.submit_result(entry).unwrap() == Admission::Stalled {
            pending.push_front(seq);
        }
        if let Some(out) = buffer.advance().unwrap() {
            output = Some(out);
        }
        guard += 1;
        assert!(guard < 10_000, "buffer made no progress");
    }
    let output = output.expect("every block committed");
    (output.vector, buffer)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_steal_authorized_iff_idle_empty_lane_and_deep_source(
        lanes in vec((0usize..6, any::<bool>()), 1..8),
    ) {
        let views: Vec<LaneView> = lanes
            .iter()
            .map(|&(depth, idle)| LaneView { depth, idle })
            .collect();
        let has_dest = views.iter().any(|v| v.idle && v.depth == 0);
        let max_depth = views.iter().map(|v| v.depth).max().unwrap_or(0);
        let plan = plan_steal(&views);
        prop_assert_eq!(plan.is_authorized(), has_dest && max_depth > 1);

        let depths: Vec<usize> = views.iter().map(|v| v.depth).collect();
        let idle: Vec<bool> = views.iter().map(|v| v.idle).collect();
        let queues = LaneQueues::new(depths.len(), 8);
        fill(&queues, &depths);
        let mut scheduler = WorkStealingScheduler::new(depths.len());
        if let StealOutcome::Stolen { source, dest } = scheduler.run_cycle(&queues, &idle) {
            let after = queues.depths();
            prop_assert_eq!(after[source], depths[source] - 1);
            prop_assert_eq!(after[dest], depths[dest] + 1);
            prop_assert_eq!(after.iter().sum::<usize>(), depths.iter().sum::<usize>());
        } else {
            prop_assert!(matches!(plan, StealPlan::Skip(_)));
            prop_assert_eq!(queues.depths(), depths);
        }
    }

    #[test]
    fn prop_any_arrival_order_reassembles_in_sequence_order(
        order in (1usize..24).prop_flat_map(|n| Just((0..n as u16).collect::<Vec<_>>()).prop_shuffle()),
        extra in 0usize..48,
    ) {
        let n = order.len();
        let capacity = 2 + extra;
        let (vector, buffer) = run_arrivals(capacity, &order);
        for block in 0..n {
            let expected = (block + 1) as f64 / n as f64;
            prop_assert_eq!(vector[2 * block], expected);
            prop_assert_eq!(vector[2 * block + 1], -expected);
        }
        if capacity >= 2 * n {
            prop_assert_eq!(buffer.stats().forced_commits, 0);
        }
    }

    #[test]
    fn prop_duplicate_keeps_higher_sequence(
        n in 2usize..16,
        dup_pick in any::<prop::sample::Index>(),
    ) {
        let dup = dup_pick.index(n);
        let mut buffer = ReorderBuffer::new(2 * (n + 1), 2 * n);
        for _ in 0..=n {
            buffer.issue_sequence().unwrap();
        }
        let low = ResultEntry::new(dup as u8, dup as u16, [1.0, 1.0], ResultKind::Normal, 0);
        let high = ResultEntry::new(dup as u8, n as u16, [100.0, 100.0], ResultKind::Redundant, 0);
        buffer.submit_result(high).unwrap();
        buffer.submit_result(low).unwrap();
        prop_assert_eq!(buffer.handle_error(ErrorCode::DuplicateStorm), 1);
        prop_assert_eq!(buffer.occupancy(), 1);

        let mut output = None;
        for seq in (0..n).filter(|&s| s != dup) {
            let entry = ResultEntry::new(seq as u8, seq as u16, [1.0, 1.0], ResultKind::Normal, 0);
            buffer.submit_result(entry).unwrap();
            if let Some(out) = buffer.advance().unwrap() {
                output = Some(out);
            }
        }
        if output.is_none() {
            output = buffer.advance().unwrap();
        }
        let output = output.expect("iteration completes through the retained copy");
        prop_assert_eq!(output.norm, 100.0);
        prop_assert_eq!(output.vector[2 * dup], 1.0);
    }

    #[test]
    fn prop_normalization_divides_by_infinity_norm(
        values in vec(-1e6f64..1e6, 1..16).prop_map(|mut v| { if v.len() % 2 == 1 { v.push(0.0); } v }),
    ) {
        let mut vector = IterationVector::new(values.len());
        for (block, pair) in values.chunks(2).enumerate() {
            vector.write_block(block as u8, [pair[0], pair[1]]).unwrap();
        }
        let max = values.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        let (out, norm) = vector.normalized();
        prop_assert_eq!(norm, max);
        for (o, v) in out.iter().zip(&values) {
            if max == 0.0 {
                prop_assert_eq!(*o, *v);
            } else {
                prop_assert_eq!(*o, *v / max);
            }
        }
    }

    #[test]
    fn prop_threshold_always_within_bounds(
        sparsity in 0u8..=100,
        condition in 0u8..=15,
        workload in 0u8..=15,
        trend in any::<u8>(),
        base in 1e-9f64..1.0,
    ) {
        let t = compute_threshold(base, &MatrixProfile::new(sparsity, condition), trend_from(trend), workload);
        prop_assert!((THRESHOLD_MIN..=THRESHOLD_MAX).contains(&t), "threshold {}", t);
    }
}

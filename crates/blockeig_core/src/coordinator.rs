//! Central coordinator: one thread drives every decision cycle.
//!
//! ```text
//!            BlockSource
//!                │ produce_blocks(iteration)
//!                ▼
//!   backlog ──► lane queues ◄── WorkStealingScheduler (N cycles / step)
//!                │      ▲
//!                │      └──── RedundantMapper (spare ↔ congested queue)
//!                ▼
//!            LanePool ──► completions ──► ReorderBuffer ──► IterationReport
//!                                                              │
//!                                     AdaptiveController ◄─────┘ (solve only:
//!                                     adapt per iteration, record_solve at the end)
//! ```
//!
//! The coordinator is the only writer of the reorder buffer and the only
//! thread that touches the lane queues, so each cycle is a serialized
//! sequence of: scheduling cycles, mapper rebalance, dispatch, collect,
//! admit, advance.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::adaptive::{AdaptiveController, Observation, Policy};
use crate::block::{Block, Element, LaneSlot, MatrixProfile, ResultEntry, ResultKind, Task};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::lanes::{ComputeUnit, Job, LanePool, LaneQueues, Queued};
use crate::reorder::{Admission, ErrorCode, IterationOutput, ReorderBuffer};
use crate::scheduler::{RedundantMapper, WorkStealingScheduler};

/// How long a cycle waits for the first lane completion.
const COLLECT_TIMEOUT: Duration = Duration::from_millis(50);

/// Sleep between checks while paused.
const PAUSE_POLL: Duration = Duration::from_millis(1);

/// Fraction of the deadline after which the controller tightens its mode.
const DEADLINE_PRESSURE: f64 = 0.8;

/// Largest queue-depth average reported as workload.
const MAX_WORKLOAD: f64 = 15.0;

/// Produces the blocks of one iteration.
pub trait BlockSource {
    /// Length of the iteration vector (two rows per block).
    fn dimension(&self) -> usize;

    /// Matrix characteristics fed to the controller.
    fn profile(&self) -> MatrixProfile;

    /// Blocks `0..dimension/2`, in order.
    fn produce_blocks(&mut self, iteration: u8) -> Vec<Block>;
}

// ============================================================================
// Supervisor handle
// ============================================================================

#[derive(Debug, Default)]
struct SupervisorFlags {
    paused: AtomicBool,
    abort: AtomicBool,
}

/// Cloneable control surface for the supervisory loop.
#[derive(Debug, Clone, Default)]
pub struct SupervisorHandle {
    flags: Arc<SupervisorFlags>,
}

impl SupervisorHandle {
    pub fn pause(&self) {
        self.flags.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.flags.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::SeqCst)
    }

    /// Abort the iteration in flight at the next cycle boundary.
    pub fn abort_iteration(&self) {
        self.flags.abort.store(true, Ordering::SeqCst);
    }

    fn take_abort(&self) -> bool {
        self.flags.abort.swap(false, Ordering::SeqCst)
    }

    fn clear(&self) {
        self.flags.paused.store(false, Ordering::SeqCst);
        self.flags.abort.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Lane-level metrics of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LaneMetrics {
    pub cycles: u64,
    /// Busy primary lanes over lane-cycles, 0..=1.
    pub utilization: f64,
    pub steals: u64,
    pub aborted_steals: u64,
    pub redundant_dispatches: u64,
    pub stalls: u64,
    pub forced_commits: u64,
    pub out_of_order: u64,
    /// Some queue was congested during the iteration.
    pub congested: bool,
    /// Average queue depth, 0..=15.
    pub workload: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub iteration: u8,
    /// Normalized iteration vector.
    pub vector: Vec<Element>,
    /// Infinity norm before normalization (dominant eigenvalue estimate).
    pub norm: Element,
    /// `|v[i] - v_prev[i]|`
    pub error: Vec<Element>,
    pub max_error: Element,
    pub metrics: LaneMetrics,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveOutcome {
    pub iterations: u32,
    pub eigenvalue: Element,
    pub vector: Vec<Element>,
    pub max_error: Element,
    pub policy: Policy,
}

/// Counter snapshot used to compute per-iteration deltas.
#[derive(Debug, Clone, Copy, Default)]
struct CounterMark {
    steals: u64,
    aborted_steals: u64,
    redundant: u64,
    stalls: u64,
    forced: u64,
    out_of_order: u64,
}

/// Running per-iteration accumulators.
#[derive(Debug, Default)]
struct CycleTally {
    cycles: u64,
    busy_lane_cycles: u64,
    depth_sum: f64,
    congested: bool,
}

/// A result waiting for buffer room.
#[derive(Debug, Clone, Copy)]
struct Stalled {
    entry: ResultEntry,
    attempts: u32,
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct Coordinator<S: BlockSource> {
    config: EngineConfig,
    source: S,
    queues: LaneQueues,
    scheduler: WorkStealingScheduler,
    mapper: RedundantMapper,
    buffer: ReorderBuffer,
    controller: AdaptiveController,
    pool: LanePool,
    supervisor: SupervisorHandle,
    /// Input vector of the next iteration.
    current: Arc<Vec<Element>>,
    iteration: u8,
}

impl<S: BlockSource> Coordinator<S> {
    pub fn new<U: ComputeUnit>(config: EngineConfig, source: S, unit: Arc<U>) -> Result<Self> {
        config.validate()?;
        let dimension = source.dimension();
        if dimension == 0 || dimension % 2 != 0 || dimension / 2 > u8::MAX as usize + 1 {
            return Err(EngineError::InvalidBlocks(format!(
                "dimension {dimension} must be even and cover 1..=256 blocks"
            )));
        }

        let pool = LanePool::new(config.lanes, config.spare_lanes, unit)?;
        info!(
            "coordinator ready: dimension {}, {} lanes, {} spares, buffer {}",
            dimension, config.lanes, config.spare_lanes, config.buffer_capacity
        );

        Ok(Self {
            queues: LaneQueues::new(config.lanes, config.queue_depth),
            scheduler: WorkStealingScheduler::new(config.lanes),
            mapper: RedundantMapper::new(config.spare_lanes),
            buffer: ReorderBuffer::new(config.buffer_capacity, dimension),
            controller: AdaptiveController::new(&config),
            pool,
            supervisor: SupervisorHandle::default(),
            current: Arc::new(vec![1.0; dimension]),
            iteration: 0,
            source,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn supervisor(&self) -> SupervisorHandle {
        self.supervisor.clone()
    }

    pub fn current_policy(&self) -> Policy {
        self.controller.current_policy()
    }

    pub fn controller(&self) -> &AdaptiveController {
        &self.controller
    }

    pub fn buffer(&self) -> &ReorderBuffer {
        &self.buffer
    }

    pub fn scheduler(&self) -> &WorkStealingScheduler {
        &self.scheduler
    }

    pub fn mapper(&self) -> &RedundantMapper {
        &self.mapper
    }

    /// Current iteration vector (input of the next iteration).
    pub fn vector(&self) -> &[Element] {
        &self.current
    }

    // ---- Solve ----

    /// Iterate until the max error falls below the adaptive threshold.
    pub fn solve(&mut self) -> Result<SolveOutcome> {
        let started = Instant::now();
        let mut iterations = 0u32;
        loop {
            let report = self.run_iteration()?;
            iterations += 1;

            let observation = Observation {
                iterations,
                max_error: report.max_error,
                profile: self.source.profile(),
                workload: report.metrics.workload,
                congested: report.metrics.congested,
                deadline_approaching: self.deadline_approaching(started),
            };
            let policy = self.controller.adapt(&observation);

            if report.max_error < policy.threshold {
                self.controller.record_solve(iterations);
                info!(
                    "converged after {iterations} iterations: eigenvalue {:.6}, max error {:e}",
                    report.norm, report.max_error
                );
                return Ok(SolveOutcome {
                    iterations,
                    eigenvalue: report.norm,
                    vector: report.vector,
                    max_error: report.max_error,
                    policy,
                });
            }

            let cap = policy.iteration_cap.min(self.config.max_iterations);
            if iterations >= cap {
                self.controller.record_solve(iterations);
                warn!("iteration cap {cap} reached, max error {:e}", report.max_error);
                return Err(EngineError::ConvergenceFailure {
                    iterations,
                    max_error: report.max_error,
                    threshold: policy.threshold,
                });
            }
        }
    }

    fn deadline_approaching(&self, started: Instant) -> bool {
        match self.config.deadline_ms {
            Some(ms) if ms > 0 => {
                started.elapsed().as_secs_f64() * 1000.0 > ms as f64 * DEADLINE_PRESSURE
            }
            _ => false,
        }
    }

    // ---- One iteration ----

    /// Run one power iteration across the lanes. Sequence errors redo the
    /// iteration up to `redo_limit` times.
    pub fn run_iteration(&mut self) -> Result<IterationReport> {
        let mut redos = 0;
        loop {
            match self.try_iteration() {
                Err(err @ EngineError::Sequence { .. }) if redos < self.config.redo_limit => {
                    redos += 1;
                    warn!("{err}; redoing iteration {} ({redos})", self.iteration);
                    self.discard_work()?;
                }
                Err(err) => {
                    if !matches!(err, EngineError::Aborted { .. }) {
                        self.discard_work()?;
                    }
                    return Err(err);
                }
                Ok(report) => return Ok(report),
            }
        }
    }

    fn try_iteration(&mut self) -> Result<IterationReport> {
        let iteration = self.iteration;
        self.buffer.begin_iteration(iteration);

        let blocks = self.source.produce_blocks(iteration);
        self.check_blocks(&blocks)?;
        let mut backlog: VecDeque<Arc<Block>> = blocks.into_iter().map(Arc::new).collect();
        let input = Arc::clone(&self.current);

        let mark = self.mark();
        let mut tally = CycleTally::default();
        let mut stalled: Vec<Stalled> = Vec::new();
        let mut next_lane = 0usize;

        loop {
            if self.supervisor.take_abort() {
                self.abort_in_flight()?;
                self.controller.discard_iteration(iteration);
                info!("iteration {iteration} aborted");
                return Err(EngineError::Aborted { iteration });
            }
            if self.supervisor.is_paused() {
                std::thread::sleep(PAUSE_POLL);
                continue;
            }

            self.distribute(&mut backlog, &mut next_lane, iteration)?;

            let cycles = self.controller.current_policy().scheduling_cycles();
            for _ in 0..cycles {
                let idle = self.primary_idle();
                self.scheduler.run_cycle(&self.queues, &idle);
            }
            let pressures = self.queues.pressures();
            tally.congested |= pressures.iter().any(|p| p.congested);
            self.mapper.rebalance(&pressures);

            self.dispatch_primaries(&input)?;
            self.dispatch_spares(&input)?;
            tally.cycles += 1;
            tally.busy_lane_cycles += self.busy_primaries() as u64;
            tally.depth_sum += self.queues.total_depth() as f64 / self.queues.len() as f64;

            let completions = self.pool.collect(COLLECT_TIMEOUT)?;
            for c in &completions {
                if let LaneSlot::Spare(spare) = c.slot {
                    self.mapper.mark_finished(spare);
                }
            }

            // A lost result leaves a gap only a redo can fill.
            let offered = core::mem::take(&mut stalled)
                .into_iter()
                .chain(completions.iter().filter_map(|c| {
                    c.entry.map(|entry| Stalled { entry, attempts: 0 })
                }));
            for mut pending in offered.collect::<Vec<_>>() {
                match self.buffer.submit_result(pending.entry)? {
                    Admission::Accepted { .. } | Admission::Stale => {}
                    Admission::Stalled => {
                        pending.attempts += 1;
                        if pending.attempts > self.config.retry_budget {
                            return Err(EngineError::BufferOverflow {
                                attempts: pending.attempts,
                            });
                        }
                        stalled.push(pending);
                    }
                }
            }

            if let Some(output) = self.buffer.advance()? {
                return Ok(self.finish(output, mark, tally));
            }

            let starved = stalled.is_empty()
                && backlog.is_empty()
                && self.pool.in_flight() == 0
                && self.queues.total_depth() == 0;
            if starved {
                // Nothing left that could fill the gap at next_expected.
                let err = EngineError::Sequence {
                    expected: self.buffer.next_expected(),
                    got: self.buffer.next_sequence(),
                };
                self.buffer.handle_error(ErrorCode::SequenceCorruption);
                return Err(err);
            }
        }
    }

    fn check_blocks(&self, blocks: &[Block]) -> Result<()> {
        let expected = self.source.dimension() / 2;
        if blocks.len() != expected {
            return Err(EngineError::InvalidBlocks(format!(
                "expected {expected} blocks, got {}",
                blocks.len()
            )));
        }
        let mut seen = vec![false; expected];
        for block in blocks {
            let id = block.id as usize;
            if id >= expected || seen[id] {
                return Err(EngineError::InvalidBlocks(format!(
                    "block id {id} repeated or out of range"
                )));
            }
            seen[id] = true;
        }
        Ok(())
    }

    /// Round-robin blocks into queues with room; the rest wait in the backlog.
    fn distribute(
        &mut self,
        backlog: &mut VecDeque<Arc<Block>>,
        next_lane: &mut usize,
        iteration: u8,
    ) -> Result<()> {
        let lanes = self.queues.len();
        while !backlog.is_empty() {
            let open = (0..lanes)
                .map(|k| (*next_lane + k) % lanes)
                .find(|&lane| self.queues.depth(lane) < self.config.queue_depth);
            let Some(lane) = open else {
                trace!("all queues full, {} blocks in backlog", backlog.len());
                break;
            };
            let Some(block) = backlog.pop_front() else { break };
            let sequence = self.buffer.issue_sequence()?;
            let queued = Queued {
                task: Task::new(block, iteration, sequence),
                kind: ResultKind::Normal,
            };
            if let Err(rejected) = self.queues.push(lane, queued) {
                return Err(EngineError::InvalidConfig(format!(
                    "lane {lane} rejected block {} below capacity",
                    rejected.task.block_id()
                )));
            }
            *next_lane = (lane + 1) % lanes;
        }
        Ok(())
    }

    fn primary_idle(&self) -> Vec<bool> {
        (0..self.queues.len())
            .map(|i| self.pool.is_idle(LaneSlot::Primary(i)))
            .collect()
    }

    fn busy_primaries(&self) -> usize {
        self.primary_idle().iter().filter(|idle| !**idle).count()
    }

    fn dispatch_primaries(&mut self, input: &Arc<Vec<Element>>) -> Result<()> {
        for lane in 0..self.queues.len() {
            let slot = LaneSlot::Primary(lane);
            if !self.pool.is_idle(slot) {
                continue;
            }
            if let Some(queued) = self.queues.pop(lane) {
                self.pool.dispatch(
                    slot,
                    Job {
                        task: queued.task,
                        kind: queued.kind,
                        input: Arc::clone(input),
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Mapped spares take the next task from their congested queue.
    fn dispatch_spares(&mut self, input: &Arc<Vec<Element>>) -> Result<()> {
        for (spare, queue) in self.mapper.ready() {
            let slot = LaneSlot::Spare(spare);
            if !self.pool.is_idle(slot) {
                continue;
            }
            if let Some(queued) = self.queues.pop(queue) {
                self.mapper.mark_dispatched(spare);
                self.pool.dispatch(
                    slot,
                    Job {
                        task: queued.task,
                        kind: ResultKind::Redundant,
                        input: Arc::clone(input),
                    },
                )?;
            }
        }
        Ok(())
    }

    fn mark(&self) -> CounterMark {
        let steal = self.scheduler.stats();
        let buffer = self.buffer.stats();
        CounterMark {
            steals: steal.steals,
            aborted_steals: steal.aborted,
            redundant: self.mapper.stats().redundant_dispatches,
            stalls: buffer.stalls,
            forced: buffer.forced_commits,
            out_of_order: buffer.out_of_order,
        }
    }

    fn finish(&mut self, output: IterationOutput, mark: CounterMark, tally: CycleTally) -> IterationReport {
        let now = self.mark();
        let lanes = self.queues.len() as f64;
        let cycles = tally.cycles.max(1) as f64;
        let metrics = LaneMetrics {
            cycles: tally.cycles,
            utilization: (tally.busy_lane_cycles as f64 / (cycles * lanes)).min(1.0),
            steals: now.steals - mark.steals,
            aborted_steals: now.aborted_steals - mark.aborted_steals,
            redundant_dispatches: now.redundant - mark.redundant,
            stalls: now.stalls - mark.stalls,
            forced_commits: now.forced - mark.forced,
            out_of_order: now.out_of_order - mark.out_of_order,
            congested: tally.congested,
            workload: (tally.depth_sum / cycles).round().clamp(0.0, MAX_WORKLOAD) as u8,
        };

        let error: Vec<Element> = output
            .vector
            .iter()
            .zip(self.current.iter())
            .map(|(v, prev)| (v - prev).abs())
            .collect();
        let max_error = error.iter().copied().fold(0.0, Element::max);

        debug!(
            "iteration {} done: norm {:.6}, max error {:e}, {} cycles, {} steals",
            output.iteration, output.norm, max_error, metrics.cycles, metrics.steals
        );

        self.current = Arc::new(output.vector.clone());
        self.iteration = self.iteration.wrapping_add(1);

        IterationReport {
            iteration: output.iteration,
            vector: output.vector,
            norm: output.norm,
            error,
            max_error,
            metrics,
        }
    }

    // ---- Abort / reset ----

    /// Drop everything belonging to the iteration in flight.
    fn discard_work(&mut self) -> Result<()> {
        let dropped = self.pool.discard_in_flight()?;
        for spare in 0..self.mapper.spares().len() {
            self.mapper.mark_finished(spare);
        }
        self.mapper.release_all();
        self.queues.clear_all();
        if dropped > 0 {
            debug!("discarded {dropped} in-flight results");
        }
        Ok(())
    }

    fn abort_in_flight(&mut self) -> Result<()> {
        self.discard_work()?;
        self.buffer.flush();
        Ok(())
    }

    /// Return every component to its initial state.
    pub fn reset(&mut self) -> Result<()> {
        self.discard_work()?;
        self.scheduler.reset();
        self.mapper.reset();
        self.buffer.reset();
        self.controller.reset();
        self.supervisor.clear();
        self.current = Arc::new(vec![1.0; self.source.dimension()]);
        self.iteration = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Payload;
    use crate::lanes::BlockMultiplier;

    /// Diagonal matrix: dominant eigenvalue is the largest entry.
    struct Diagonal {
        diag: Vec<Element>,
    }

    impl BlockSource for Diagonal {
        fn dimension(&self) -> usize {
            self.diag.len()
        }

        fn profile(&self) -> MatrixProfile {
            MatrixProfile::new(90, 2)
        }

        fn produce_blocks(&mut self, _iteration: u8) -> Vec<Block> {
            (0..self.diag.len() / 2)
                .map(|b| {
                    let r0 = 2 * b;
                    let entries = vec![
                        (0u8, r0 as u32, self.diag[r0]),
                        (1u8, (r0 + 1) as u32, self.diag[r0 + 1]),
                    ];
                    Block::new(b as u8, 2, Payload::Sparse { entries }, true)
                })
                .collect()
        }
    }

    fn coordinator(diag: Vec<Element>) -> Coordinator<Diagonal> {
        let config = EngineConfig {
            lanes: 2,
            spare_lanes: 1,
            queue_depth: 2,
            buffer_capacity: 4,
            ..EngineConfig::default()
        };
        Coordinator::new(config, Diagonal { diag }, Arc::new(BlockMultiplier)).unwrap()
    }

    #[test]
    fn test_single_iteration_report() {
        let mut c = coordinator(vec![1.0, 2.0, 4.0, 0.5]);
        let report = c.run_iteration().unwrap();
        assert_eq!(report.iteration, 0);
        assert_eq!(report.norm, 4.0);
        assert_eq!(report.vector, vec![0.25, 0.5, 1.0, 0.125]);
        assert_eq!(report.error, vec![0.75, 0.5, 0.0, 0.875]);
        assert_eq!(report.max_error, 0.875);
        assert!(report.metrics.cycles > 0);
    }

    #[test]
    fn test_solve_finds_dominant_eigenvalue() {
        let mut c = coordinator(vec![1.0, 2.0, 6.0, 0.5, 3.0, 1.5]);
        let outcome = c.solve().unwrap();
        assert!((outcome.eigenvalue - 6.0).abs() < 1e-3, "{}", outcome.eigenvalue);
        assert_eq!(outcome.vector[2], 1.0);
        assert!(outcome.max_error < outcome.policy.threshold);
    }

    #[test]
    fn test_each_solve_is_graded_once() {
        let mut c = coordinator(vec![1.0, 2.0, 6.0, 0.5]);
        let first = c.solve().unwrap();
        let second = c.solve().unwrap();
        let stats = c.controller().stats();
        assert_eq!(stats.predictions, 2);
        assert_eq!(
            stats.adaptations,
            (first.iterations + second.iterations) as u64
        );
    }

    #[test]
    fn test_rejects_odd_dimension() {
        let config = EngineConfig::default();
        let err = Coordinator::new(config, Diagonal { diag: vec![1.0; 3] }, Arc::new(BlockMultiplier))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::InvalidBlocks(_)));
    }

    #[test]
    fn test_abort_discards_iteration() {
        let mut c = coordinator(vec![1.0, 2.0, 4.0, 0.5]);
        c.supervisor().abort_iteration();
        let err = c.run_iteration().unwrap_err();
        assert_eq!(err, EngineError::Aborted { iteration: 0 });
        assert_eq!(c.buffer().occupancy(), 0);
        assert_eq!(c.vector(), &[1.0, 1.0, 1.0, 1.0], "input vector untouched");
        assert_eq!(c.controller().stats().adaptations, 0);
        assert_eq!(c.controller().stats().discarded, 1);

        // The next iteration runs normally with the same tag.
        let report = c.run_iteration().unwrap();
        assert_eq!(report.iteration, 0);
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut c = coordinator(vec![1.0, 2.0, 4.0, 0.5]);
        c.solve().unwrap();
        c.reset().unwrap();
        assert_eq!(c.vector(), &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(c.controller().stats().adaptations, 0);
        assert_eq!(c.scheduler().stats().cycles, 0);
        assert_eq!(c.buffer().stats().committed, 0);
    }
}

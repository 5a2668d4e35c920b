//! Work-stealing scheduler.
//!
//! One decision per scheduling cycle:
//!
//! 1. Source: the deepest non-empty queue (lowest lane index on ties).
//! 2. Destination: the lowest-index lane that is idle with an empty queue.
//! 3. A steal is authorized only when a destination exists and the source
//!    holds more than one task, so a queue is never drained to empty.
//!
//! The relocation moves the tail task (LIFO-from-tail). If the source emptied
//! between planning and execution the steal is aborted and counted, never
//! retried in the same cycle.

use alloc::vec::Vec;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::lanes::{LaneQueues, Relocation};

/// What the scheduler sees of one primary lane at the start of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaneView {
    pub depth: usize,
    pub idle: bool,
}

/// Why no steal was planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoSteal {
    /// Every queue is empty.
    NoWork,
    /// The deepest queue has a single task.
    SourceTooShallow { source: usize },
    /// No lane is idle with an empty queue.
    NoIdleLane { source: usize },
}

/// Decision of the planning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StealPlan {
    Steal { source: usize, dest: usize },
    Skip(NoSteal),
}

impl StealPlan {
    pub fn is_authorized(&self) -> bool {
        matches!(self, StealPlan::Steal { .. })
    }
}

/// Outcome of one scheduling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StealOutcome {
    Stolen { source: usize, dest: usize },
    /// Authorized, but the queues changed before execution.
    Aborted { source: usize, dest: usize },
    Skipped(NoSteal),
}

/// Pure planning step over a snapshot of all lanes.
pub fn plan_steal(lanes: &[LaneView]) -> StealPlan {
    let mut source: Option<(usize, usize)> = None;
    for (i, lane) in lanes.iter().enumerate() {
        if lane.depth == 0 {
            continue;
        }
        match source {
            Some((_, best)) if lane.depth <= best => {}
            _ => source = Some((i, lane.depth)),
        }
    }

    let dest = lanes.iter().position(|l| l.idle && l.depth == 0);

    match (source, dest) {
        (None, _) => StealPlan::Skip(NoSteal::NoWork),
        (Some((source, depth)), _) if depth <= 1 => {
            StealPlan::Skip(NoSteal::SourceTooShallow { source })
        }
        (Some((source, _)), None) => StealPlan::Skip(NoSteal::NoIdleLane { source }),
        (Some((source, _)), Some(dest)) => StealPlan::Steal { source, dest },
    }
}

/// Counters exposed to metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StealStats {
    pub cycles: u64,
    pub steals: u64,
    pub aborted: u64,
    /// Cycles where a deep queue found no idle lane to relieve it.
    pub unrelieved: u64,
}

/// Drives one relocation per scheduling cycle over the shared lane queues.
#[derive(Debug, Clone, Default)]
pub struct WorkStealingScheduler {
    stats: StealStats,
    /// Per-lane flag: the last steal attempted from this lane failed.
    last_failed: Vec<bool>,
}

impl WorkStealingScheduler {
    pub fn new(lanes: usize) -> Self {
        Self {
            stats: StealStats::default(),
            last_failed: alloc::vec![false; lanes],
        }
    }

    pub fn stats(&self) -> StealStats {
        self.stats
    }

    pub fn last_steal_failed(&self, lane: usize) -> bool {
        self.last_failed.get(lane).copied().unwrap_or(false)
    }

    /// Run a single scheduling cycle.
    ///
    /// `idle[i]` is the coordinator's view of whether primary lane `i` is
    /// between jobs. A source left unrelieved is flagged congested on its
    /// queue so the redundant mapper can pick it up.
    pub fn run_cycle(&mut self, queues: &LaneQueues, idle: &[bool]) -> StealOutcome {
        self.stats.cycles += 1;
        let views: Vec<LaneView> = queues
            .depths()
            .into_iter()
            .zip(idle.iter())
            .map(|(depth, &idle)| LaneView { depth, idle })
            .collect();

        match plan_steal(&views) {
            StealPlan::Skip(reason) => {
                if let NoSteal::NoIdleLane { source } = reason {
                    self.stats.unrelieved += 1;
                    self.last_failed[source] = true;
                    queues.mark_congested(source);
                }
                trace!("steal skipped: {reason:?}");
                StealOutcome::Skipped(reason)
            }
            StealPlan::Steal { source, dest } => match queues.relocate(source, dest) {
                Relocation::Moved => {
                    self.stats.steals += 1;
                    self.last_failed[source] = false;
                    queues.clear_congestion(source);
                    debug!("stole one task: lane {source} -> lane {dest}");
                    StealOutcome::Stolen { source, dest }
                }
                Relocation::SourceEmpty | Relocation::SourceTooShallow => {
                    self.stats.aborted += 1;
                    debug!("steal aborted: lane {source} drained before relocation");
                    StealOutcome::Aborted { source, dest }
                }
                Relocation::DestinationFull => {
                    self.stats.aborted += 1;
                    self.last_failed[source] = true;
                    queues.mark_congested(source);
                    debug!("steal aborted: lane {dest} filled before relocation");
                    StealOutcome::Aborted { source, dest }
                }
            },
        }
    }

    pub fn reset(&mut self) {
        self.stats = StealStats::default();
        self.last_failed.iter_mut().for_each(|f| *f = false);
    }
}

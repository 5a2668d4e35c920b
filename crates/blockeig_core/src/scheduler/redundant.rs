//! Redundant-execution mapper.
//!
//! A small shared pool of spare lanes absorbs load from primary queues that
//! stealing could not relieve (queue full, or last steal attempt failed).
//!
//! - At most one spare is mapped to a congested queue at a time.
//! - Mapping is greedy (lowest queue index first) and non-preemptive: a spare
//!   that is executing a block finishes it before it is released or remapped.
//! - A spare is released once its queue is neither full nor congested.
//! - An exhausted pool is a degradation, not an error: the task stays queued.

use alloc::vec::Vec;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::lanes::QueuePressure;

/// State of one spare lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpareLane {
    /// Primary queue this spare absorbs from.
    pub mapped: Option<usize>,
    /// Currently executing a block.
    pub busy: bool,
    /// Release requested while busy; honoured when the block finishes.
    pub release_pending: bool,
}

impl SpareLane {
    fn is_free(&self) -> bool {
        self.mapped.is_none() && !self.busy
    }
}

/// Decisions produced by one rebalance pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperAction {
    Mapped { spare: usize, queue: usize },
    Released { spare: usize, queue: usize },
    /// Release deferred until the spare's current block completes.
    ReleaseDeferred { spare: usize, queue: usize },
    /// No spare left for a congested queue.
    Exhausted { queue: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MapperStats {
    pub mappings: u64,
    pub releases: u64,
    pub exhausted: u64,
    pub redundant_dispatches: u64,
}

#[derive(Debug, Clone)]
pub struct RedundantMapper {
    spares: Vec<SpareLane>,
    stats: MapperStats,
}

impl RedundantMapper {
    pub fn new(spare_lanes: usize) -> Self {
        Self {
            spares: alloc::vec![SpareLane::default(); spare_lanes],
            stats: MapperStats::default(),
        }
    }

    pub fn spares(&self) -> &[SpareLane] {
        &self.spares
    }

    pub fn stats(&self) -> MapperStats {
        self.stats
    }

    /// Spare currently mapped to `queue`, if any.
    pub fn spare_for(&self, queue: usize) -> Option<usize> {
        self.spares.iter().position(|s| s.mapped == Some(queue))
    }

    pub fn free_spares(&self) -> usize {
        self.spares.iter().filter(|s| s.is_free()).count()
    }

    /// Release spares whose queues recovered, then map free spares to
    /// congested queues without one.
    pub fn rebalance(&mut self, pressures: &[QueuePressure]) -> Vec<MapperAction> {
        let mut actions = Vec::new();

        for (spare, lane) in self.spares.iter_mut().enumerate() {
            let Some(queue) = lane.mapped else { continue };
            let relieved = pressures
                .get(queue)
                .map(|p| !p.is_under_pressure())
                .unwrap_or(true);
            if !relieved {
                lane.release_pending = false;
                continue;
            }
            if lane.busy {
                if !lane.release_pending {
                    lane.release_pending = true;
                    actions.push(MapperAction::ReleaseDeferred { spare, queue });
                }
            } else {
                lane.mapped = None;
                lane.release_pending = false;
                self.stats.releases += 1;
                actions.push(MapperAction::Released { spare, queue });
            }
        }

        for (queue, pressure) in pressures.iter().enumerate() {
            if !pressure.is_under_pressure() || self.spare_for(queue).is_some() {
                continue;
            }
            match self.spares.iter().position(SpareLane::is_free) {
                Some(spare) => {
                    self.spares[spare].mapped = Some(queue);
                    self.stats.mappings += 1;
                    debug!("spare {spare} mapped to congested lane {queue}");
                    actions.push(MapperAction::Mapped { spare, queue });
                }
                None => {
                    self.stats.exhausted += 1;
                    trace!("spare pool exhausted; lane {queue} stays queued");
                    actions.push(MapperAction::Exhausted { queue });
                }
            }
        }

        actions
    }

    /// Spares that are mapped, idle and not waiting on release: ready to take
    /// the next task from their queue. Returns `(spare, queue)` pairs.
    pub fn ready(&self) -> Vec<(usize, usize)> {
        self.spares
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.busy && !s.release_pending)
            .filter_map(|(i, s)| s.mapped.map(|q| (i, q)))
            .collect()
    }

    /// Record that a spare started a block.
    pub fn mark_dispatched(&mut self, spare: usize) {
        if let Some(lane) = self.spares.get_mut(spare) {
            lane.busy = true;
            self.stats.redundant_dispatches += 1;
        }
    }

    /// Record that a spare finished its block; applies a deferred release.
    pub fn mark_finished(&mut self, spare: usize) -> Option<MapperAction> {
        let lane = self.spares.get_mut(spare)?;
        lane.busy = false;
        if lane.release_pending {
            let queue = lane.mapped.take()?;
            lane.release_pending = false;
            self.stats.releases += 1;
            return Some(MapperAction::Released { spare, queue });
        }
        None
    }

    /// Unmap every spare. Busy flags are kept: the block in flight still
    /// belongs to the lane until it reports back.
    pub fn release_all(&mut self) {
        for lane in &mut self.spares {
            lane.mapped = None;
            lane.release_pending = false;
        }
    }

    pub fn reset(&mut self) {
        self.spares.iter_mut().for_each(|s| *s = SpareLane::default());
        self.stats = MapperStats::default();
    }
}

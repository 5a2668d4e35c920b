//! Reorder / completion buffer.
//!
//! Lanes finish blocks in any order. The buffer holds their results in a
//! fixed slot arena and commits them into the iteration vector strictly in
//! sequence order, except for a bounded forced commit that prevents a single
//! slow block from starving the buffer.
//!
//! ```text
//!   issue_sequence()        submit_result()            advance()
//!  ┌──────────────┐      ┌──────────────────┐      ┌────────────────────┐
//!  │ next_sequence│ ───► │ slots[capacity]  │ ───► │ contiguous commit  │
//!  └──────────────┘      │ write cursor     │      │ forced commit      │
//!                        └──────────────────┘      │ normalize, drain   │
//!                                                  └────────────────────┘
//!   live window = [next_expected, next_sequence)
//! ```
//!
//! | Condition                               | Handling                          |
//! |-----------------------------------------|-----------------------------------|
//! | result from another iteration           | dropped, `stale`                  |
//! | sequence ≤ capacity behind the window   | dropped, `stale` (late duplicate) |
//! | sequence otherwise outside the window   | `EngineError::Sequence`, reset    |
//! | buffer full                             | `Admission::Stalled`, `stalls`    |
//! | 4 duplicate/stall events                | `ErrorRecovery`, duplicates resolved |

use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use super::phase::{ReorderEvent, ReorderPhase};
use super::vector::IterationVector;
use crate::block::{Element, ResultEntry, ResultKind, ROWS_PER_BLOCK};
use crate::error::{EngineError, Result};

/// Duplicate/stall events that trigger error recovery.
pub const DUPLICATE_STORM_THRESHOLD: u32 = 4;

/// Size of the sequence number space.
const SEQUENCE_SPACE: usize = u16::MAX as usize + 1;

/// Externally reported corruption kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    SequenceCorruption,
    DuplicateStorm,
    Unknown(u8),
}

/// Result of offering an entry to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted { slot: usize },
    /// Buffer full; the caller keeps the entry and retries.
    Stalled,
    /// Late copy or wrong iteration; dropped.
    Stale,
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReorderStats {
    pub admitted: u64,
    pub committed: u64,
    /// Commits of results computed by a spare lane.
    pub redundant_commits: u64,
    pub stalls: u64,
    pub out_of_order: u64,
    pub forced_commits: u64,
    pub duplicates_resolved: u64,
    pub stale: u64,
    pub sequence_errors: u64,
    pub flushes: u64,
    pub storms: u64,
    /// Length of the contiguous run found by the last check.
    pub last_run: usize,
}

/// A normalized, fully committed iteration vector.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationOutput {
    pub iteration: u8,
    pub vector: Vec<Element>,
    /// Infinity norm before normalization.
    pub norm: Element,
}

#[derive(Debug, Clone)]
pub struct ReorderBuffer {
    slots: Vec<Option<ResultEntry>>,
    occupancy: usize,
    write_cursor: usize,
    next_sequence: u16,
    next_expected: u16,
    /// Sequences already accounted for out of order (forced commits,
    /// invalidated duplicates). Skipped when `next_expected` reaches them.
    retired: BTreeSet<u16>,
    /// Sequence of the entry committed for each block this iteration.
    committed_seq: Vec<Option<u16>>,
    /// Blocks already counted as duplicated this iteration.
    duplicated: Vec<bool>,
    iteration: u8,
    vector: IterationVector,
    storm: u32,
    phase: ReorderPhase,
    stats: ReorderStats,
    last_norm: Option<Element>,
}

impl ReorderBuffer {
    /// `capacity` slots for a vector of `dimension` elements.
    pub fn new(capacity: usize, dimension: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            occupancy: 0,
            write_cursor: 0,
            next_sequence: 0,
            next_expected: 0,
            retired: BTreeSet::new(),
            committed_seq: vec![None; dimension / ROWS_PER_BLOCK],
            duplicated: vec![false; dimension / ROWS_PER_BLOCK],
            iteration: 0,
            vector: IterationVector::new(dimension),
            storm: 0,
            phase: ReorderPhase::Idle,
            stats: ReorderStats::default(),
            last_norm: None,
        }
    }

    // ---- Accessors ----

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    pub fn is_full(&self) -> bool {
        self.occupancy >= self.capacity()
    }

    pub fn next_expected(&self) -> u16 {
        self.next_expected
    }

    pub fn next_sequence(&self) -> u16 {
        self.next_sequence
    }

    pub fn iteration(&self) -> u8 {
        self.iteration
    }

    pub fn phase(&self) -> ReorderPhase {
        self.phase
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    pub fn vector(&self) -> &IterationVector {
        &self.vector
    }

    /// Norm of the last drained iteration.
    pub fn last_norm(&self) -> Option<Element> {
        self.last_norm
    }

    /// Sequences issued but not yet committed or retired.
    fn outstanding(&self) -> usize {
        self.next_sequence.wrapping_sub(self.next_expected) as usize
    }

    fn transition(&mut self, event: ReorderEvent) {
        let next = self.phase.next(event);
        if next != self.phase {
            trace!("reorder {:?} -> {:?} on {:?}", self.phase, next, event);
        }
        self.phase = next;
    }

    // ---- Sequencing ----

    /// Start collecting results for `iteration`. Clears every slot and the
    /// sequence counters.
    pub fn begin_iteration(&mut self, iteration: u8) {
        self.clear_state();
        self.iteration = iteration;
        self.phase = ReorderPhase::Idle;
    }

    /// Hand out the next sequence number for a task entering a lane queue.
    ///
    /// Fails with a sequence error (and a counter reset) if the live window
    /// would wrap into sequences that can still arrive late.
    pub fn issue_sequence(&mut self) -> Result<u16> {
        if self.outstanding() + self.capacity() >= SEQUENCE_SPACE - 1 {
            return Err(self.sequence_fault(self.next_sequence));
        }
        let seq = self.next_sequence;
        self.next_sequence = seq.wrapping_add(1);
        Ok(seq)
    }

    // ---- Accepting ----

    /// Offer a lane result to the buffer.
    pub fn submit_result(&mut self, entry: ResultEntry) -> Result<Admission> {
        self.transition(ReorderEvent::ResultArrived);

        if entry.iteration != self.iteration {
            self.stats.stale += 1;
            trace!(
                "dropping block {} from iteration {} (current {})",
                entry.block_id,
                entry.iteration,
                self.iteration
            );
            return Ok(Admission::Stale);
        }
        if !self.vector.accepts(entry.block_id) {
            return Err(EngineError::InvalidBlocks(format!(
                "result for block {} outside vector of dimension {}",
                entry.block_id,
                self.vector.dimension()
            )));
        }

        let ahead = entry.sequence.wrapping_sub(self.next_expected) as usize;
        if ahead >= self.outstanding() {
            let behind = self.next_expected.wrapping_sub(entry.sequence) as usize;
            if (1..=self.capacity()).contains(&behind) {
                self.stats.stale += 1;
                self.note_storm();
                return Ok(Admission::Stale);
            }
            return Err(self.sequence_fault(entry.sequence));
        }
        if self.retired.contains(&entry.sequence) || self.slot_of(entry.sequence).is_some() {
            self.stats.stale += 1;
            return Ok(Admission::Stale);
        }

        if self.is_full() {
            self.stats.stalls += 1;
            // A storm may free slots by invalidating duplicates.
            self.note_storm();
        }
        let Some(slot) = self.free_slot() else {
            trace!("buffer full, seq {} stalled", entry.sequence);
            return Ok(Admission::Stalled);
        };

        if entry.sequence != self.next_expected && self.slot_of(self.next_expected).is_none() {
            self.stats.out_of_order += 1;
        }
        if self.vector.block_committed(entry.block_id) {
            self.note_storm();
        }

        let mut entry = entry;
        entry.committed = false;
        self.slots[slot] = Some(entry);
        self.occupancy += 1;
        self.write_cursor = (slot + 1) % self.capacity();
        self.stats.admitted += 1;
        Ok(Admission::Accepted { slot })
    }

    /// Write cursor first, then a full scan.
    fn free_slot(&self) -> Option<usize> {
        if self.slots[self.write_cursor].is_none() {
            return Some(self.write_cursor);
        }
        self.slots.iter().position(Option::is_none)
    }

    fn slot_of(&self, sequence: u16) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(e) if e.sequence == sequence))
    }

    fn take_slot(&mut self, slot: usize) -> Option<ResultEntry> {
        let entry = self.slots[slot].take()?;
        self.occupancy -= 1;
        Some(entry)
    }

    // ---- Checking / Committing ----

    /// Run one check/commit pass. Returns the normalized vector once every
    /// block of the iteration has been committed.
    pub fn advance(&mut self) -> Result<Option<IterationOutput>> {
        self.transition(ReorderEvent::Check);
        self.skip_retired();

        let run = self.contiguous_run();
        self.stats.last_run = run;

        if run > 0 {
            self.transition(ReorderEvent::CommitReady);
            self.commit_contiguous()?;
        } else if self.occupancy * 2 > self.capacity() {
            self.transition(ReorderEvent::CommitReady);
            self.force_commit_oldest()?;
            self.commit_contiguous()?;
        } else {
            self.transition(ReorderEvent::NothingToCommit);
            return Ok(None);
        }

        let complete = self.vector.is_complete();
        self.transition(ReorderEvent::Committed { complete });
        if !complete {
            return Ok(None);
        }

        let (vector, norm) = self.vector.normalized();
        self.last_norm = Some(norm);
        self.transition(ReorderEvent::Normalized);

        let iteration = self.iteration;
        self.drain();
        self.transition(ReorderEvent::Drained);
        debug!("iteration {iteration} drained, norm {norm:e}");

        Ok(Some(IterationOutput {
            iteration,
            vector,
            norm,
        }))
    }

    fn skip_retired(&mut self) {
        while self.retired.remove(&self.next_expected) {
            self.next_expected = self.next_expected.wrapping_add(1);
        }
    }

    /// Pending entries reachable from `next_expected` without a gap.
    /// Retired sequences are passable but not counted.
    fn contiguous_run(&self) -> usize {
        let mut run = 0;
        let mut seq = self.next_expected;
        for _ in 0..self.outstanding() {
            if self.slot_of(seq).is_some() {
                run += 1;
            } else if !self.retired.contains(&seq) {
                break;
            }
            seq = seq.wrapping_add(1);
        }
        run
    }

    fn commit_contiguous(&mut self) -> Result<usize> {
        let mut committed = 0;
        loop {
            self.skip_retired();
            let Some(slot) = self.slot_of(self.next_expected) else {
                break;
            };
            if let Some(entry) = self.take_slot(slot) {
                self.commit_entry(entry)?;
            }
            self.next_expected = self.next_expected.wrapping_add(1);
            committed += 1;
        }
        Ok(committed)
    }

    /// Commit the pending entry closest to `next_expected` and retire its
    /// sequence so the missing older ones still commit later.
    fn force_commit_oldest(&mut self) -> Result<()> {
        let expected = self.next_expected;
        let oldest = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|e| (i, e.sequence.wrapping_sub(expected))))
            .min_by_key(|&(_, distance)| distance)
            .map(|(i, _)| i);
        let Some(slot) = oldest else { return Ok(()) };
        if let Some(entry) = self.take_slot(slot) {
            debug!(
                "forced commit of seq {} while waiting on {}",
                entry.sequence, expected
            );
            self.retired.insert(entry.sequence);
            self.stats.forced_commits += 1;
            self.commit_entry(entry)?;
        }
        Ok(())
    }

    /// Write one entry into the vector. The higher sequence wins when a
    /// block is committed twice.
    fn commit_entry(&mut self, mut entry: ResultEntry) -> Result<()> {
        let block = entry.block_id as usize;
        let previous = self.committed_seq[block];
        if previous.is_some() {
            self.note_duplicate(entry.block_id);
        }
        if matches!(previous, Some(prev) if prev > entry.sequence) {
            return Ok(());
        }
        self.vector.write_block(entry.block_id, entry.data)?;
        self.committed_seq[block] = Some(entry.sequence);
        entry.committed = true;
        self.stats.committed += 1;
        if entry.kind == ResultKind::Redundant {
            self.stats.redundant_commits += 1;
        }
        trace!("committed block {} seq {}", entry.block_id, entry.sequence);
        Ok(())
    }

    /// Sweep leftovers and clear the mask for the next iteration.
    fn drain(&mut self) {
        let leftovers = self.occupancy;
        if leftovers > 0 {
            debug!("drain dropped {leftovers} superseded entries");
        }
        self.clear_state();
    }

    // ---- Error recovery ----

    fn note_storm(&mut self) {
        self.storm += 1;
        if self.storm >= DUPLICATE_STORM_THRESHOLD {
            self.storm = 0;
            self.stats.storms += 1;
            self.recover_duplicates();
        }
    }

    fn recover_duplicates(&mut self) -> usize {
        self.transition(ReorderEvent::Fault);
        let resolved = self.resolve_duplicates();
        self.transition(ReorderEvent::Recovered);
        debug!("duplicate recovery invalidated {resolved} entries");
        resolved
    }

    /// Keep the higher-sequence entry of every `(block_id, iteration)` pair,
    /// and drop pending copies older than what is already committed.
    fn resolve_duplicates(&mut self) -> usize {
        let mut resolved = 0;
        for i in 0..self.capacity() {
            let Some(a) = self.slots[i] else { continue };
            if matches!(self.committed_seq[a.block_id as usize], Some(c) if c > a.sequence) {
                self.invalidate(i);
                self.note_duplicate(a.block_id);
                resolved += 1;
                continue;
            }
            for j in (i + 1)..self.capacity() {
                let Some(b) = self.slots[j] else { continue };
                if b.block_id != a.block_id || b.iteration != a.iteration {
                    continue;
                }
                let loser = if a.sequence < b.sequence { i } else { j };
                self.invalidate(loser);
                self.note_duplicate(a.block_id);
                resolved += 1;
                if loser == i {
                    break;
                }
            }
        }
        resolved
    }

    /// Count a duplicated block once per iteration, however many copies of
    /// it turn up or which path resolves them.
    fn note_duplicate(&mut self, block_id: u8) {
        let flag = &mut self.duplicated[block_id as usize];
        if *flag {
            return;
        }
        *flag = true;
        self.stats.duplicates_resolved += 1;
        warn!(
            "{}; keeping the higher sequence",
            EngineError::DuplicateBlock {
                block_id,
                iteration: self.iteration,
            }
        );
    }

    fn invalidate(&mut self, slot: usize) {
        if let Some(entry) = self.take_slot(slot) {
            self.retired.insert(entry.sequence);
        }
    }

    fn sequence_fault(&mut self, got: u16) -> EngineError {
        let err = EngineError::Sequence {
            expected: self.next_expected,
            got,
        };
        warn!("{err}; resetting sequence counters");
        self.stats.sequence_errors += 1;
        self.transition(ReorderEvent::Fault);
        self.clear_state();
        self.transition(ReorderEvent::Recovered);
        err
    }

    /// Apply the recovery for an externally reported error code. Returns the
    /// number of entries invalidated.
    pub fn handle_error(&mut self, code: ErrorCode) -> usize {
        let pending = self.occupancy;
        match code {
            ErrorCode::SequenceCorruption => {
                self.sequence_fault(self.next_sequence);
                pending
            }
            ErrorCode::DuplicateStorm => {
                self.stats.storms += 1;
                self.recover_duplicates()
            }
            ErrorCode::Unknown(code) => {
                warn!("{}", EngineError::UnknownCorruption { code });
                self.flush();
                pending
            }
        }
    }

    /// Invalidate every entry and reset occupancy, sequences and the mask.
    pub fn flush(&mut self) {
        self.stats.flushes += 1;
        self.clear_state();
        self.transition(ReorderEvent::Flush);
    }

    /// Back to the freshly constructed state.
    pub fn reset(&mut self) {
        self.clear_state();
        self.iteration = 0;
        self.phase = ReorderPhase::Idle;
        self.stats = ReorderStats::default();
        self.last_norm = None;
    }

    fn clear_state(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.occupancy = 0;
        self.write_cursor = 0;
        self.next_sequence = 0;
        self.next_expected = 0;
        self.retired.clear();
        self.committed_seq.iter_mut().for_each(|c| *c = None);
        self.duplicated.iter_mut().for_each(|d| *d = false);
        self.vector.clear();
        self.storm = 0;
    }
}

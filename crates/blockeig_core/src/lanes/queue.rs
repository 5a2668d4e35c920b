//! Per-lane task queues.
//!
//! Each primary lane owns one bounded FIFO. The owning lane dequeues from the
//! front; the scheduler relocates from the back (LIFO-from-tail). Every queue
//! sits behind its own `parking_lot::Mutex` so exactly one mutator touches it
//! at a time, and a relocation never holds two queue locks at once.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use parking_lot::Mutex;

use crate::block::{ResultKind, Task};

/// A queued task plus the result kind it will execute as.
#[derive(Debug, Clone)]
pub struct Queued {
    pub task: Task,
    pub kind: ResultKind,
}

/// Bounded FIFO of tasks owned by one primary lane.
#[derive(Debug, Clone)]
pub struct LaneQueue {
    entries: VecDeque<Queued>,
    capacity: usize,
    /// Set when a push was rejected or a steal could not relieve this queue.
    congested: bool,
    /// Total tasks ever accepted
    total_enqueued: u64,
    /// Pushes rejected because the queue was full
    total_rejected: u64,
}

impl LaneQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            congested: false,
            total_enqueued: 0,
            total_rejected: 0,
        }
    }

    /// Append a task. Returns it back (and marks the queue congested) when full.
    pub fn push_back(&mut self, queued: Queued) -> Result<(), Queued> {
        if self.entries.len() >= self.capacity {
            self.congested = true;
            self.total_rejected += 1;
            return Err(queued);
        }
        self.entries.push_back(queued);
        self.total_enqueued += 1;
        Ok(())
    }

    /// Owner dequeue.
    pub fn pop_front(&mut self) -> Option<Queued> {
        let next = self.entries.pop_front();
        if self.entries.len() <= 1 {
            // Nothing left worth stealing or absorbing.
            self.congested = false;
        }
        next
    }

    /// Relocation dequeue: the most recently enqueued task.
    pub fn steal_back(&mut self) -> Option<Queued> {
        self.entries.pop_back()
    }

    /// Put a task back at the tail after an aborted relocation.
    pub(crate) fn restore_back(&mut self, queued: Queued) {
        self.entries.push_back(queued);
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn is_congested(&self) -> bool {
        self.congested
    }

    pub fn mark_congested(&mut self) {
        self.congested = true;
    }

    pub fn clear_congestion(&mut self) {
        self.congested = false;
    }

    pub fn total_enqueued(&self) -> u64 {
        self.total_enqueued
    }

    pub fn total_rejected(&self) -> u64 {
        self.total_rejected
    }

    /// Drop every queued task (abort/reset).
    pub fn clear(&mut self) {
        self.entries.clear();
        self.congested = false;
    }
}

/// Pressure signals the redundant mapper reads for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueuePressure {
    pub full: bool,
    pub congested: bool,
}

impl QueuePressure {
    pub fn is_under_pressure(&self) -> bool {
        self.full || self.congested
    }
}

/// Result of relocating one task between queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation {
    Moved,
    /// The source had nothing to give at execution time.
    SourceEmpty,
    /// The source shrank to its last task since planning; a steal never
    /// takes that one.
    SourceTooShallow,
    /// The destination filled up in the meantime; the task went back.
    DestinationFull,
}

/// The full set of primary lane queues.
#[derive(Debug)]
pub struct LaneQueues {
    queues: Vec<Mutex<LaneQueue>>,
}

impl LaneQueues {
    pub fn new(lanes: usize, capacity: usize) -> Self {
        Self {
            queues: (0..lanes)
                .map(|_| Mutex::new(LaneQueue::new(capacity)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn push(&self, lane: usize, queued: Queued) -> Result<(), Queued> {
        self.queues[lane].lock().push_back(queued)
    }

    pub fn pop(&self, lane: usize) -> Option<Queued> {
        self.queues[lane].lock().pop_front()
    }

    pub fn depth(&self, lane: usize) -> usize {
        self.queues[lane].lock().depth()
    }

    pub fn depths(&self) -> Vec<usize> {
        self.queues.iter().map(|q| q.lock().depth()).collect()
    }

    pub fn total_depth(&self) -> usize {
        self.queues.iter().map(|q| q.lock().depth()).sum()
    }

    pub fn pressures(&self) -> Vec<QueuePressure> {
        self.queues
            .iter()
            .map(|q| {
                let q = q.lock();
                QueuePressure {
                    full: q.is_full(),
                    congested: q.is_congested(),
                }
            })
            .collect()
    }

    pub fn mark_congested(&self, lane: usize) {
        self.queues[lane].lock().mark_congested();
    }

    pub fn clear_congestion(&self, lane: usize) {
        self.queues[lane].lock().clear_congestion();
    }

    /// Move the tail task of `source` to `dest`, tagging it as stolen.
    ///
    /// Locks are taken one at a time, so the steal is a single-writer
    /// relocation on each queue. The source depth is re-checked under its
    /// lock: the plan may be stale by the time it executes.
    pub fn relocate(&self, source: usize, dest: usize) -> Relocation {
        let stolen = {
            let mut src = self.queues[source].lock();
            match src.depth() {
                0 => return Relocation::SourceEmpty,
                1 => return Relocation::SourceTooShallow,
                _ => {}
            }
            match src.steal_back() {
                Some(q) => q,
                None => return Relocation::SourceEmpty,
            }
        };
        let original_kind = stolen.kind;
        let moved = Queued {
            task: stolen.task,
            kind: ResultKind::Stolen,
        };
        match self.queues[dest].lock().push_back(moved) {
            Ok(()) => Relocation::Moved,
            Err(mut back) => {
                back.kind = original_kind;
                self.queues[source].lock().restore_back(back);
                Relocation::DestinationFull
            }
        }
    }

    pub fn clear_all(&self) {
        for q in &self.queues {
            q.lock().clear();
        }
    }
}

//! Compute lane pool: N primary and R spare worker threads.
//!
//! ```text
//!                 Job (bounded 1)            Completion (shared)
//!  coordinator ──────────────────► lane-k ─────────────────────► coordinator
//!                                 (multiply)
//! ```
//!
//! Each worker processes one job to completion before taking the next. The
//! coordinator only dispatches to a lane it has observed idle, so the job
//! channel never blocks. A panicking compute unit costs that block's result,
//! not the worker. Dropping the pool closes every job channel and joins the
//! workers.

use alloc::sync::Arc;
use alloc::vec::Vec;
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, trace, warn};

use super::compute::ComputeUnit;
use crate::block::{Element, LaneSlot, ResultEntry, ResultKind, Task};
use crate::error::{EngineError, Result};

/// Work handed to a lane.
#[derive(Debug, Clone)]
pub struct Job {
    pub task: Task,
    pub kind: ResultKind,
    /// Iteration vector snapshot the block multiplies against.
    pub input: Arc<Vec<Element>>,
}

/// A finished job as reported by a lane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Completion {
    pub slot: LaneSlot,
    /// `None` when the compute unit panicked and the result was lost.
    pub entry: Option<ResultEntry>,
}

fn panic_message(payload: &(dyn core::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug)]
struct Worker {
    jobs: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
    busy: bool,
    executed: u64,
}

impl Worker {
    fn spawn<U: ComputeUnit>(
        slot: LaneSlot,
        unit: Arc<U>,
        results: Sender<Completion>,
    ) -> Result<Self> {
        let (tx, rx) = bounded::<Job>(1);
        let name = match slot {
            LaneSlot::Primary(i) => format!("lane-{i}"),
            LaneSlot::Spare(i) => format!("spare-{i}"),
        };
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                for job in rx {
                    let computed = panic::catch_unwind(AssertUnwindSafe(|| {
                        unit.multiply(&job.task.block, &job.input)
                    }));
                    let entry = match computed {
                        Ok(data) => Some(ResultEntry::new(
                            job.task.block_id(),
                            job.task.sequence,
                            data,
                            job.kind,
                            job.task.iteration,
                        )),
                        Err(payload) => {
                            warn!(
                                "{slot:?} lost block {} (seq {}): {}",
                                job.task.block_id(),
                                job.task.sequence,
                                panic_message(payload.as_ref())
                            );
                            None
                        }
                    };
                    if results.send(Completion { slot, entry }).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| EngineError::LaneSpawn(e.to_string()))?;

        Ok(Self {
            jobs: Some(tx),
            handle: Some(handle),
            busy: false,
            executed: 0,
        })
    }
}

/// Fixed pool of primary and spare compute lanes.
#[derive(Debug)]
pub struct LanePool {
    primaries: Vec<Worker>,
    spares: Vec<Worker>,
    results: Receiver<Completion>,
    in_flight: usize,
}

impl LanePool {
    pub fn new<U: ComputeUnit>(lanes: usize, spare_lanes: usize, unit: Arc<U>) -> Result<Self> {
        let (results_tx, results_rx) = unbounded();
        let primaries = (0..lanes)
            .map(|i| Worker::spawn(LaneSlot::Primary(i), unit.clone(), results_tx.clone()))
            .collect::<Result<Vec<_>>>()?;
        let spares = (0..spare_lanes)
            .map(|i| Worker::spawn(LaneSlot::Spare(i), unit.clone(), results_tx.clone()))
            .collect::<Result<Vec<_>>>()?;
        debug!("lane pool started: {lanes} primary, {spare_lanes} spare");

        Ok(Self {
            primaries,
            spares,
            results: results_rx,
            in_flight: 0,
        })
    }

    pub fn lanes(&self) -> usize {
        self.primaries.len()
    }

    pub fn spare_lanes(&self) -> usize {
        self.spares.len()
    }

    fn worker(&self, slot: LaneSlot) -> &Worker {
        match slot {
            LaneSlot::Primary(i) => &self.primaries[i],
            LaneSlot::Spare(i) => &self.spares[i],
        }
    }

    fn worker_mut(&mut self, slot: LaneSlot) -> &mut Worker {
        match slot {
            LaneSlot::Primary(i) => &mut self.primaries[i],
            LaneSlot::Spare(i) => &mut self.spares[i],
        }
    }

    pub fn is_idle(&self, slot: LaneSlot) -> bool {
        !self.worker(slot).busy
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Jobs completed by a worker since the pool started.
    pub fn executed(&self, slot: LaneSlot) -> u64 {
        self.worker(slot).executed
    }

    /// Hand a job to an idle lane.
    pub fn dispatch(&mut self, slot: LaneSlot, job: Job) -> Result<()> {
        let worker = self.worker_mut(slot);
        debug_assert!(!worker.busy, "dispatch to busy lane {slot:?}");
        let sender = worker.jobs.as_ref().ok_or(EngineError::LanePoolDisconnected)?;
        trace!(
            "dispatch block {} seq {} to {:?}",
            job.task.block_id(),
            job.task.sequence,
            slot
        );
        sender
            .send(job)
            .map_err(|_| EngineError::LanePoolDisconnected)?;
        worker.busy = true;
        self.in_flight += 1;
        Ok(())
    }

    fn retire(&mut self, completion: &Completion) {
        let worker = self.worker_mut(completion.slot);
        worker.busy = false;
        worker.executed += 1;
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Drain every completion already reported, without blocking.
    pub fn try_collect(&mut self) -> Vec<Completion> {
        let mut done = Vec::new();
        while let Ok(c) = self.results.try_recv() {
            self.retire(&c);
            done.push(c);
        }
        done
    }

    /// Block up to `timeout` for the first completion, then drain the rest.
    ///
    /// Returns an empty batch when nothing is in flight or the wait timed out.
    pub fn collect(&mut self, timeout: Duration) -> Result<Vec<Completion>> {
        if self.in_flight == 0 {
            return Ok(self.try_collect());
        }
        match self.results.recv_timeout(timeout) {
            Ok(first) => {
                self.retire(&first);
                let mut done = alloc::vec![first];
                done.extend(self.try_collect());
                Ok(done)
            }
            Err(RecvTimeoutError::Timeout) => Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::LanePoolDisconnected),
        }
    }

    /// Wait for every in-flight job and throw the results away (abort path).
    pub fn discard_in_flight(&mut self) -> Result<usize> {
        let mut discarded = 0;
        while self.in_flight > 0 {
            match self.results.recv() {
                Ok(c) => {
                    self.retire(&c);
                    discarded += 1;
                }
                Err(_) => return Err(EngineError::LanePoolDisconnected),
            }
        }
        Ok(discarded)
    }
}

impl Drop for LanePool {
    fn drop(&mut self) {
        for worker in self.primaries.iter_mut().chain(self.spares.iter_mut()) {
            worker.jobs.take();
        }
        for worker in self.primaries.iter_mut().chain(self.spares.iter_mut()) {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, Payload};
    use crate::lanes::compute::BlockMultiplier;
    use alloc::vec;

    fn job(id: u8, seq: u16) -> Job {
        let block = Arc::new(Block::new(
            id,
            1,
            Payload::Sparse {
                entries: vec![(0, 0, 2.0), (1, 0, 3.0)],
            },
            false,
        ));
        Job {
            task: Task::new(block, 5, seq),
            kind: ResultKind::Normal,
            input: Arc::new(vec![1.5]),
        }
    }

    #[test]
    fn test_dispatch_and_collect() {
        let mut pool = LanePool::new(2, 1, Arc::new(BlockMultiplier)).unwrap();
        pool.dispatch(LaneSlot::Primary(0), job(0, 0)).unwrap();
        pool.dispatch(LaneSlot::Spare(0), job(1, 1)).unwrap();
        assert!(!pool.is_idle(LaneSlot::Primary(0)));
        assert_eq!(pool.in_flight(), 2);

        let mut done = Vec::new();
        while done.len() < 2 {
            done.extend(pool.collect(Duration::from_secs(5)).unwrap());
        }
        done.sort_by_key(|c| c.entry.unwrap().sequence);
        assert_eq!(done[0].entry.unwrap().data, [3.0, 4.5]);
        assert_eq!(done[0].entry.unwrap().iteration, 5);
        assert_eq!(done[1].entry.unwrap().kind, ResultKind::Normal);
        assert_eq!(done[1].slot, LaneSlot::Spare(0));
        assert!(pool.is_idle(LaneSlot::Primary(0)));
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.executed(LaneSlot::Primary(0)), 1);
    }

    #[test]
    fn test_collect_with_nothing_in_flight_returns_immediately() {
        let mut pool = LanePool::new(1, 0, Arc::new(BlockMultiplier)).unwrap();
        let done = pool.collect(Duration::from_secs(30)).unwrap();
        assert!(done.is_empty());
    }

    #[test]
    fn test_panicking_unit_loses_only_that_block() {
        struct FailsOnBlockOne;
        impl ComputeUnit for FailsOnBlockOne {
            fn multiply(&self, block: &Block, input: &[Element]) -> [Element; 2] {
                assert!(block.id != 1, "multiplier fault");
                BlockMultiplier.multiply(block, input)
            }
        }

        let mut pool = LanePool::new(1, 0, Arc::new(FailsOnBlockOne)).unwrap();
        let slot = LaneSlot::Primary(0);
        pool.dispatch(slot, job(1, 0)).unwrap();
        let lost = pool.collect(Duration::from_secs(5)).unwrap();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].entry, None);
        assert!(pool.is_idle(slot));

        // The worker survived and keeps serving.
        pool.dispatch(slot, job(2, 1)).unwrap();
        let done = pool.collect(Duration::from_secs(5)).unwrap();
        assert_eq!(done[0].entry.map(|e| e.block_id), Some(2));
        assert_eq!(pool.executed(slot), 2);
    }

    #[test]
    fn test_discard_in_flight() {
        let mut pool = LanePool::new(3, 0, Arc::new(BlockMultiplier)).unwrap();
        for i in 0..3 {
            pool.dispatch(LaneSlot::Primary(i), job(i as u8, i as u16)).unwrap();
        }
        assert_eq!(pool.discard_in_flight().unwrap(), 3);
        assert_eq!(pool.in_flight(), 0);
    }
}

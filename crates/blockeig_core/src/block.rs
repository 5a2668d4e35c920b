//! Data model shared by every runtime component.
//!
//! A block covers two consecutive rows of the matrix (`2*id`, `2*id+1`) and
//! yields exactly two output elements when multiplied against the iteration
//! vector. Blocks are produced once per iteration by the block source and are
//! never mutated afterwards; tasks hold them behind an `Arc` so that moving a
//! task between queues never copies its payload.

use alloc::sync::Arc;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

/// Scalar type of the iteration vector.
pub type Element = f64;

/// Rows covered by one block.
pub const ROWS_PER_BLOCK: usize = 2;

/// Matrix payload of a 2-row block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Row-major `2 x cols` values.
    Dense { cols: usize, values: Vec<Element> },
    /// `(row_in_block, col, value)` triplets; `row_in_block` is 0 or 1.
    Sparse { entries: Vec<(u8, u32, Element)> },
}

impl Payload {
    /// Number of stored (non-structural-zero) entries.
    pub fn stored(&self) -> usize {
        match self {
            Payload::Dense { values, .. } => values.len(),
            Payload::Sparse { entries } => entries.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: u8,
    /// Size class reported by the partitioner (informational).
    pub size: u8,
    pub payload: Payload,
    /// Block lies on the matrix diagonal.
    pub diagonal: bool,
}

impl Block {
    pub fn new(id: u8, size: u8, payload: Payload, diagonal: bool) -> Self {
        Self {
            id,
            size,
            payload,
            diagonal,
        }
    }

    /// Positions in the iteration vector written by this block.
    pub fn rows(&self) -> [usize; ROWS_PER_BLOCK] {
        let base = self.id as usize * ROWS_PER_BLOCK;
        [base, base + 1]
    }
}

/// A block scheduled for one iteration.
///
/// Created when the block enters a lane queue, consumed when a lane starts it.
/// The sequence number is issued by the reorder buffer at creation and comes
/// back with the result.
#[derive(Debug, Clone)]
pub struct Task {
    pub block: Arc<Block>,
    pub iteration: u8,
    pub sequence: u16,
}

impl Task {
    pub fn new(block: Arc<Block>, iteration: u8, sequence: u16) -> Self {
        Self {
            block,
            iteration,
            sequence,
        }
    }

    pub fn block_id(&self) -> u8 {
        self.block.id
    }
}

/// How a result was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResultKind {
    /// Executed by the lane whose queue it was distributed to.
    #[default]
    Normal,
    /// Absorbed by a spare lane from a congested queue.
    Redundant,
    /// Relocated by a steal before execution.
    Stolen,
}

/// A lane's output for one block, owned by the reorder buffer until committed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultEntry {
    pub block_id: u8,
    pub sequence: u16,
    pub data: [Element; ROWS_PER_BLOCK],
    pub kind: ResultKind,
    pub iteration: u8,
    pub committed: bool,
}

impl ResultEntry {
    pub fn new(
        block_id: u8,
        sequence: u16,
        data: [Element; ROWS_PER_BLOCK],
        kind: ResultKind,
        iteration: u8,
    ) -> Self {
        Self {
            block_id,
            sequence,
            data,
            kind,
            iteration,
            committed: false,
        }
    }
}

/// Identifies a compute worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LaneSlot {
    Primary(usize),
    Spare(usize),
}

/// Matrix characteristics consumed by the adaptive controller.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MatrixProfile {
    /// Percentage of structural zeros, 0..=100.
    pub sparsity: u8,
    /// Coarse conditioning estimate, 0..=15 (higher is worse).
    pub condition: u8,
}

impl MatrixProfile {
    pub fn new(sparsity: u8, condition: u8) -> Self {
        Self {
            sparsity: sparsity.min(100),
            condition: condition.min(15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_rows() {
        let block = Block::new(3, 2, Payload::Sparse { entries: Vec::new() }, false);
        assert_eq!(block.rows(), [6, 7]);
    }

    #[test]
    fn test_profile_clamps() {
        let p = MatrixProfile::new(250, 99);
        assert_eq!(p.sparsity, 100);
        assert_eq!(p.condition, 15);
    }

    #[test]
    fn test_result_entry_starts_uncommitted() {
        let e = ResultEntry::new(1, 7, [1.0, 2.0], ResultKind::Stolen, 0);
        assert!(!e.committed);
        assert_eq!(e.kind, ResultKind::Stolen);
    }
}

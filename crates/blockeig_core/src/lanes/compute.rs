//! Boundary to the arithmetic unit that multiplies one block.
//!
//! The lane pool treats the multiply as an opaque synchronous call: load the
//! block, compute, hand back two elements. Precision of the multiply itself is
//! the implementor's business.

use crate::block::{Block, Element, Payload, ROWS_PER_BLOCK};

/// Executes one block's matrix-vector product.
pub trait ComputeUnit: Send + Sync + 'static {
    fn multiply(&self, block: &Block, input: &[Element]) -> [Element; ROWS_PER_BLOCK];
}

/// Straightforward dense/sparse 2-row multiply.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockMultiplier;

impl ComputeUnit for BlockMultiplier {
    fn multiply(&self, block: &Block, input: &[Element]) -> [Element; ROWS_PER_BLOCK] {
        let mut out = [0.0; ROWS_PER_BLOCK];
        match &block.payload {
            Payload::Dense { cols, values } => {
                let stride = *cols;
                let used = stride.min(input.len());
                for (row, acc) in out.iter_mut().enumerate() {
                    let start = row * stride;
                    if let Some(row_values) = values.get(start..start + used) {
                        *acc = row_values
                            .iter()
                            .zip(input.iter())
                            .map(|(a, x)| a * x)
                            .sum();
                    }
                }
            }
            Payload::Sparse { entries } => {
                for &(row, col, value) in entries {
                    let (row, col) = (row as usize, col as usize);
                    if row < ROWS_PER_BLOCK && col < input.len() {
                        out[row] += value * input[col];
                    }
                }
            }
        }
        out
    }
}

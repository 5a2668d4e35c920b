use alloc::vec;
use alloc::vec::Vec;

use crate::block::{Element, ROWS_PER_BLOCK};
use crate::error::{EngineError, Result};

/// Fixed-size iteration vector with a validity mask.
///
/// Filled progressively by commits; cleared after each drain.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationVector {
    values: Vec<Element>,
    valid: Vec<bool>,
    filled: usize,
}

impl IterationVector {
    pub fn new(dimension: usize) -> Self {
        Self {
            values: vec![0.0; dimension],
            valid: vec![false; dimension],
            filled: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Number of blocks needed to fill the vector.
    pub fn blocks(&self) -> usize {
        self.values.len() / ROWS_PER_BLOCK
    }

    /// Whether `block_id` maps inside the vector.
    pub fn accepts(&self, block_id: u8) -> bool {
        (block_id as usize) * ROWS_PER_BLOCK + 1 < self.values.len()
    }

    /// Write a block's two elements at `2*id` and `2*id+1` and mark them valid.
    pub fn write_block(&mut self, block_id: u8, data: [Element; ROWS_PER_BLOCK]) -> Result<()> {
        if !self.accepts(block_id) {
            return Err(EngineError::InvalidBlocks(format!(
                "block {block_id} outside vector of dimension {}",
                self.values.len()
            )));
        }
        let base = block_id as usize * ROWS_PER_BLOCK;
        for (offset, value) in data.into_iter().enumerate() {
            let i = base + offset;
            self.values[i] = value;
            if !self.valid[i] {
                self.valid[i] = true;
                self.filled += 1;
            }
        }
        Ok(())
    }

    pub fn is_valid(&self, i: usize) -> bool {
        self.valid.get(i).copied().unwrap_or(false)
    }

    pub fn block_committed(&self, block_id: u8) -> bool {
        self.is_valid(block_id as usize * ROWS_PER_BLOCK)
    }

    pub fn valid_count(&self) -> usize {
        self.filled
    }

    pub fn is_complete(&self) -> bool {
        !self.values.is_empty() && self.filled == self.values.len()
    }

    pub fn values(&self) -> &[Element] {
        &self.values
    }

    /// Max absolute value over valid entries.
    pub fn infinity_norm(&self) -> Element {
        self.values
            .iter()
            .zip(&self.valid)
            .filter(|(_, &ok)| ok)
            .fold(0.0, |acc: Element, (v, _)| acc.max(v.abs()))
    }

    /// Divide every valid entry by the infinity norm.
    ///
    /// A zero norm copies the vector unchanged. Returns `(vector, norm)`.
    pub fn normalized(&self) -> (Vec<Element>, Element) {
        let norm = self.infinity_norm();
        if norm == 0.0 {
            return (self.values.clone(), norm);
        }
        let out = self
            .values
            .iter()
            .zip(&self.valid)
            .map(|(&v, &ok)| if ok { v / norm } else { v })
            .collect();
        (out, norm)
    }

    /// Reset values and mask for the next iteration.
    pub fn clear(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0.0);
        self.valid.iter_mut().for_each(|v| *v = false);
        self.filled = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_and_complete() {
        let mut v = IterationVector::new(4);
        v.write_block(1, [3.0, -4.0]).unwrap();
        assert!(!v.is_complete());
        assert!(v.block_committed(1));
        assert!(!v.block_committed(0));
        v.write_block(0, [1.0, 2.0]).unwrap();
        assert!(v.is_complete());
        assert_eq!(v.values(), &[1.0, 2.0, 3.0, -4.0]);
    }

    #[test]
    fn test_rewrite_does_not_double_count() {
        let mut v = IterationVector::new(2);
        v.write_block(0, [1.0, 1.0]).unwrap();
        v.write_block(0, [2.0, 2.0]).unwrap();
        assert_eq!(v.valid_count(), 2);
        assert_eq!(v.values(), &[2.0, 2.0]);
    }

    #[test]
    fn test_out_of_range_block_rejected() {
        let mut v = IterationVector::new(4);
        assert!(v.write_block(2, [0.0, 0.0]).is_err());
    }

    #[test]
    fn test_normalize_by_infinity_norm() {
        let mut v = IterationVector::new(4);
        v.write_block(0, [2.0, -8.0]).unwrap();
        v.write_block(1, [4.0, 1.0]).unwrap();
        let (out, norm) = v.normalized();
        assert_eq!(norm, 8.0);
        assert_eq!(out, vec![0.25, -1.0, 0.5, 0.125]);
    }

    #[test]
    fn test_zero_norm_copies_unchanged() {
        let mut v = IterationVector::new(2);
        v.write_block(0, [0.0, -0.0]).unwrap();
        let (out, norm) = v.normalized();
        assert_eq!(norm, 0.0);
        assert_eq!(out, vec![0.0, 0.0]);
    }

    #[test]
    fn test_clear_resets_mask() {
        let mut v = IterationVector::new(2);
        v.write_block(0, [5.0, 6.0]).unwrap();
        v.clear();
        assert_eq!(v.valid_count(), 0);
        assert!(!v.is_valid(0));
        assert_eq!(v.infinity_norm(), 0.0);
    }
}

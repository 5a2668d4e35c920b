//! Synthetic workload: a non-negative sparse matrix with one boosted leading
//! row, partitioned into 2-row blocks, plus a compute unit that adds
//! per-block latency so lanes finish out of order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use blockeig_core::{Block, BlockMultiplier, BlockSource, ComputeUnit, Element, MatrixProfile, Payload};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::MatrixConfig;

/// Upper end of the random off-diagonal magnitudes.
const OFF_DIAGONAL_SCALE: f64 = 1.0;

/// Row-major sparse matrix with per-tick drift.
pub struct SyntheticMatrix {
    /// `(col, value)` per row, sorted by column.
    rows: Vec<Vec<(u32, Element)>>,
    config: MatrixConfig,
    rng: ChaCha8Rng,
    tick: u64,
}

impl SyntheticMatrix {
    pub fn new(config: MatrixConfig, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let n = config.size;
        let rows = (0..n)
            .map(|r| {
                (0..n)
                    .filter_map(|c| {
                        if c == r {
                            let boost = if r == 0 { config.diagonal_boost } else { 0.0 };
                            Some((c as u32, rng.gen_range(0.5..1.5) + boost))
                        } else if rng.gen_bool(config.density) {
                            Some((c as u32, rng.gen_range(0.0..OFF_DIAGONAL_SCALE)))
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .collect();

        Self {
            rows,
            config,
            rng,
            tick: 0,
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn stored(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    /// Perturb every stored entry by up to `±drift` (relative), keeping it
    /// non-negative.
    pub fn drift(&mut self) {
        let drift = self.config.drift;
        self.tick += 1;
        if drift == 0.0 {
            return;
        }
        for row in &mut self.rows {
            for (_, value) in row.iter_mut() {
                let factor = 1.0 + self.rng.gen_range(-drift..=drift);
                *value = (*value * factor).max(0.0);
            }
        }
    }

    /// Plain sequential power iteration, used to cross-check the lanes.
    pub fn reference_eigenvalue(&self, iterations: usize) -> Element {
        let mut v = vec![1.0; self.rows.len()];
        let mut norm = 0.0;
        for _ in 0..iterations {
            let y: Vec<Element> = self
                .rows
                .iter()
                .map(|row| row.iter().map(|&(c, a)| a * v[c as usize]).sum())
                .collect();
            norm = y.iter().fold(0.0, |m: Element, x| m.max(x.abs()));
            if norm == 0.0 {
                break;
            }
            v = y.iter().map(|x| x / norm).collect();
        }
        norm
    }

    fn block(&self, id: usize) -> Block {
        let n = self.rows.len();
        let pair = [&self.rows[2 * id], &self.rows[2 * id + 1]];
        let stored = pair[0].len() + pair[1].len();
        let size = stored.div_ceil(16).min(u8::MAX as usize) as u8;

        let payload = if stored as f64 > self.config.dense_cutoff * (2 * n) as f64 {
            let mut values = vec![0.0; 2 * n];
            for (k, row) in pair.iter().enumerate() {
                for &(c, a) in row.iter() {
                    values[k * n + c as usize] = a;
                }
            }
            Payload::Dense { cols: n, values }
        } else {
            let entries = pair
                .iter()
                .enumerate()
                .flat_map(|(k, row)| row.iter().map(move |&(c, a)| (k as u8, c, a)))
                .collect();
            Payload::Sparse { entries }
        };

        Block::new(id as u8, size, payload, true)
    }
}

impl BlockSource for SyntheticMatrix {
    fn dimension(&self) -> usize {
        self.rows.len()
    }

    fn profile(&self) -> MatrixProfile {
        let n = self.rows.len();
        let total = (n * n).max(1);
        let sparsity = 100 - (self.stored() * 100 / total).min(100);

        // Coarse conditioning: log2 of the diagonal spread.
        let diag: Vec<Element> = self
            .rows
            .iter()
            .enumerate()
            .filter_map(|(r, row)| row.iter().find(|(c, _)| *c as usize == r).map(|&(_, a)| a))
            .collect();
        let max = diag.iter().copied().fold(0.0, Element::max);
        let min = diag.iter().copied().fold(Element::INFINITY, Element::min);
        let condition = if min > 0.0 && min.is_finite() {
            (max / min).log2().ceil().clamp(0.0, 15.0) as u8
        } else {
            15
        };

        MatrixProfile::new(sparsity as u8, condition)
    }

    fn produce_blocks(&mut self, _iteration: u8) -> Vec<Block> {
        (0..self.rows.len() / 2).map(|b| self.block(b)).collect()
    }
}

/// Multiplier that sleeps a pseudo-random time before computing.
#[derive(Debug, Default)]
pub struct JitterUnit {
    max_us: u64,
    calls: AtomicU64,
}

impl JitterUnit {
    pub fn new(max_us: u64) -> Self {
        Self {
            max_us,
            calls: AtomicU64::new(0),
        }
    }

    fn delay(&self, block_id: u8) -> Duration {
        if self.max_us == 0 {
            return Duration::ZERO;
        }
        let n = self.calls.fetch_add(1, Ordering::Relaxed);
        let mix = (block_id as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ n.wrapping_mul(31);
        Duration::from_micros(mix % (self.max_us + 1))
    }
}

impl ComputeUnit for JitterUnit {
    fn multiply(&self, block: &Block, input: &[Element]) -> [Element; 2] {
        let delay = self.delay(block.id);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        BlockMultiplier.multiply(block, input)
    }
}

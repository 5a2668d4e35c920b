/// Depth of every controller history ring.
pub const HISTORY_DEPTH: usize = 16;

/// Fixed-depth ring of recent samples; the oldest is overwritten on wraparound.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRing {
    values: [f64; HISTORY_DEPTH],
    /// Next write position
    idx: usize,
    /// Samples held, saturating at `HISTORY_DEPTH`
    count: usize,
}

impl Default for HistoryRing {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryRing {
    pub fn new() -> Self {
        Self {
            values: [0.0; HISTORY_DEPTH],
            idx: 0,
            count: 0,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.values[self.idx] = value;
        self.idx = (self.idx + 1) % HISTORY_DEPTH;
        self.count = (self.count + 1).min(HISTORY_DEPTH);
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// `n`-th newest sample (0 = latest).
    pub fn newest(&self, n: usize) -> Option<f64> {
        if n >= self.count {
            return None;
        }
        let pos = (self.idx + HISTORY_DEPTH - 1 - n) % HISTORY_DEPTH;
        Some(self.values[pos])
    }

    pub fn latest(&self) -> Option<f64> {
        self.newest(0)
    }

    /// Samples from newest to oldest.
    pub fn iter_newest(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.count).filter_map(move |n| self.newest(n))
    }

    /// Mean of up to `n` newest samples; 0 when empty.
    pub fn mean_recent(&self, n: usize) -> f64 {
        let take = n.min(self.count);
        if take == 0 {
            return 0.0;
        }
        self.iter_newest().take(take).sum::<f64>() / take as f64
    }

    /// Population variance over the ring; 0 with fewer than two samples.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let mean = self.mean_recent(self.count);
        self.iter_newest()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / self.count as f64
    }

    /// Largest absolute change between consecutive samples.
    pub fn max_step(&self) -> f64 {
        let newest: alloc::vec::Vec<f64> = self.iter_newest().collect();
        newest
            .windows(2)
            .map(|w| (w[0] - w[1]).abs())
            .fold(0.0, f64::max)
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraparound_overwrites_oldest() {
        let mut ring = HistoryRing::new();
        for i in 0..(HISTORY_DEPTH + 3) {
            ring.push(i as f64);
        }
        assert_eq!(ring.len(), HISTORY_DEPTH);
        assert_eq!(ring.latest(), Some((HISTORY_DEPTH + 2) as f64));
        assert_eq!(ring.newest(HISTORY_DEPTH - 1), Some(3.0), "oldest kept sample");
        assert_eq!(ring.newest(HISTORY_DEPTH), None);
    }

    #[test]
    fn test_mean_recent() {
        let mut ring = HistoryRing::new();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            ring.push(v);
        }
        assert_eq!(ring.mean_recent(4), 3.5);
        assert_eq!(ring.mean_recent(100), 3.0);
        assert_eq!(HistoryRing::new().mean_recent(4), 0.0);
    }

    #[test]
    fn test_variance_and_max_step() {
        let mut ring = HistoryRing::new();
        for v in [10.0, 12.0, 10.0, 20.0] {
            ring.push(v);
        }
        assert!((ring.variance() - 17.0).abs() < 1e-12);
        assert_eq!(ring.max_step(), 10.0);
    }

    #[test]
    fn test_single_sample_is_stable() {
        let mut ring = HistoryRing::new();
        ring.push(42.0);
        assert_eq!(ring.variance(), 0.0);
        assert_eq!(ring.max_step(), 0.0);
    }
}

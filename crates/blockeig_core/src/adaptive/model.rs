//! EWMA smoothing and the 4x4 linear predictor.
//!
//! ```text
//!   features                         outputs
//!   [ewma_iterations ]    W (4x4)    [predicted_iterations]
//!   [ewma_error      ] ──► + b  ───► [threshold_score     ]
//!   [sparsity / 100  ]               [mode_score          ]
//!   [condition / 10  ]               [aggressiveness_score]
//! ```
//!
//! Training is one gradient step per adaptation:
//! `w -= lr * err * feature`, `b -= lr * err`, with weights clamped to
//! `[-WEIGHT_LIMIT, WEIGHT_LIMIT]`.

/// EWMA blend factor applied to the newest batch average.
pub const EWMA_ALPHA: f64 = 0.125;

/// Samples averaged into each EWMA update.
pub const EWMA_BATCH: usize = 4;

pub const FEATURES: usize = 4;

pub const OUTPUTS: usize = 4;

pub const WEIGHT_LIMIT: f64 = 4.0;

/// Exponentially weighted moving average. The first update seeds the value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Ewma {
    value: f64,
    primed: bool,
}

impl Ewma {
    pub fn new() -> Self {
        Self::default()
    }

    /// `ewma' = α·batch_avg + (1-α)·ewma`
    pub fn update(&mut self, batch_avg: f64) -> f64 {
        if self.primed {
            self.value = EWMA_ALPHA * batch_avg + (1.0 - EWMA_ALPHA) * self.value;
        } else {
            self.value = batch_avg;
            self.primed = true;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Linear model mapping controller features to policy scores.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearPredictor {
    /// `weights[output][feature]`
    weights: [[f64; FEATURES]; OUTPUTS],
    bias: [f64; OUTPUTS],
}

impl Default for LinearPredictor {
    fn default() -> Self {
        Self::identity()
    }
}

impl LinearPredictor {
    /// Identity weights, zero bias.
    pub fn identity() -> Self {
        let mut weights = [[0.0; FEATURES]; OUTPUTS];
        for (i, row) in weights.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self {
            weights,
            bias: [0.0; OUTPUTS],
        }
    }

    pub fn weights(&self) -> &[[f64; FEATURES]; OUTPUTS] {
        &self.weights
    }

    pub fn bias(&self) -> &[f64; OUTPUTS] {
        &self.bias
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    pub fn predict(&self, features: &[f64; FEATURES]) -> [f64; OUTPUTS] {
        let mut out = self.bias;
        for (o, row) in self.weights.iter().enumerate() {
            out[o] += row.iter().zip(features).map(|(w, x)| w * x).sum::<f64>();
        }
        out
    }

    /// One gradient step toward `targets`. Returns the pre-step errors
    /// (`prediction - target`).
    pub fn train(
        &mut self,
        features: &[f64; FEATURES],
        targets: &[f64; OUTPUTS],
        learning_rate: f64,
    ) -> [f64; OUTPUTS] {
        let predicted = self.predict(features);
        let mut errors = [0.0; OUTPUTS];
        for o in 0..OUTPUTS {
            let err = predicted[o] - targets[o];
            if !err.is_finite() {
                continue;
            }
            errors[o] = err;
            for (w, x) in self.weights[o].iter_mut().zip(features) {
                *w = (*w - learning_rate * err * x).clamp(-WEIGHT_LIMIT, WEIGHT_LIMIT);
            }
            self.bias[o] -= learning_rate * err;
        }
        errors
    }

    pub fn reset(&mut self) {
        *self = Self::identity();
    }
}

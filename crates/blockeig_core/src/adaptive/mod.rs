//! Adaptive convergence control: history rings, EWMA + linear predictor,
//! and the controller that turns them into a solver policy.

pub mod controller;
pub mod history;
pub mod model;

pub use controller::{
    aggressiveness_for, compute_threshold, AdaptiveController, ConfidenceTier, ControllerPhase,
    ControllerStats, IterationLimitMode, Observation, Policy, Trend, THRESHOLD_MAX, THRESHOLD_MIN,
};
pub use history::{HistoryRing, HISTORY_DEPTH};
pub use model::{Ewma, LinearPredictor};

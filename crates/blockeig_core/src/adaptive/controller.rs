//! Adaptive convergence controller.
//!
//! Runs once per completed iteration and recomputes the solver policy:
//!
//! ```text
//!  Idle ─► Collect ─► Train ─► Predict ─► Adjust ─► Evaluate ─► Update ─► Idle
//!           error +   error +   forward    threshold  trend       lr tier,
//!           workload  workload  + conf.    mode, cap              clamp
//!           rings     EWMAs
//! ```
//!
//! The iteration-count side learns once per solve. `record_solve` pushes the
//! realized count into its ring and EWMA, takes one gradient step toward it
//! and grades the prediction made when the solve started; accuracy then
//! scales the learning rate and may reset a diverged model.
//!
//! Aborted iterations never reach `adapt`, so partial data cannot leak into
//! the EWMAs or history.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::history::HistoryRing;
use super::model::{Ewma, LinearPredictor, EWMA_BATCH, FEATURES};
use crate::block::MatrixProfile;
use crate::config::EngineConfig;
use crate::error::EngineError;

// ============================================================================
// Constants
// ============================================================================

pub const THRESHOLD_MIN: f64 = 1e-6;
pub const THRESHOLD_MAX: f64 = 1e-2;

/// Condition estimates above this tighten the threshold.
pub const ILL_CONDITIONED: u8 = 10;

/// A prediction within this many iterations counts as correct.
pub const PREDICTION_TOLERANCE: f64 = 5.0;

pub const ACCURACY_HIGH_WATER: f64 = 0.8;
pub const ACCURACY_LOW_WATER: f64 = 0.4;

/// Divergence: accuracy below this after `DIVERGENCE_MIN_PREDICTIONS`.
pub const DIVERGENCE_ACCURACY: f64 = 0.3;
pub const DIVERGENCE_MIN_PREDICTIONS: u64 = 50;
/// Divergence: accuracy below this after `STALE_MODEL_ADAPTATIONS`.
pub const STALE_MODEL_ACCURACY: f64 = 0.5;
pub const STALE_MODEL_ADAPTATIONS: u64 = 1000;

/// Floor of the iteration cap.
pub const MIN_ITERATION_CAP: u32 = 16;

pub const MAX_AGGRESSIVENESS: u8 = 15;

// ============================================================================
// Policy types
// ============================================================================

/// How tightly the iteration cap follows the predicted iteration count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IterationLimitMode {
    /// 3x predicted.
    Loose,
    /// 2x predicted.
    Medium,
    /// 1.5x predicted.
    Strict,
}

impl IterationLimitMode {
    pub fn from_prediction(predicted_iterations: f64) -> Self {
        if predicted_iterations < 20.0 {
            IterationLimitMode::Loose
        } else if predicted_iterations < 50.0 {
            IterationLimitMode::Medium
        } else {
            IterationLimitMode::Strict
        }
    }

    pub fn loosen(self) -> Self {
        match self {
            IterationLimitMode::Strict => IterationLimitMode::Medium,
            _ => IterationLimitMode::Loose,
        }
    }

    pub fn tighten(self) -> Self {
        match self {
            IterationLimitMode::Loose => IterationLimitMode::Medium,
            _ => IterationLimitMode::Strict,
        }
    }

    pub fn cap_factor(self) -> f64 {
        match self {
            IterationLimitMode::Loose => 3.0,
            IterationLimitMode::Medium => 2.0,
            IterationLimitMode::Strict => 1.5,
        }
    }

    /// Training target for the mode output.
    pub fn score(self) -> f64 {
        match self {
            IterationLimitMode::Loose => 0.0,
            IterationLimitMode::Medium => 0.5,
            IterationLimitMode::Strict => 1.0,
        }
    }
}

/// Direction of the last two error reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Trend {
    Accelerating,
    Decelerating,
    Oscillating,
    #[default]
    Stable,
}

impl Trend {
    /// Classify from the error history using `d_k = e_{k-1} - e_k`.
    pub fn classify(errors: &HistoryRing) -> Self {
        let (Some(e0), Some(e1), Some(e2)) = (errors.newest(0), errors.newest(1), errors.newest(2))
        else {
            return Trend::Stable;
        };
        let latest = e1 - e0;
        let before = e2 - e1;
        if latest > 0.0 && before > 0.0 {
            Trend::Accelerating
        } else if latest < 0.0 && before < 0.0 {
            Trend::Decelerating
        } else if latest * before < 0.0 {
            Trend::Oscillating
        } else {
            Trend::Stable
        }
    }

    pub fn threshold_factor(self) -> f64 {
        match self {
            Trend::Accelerating => 0.9,
            Trend::Decelerating => 1.3,
            Trend::Oscillating => 1.5,
            Trend::Stable => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    pub fn from_score(confidence: f64) -> Self {
        if confidence >= 70.0 {
            ConfidenceTier::High
        } else if confidence >= 40.0 {
            ConfidenceTier::Medium
        } else {
            ConfidenceTier::Low
        }
    }

    pub fn learning_rate_factor(self) -> f64 {
        match self {
            ConfidenceTier::High => 1.0,
            ConfidenceTier::Medium => 0.8,
            ConfidenceTier::Low => 0.4,
        }
    }
}

/// Solver policy published after every adaptation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Convergence threshold on the max element-wise error.
    pub threshold: f64,
    pub iteration_limit_mode: IterationLimitMode,
    pub iteration_cap: u32,
    /// 0..=15; sets scheduling cycles per coordinator step.
    pub aggressiveness: u8,
    pub learning_rate: f64,
    pub predicted_iterations: f64,
    /// 0..=100
    pub confidence: f64,
}

impl Policy {
    fn initial(config: &EngineConfig) -> Self {
        Self {
            threshold: config.base_threshold.clamp(THRESHOLD_MIN, THRESHOLD_MAX),
            iteration_limit_mode: IterationLimitMode::Medium,
            iteration_cap: config.max_iterations,
            aggressiveness: 3,
            learning_rate: config.base_learning_rate,
            predicted_iterations: 0.0,
            confidence: 100.0,
        }
    }

    /// Scheduling cycles the coordinator runs per decision step.
    pub fn scheduling_cycles(&self) -> usize {
        1 + self.aggressiveness as usize / 4
    }
}

/// What the coordinator reports after a completed iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Iterations executed so far in the current solve; 1 starts a new solve.
    pub iterations: u32,
    pub max_error: f64,
    pub profile: MatrixProfile,
    /// Average queue depth, 0..=15.
    pub workload: u8,
    pub congested: bool,
    /// More than 80% of the deadline has elapsed.
    pub deadline_approaching: bool,
}

// ============================================================================
// Phase machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerPhase {
    #[default]
    Idle,
    Collect,
    Train,
    Predict,
    Adjust,
    Evaluate,
    Update,
}

impl ControllerPhase {
    pub fn next(self) -> Self {
        match self {
            ControllerPhase::Idle => ControllerPhase::Collect,
            ControllerPhase::Collect => ControllerPhase::Train,
            ControllerPhase::Train => ControllerPhase::Predict,
            ControllerPhase::Predict => ControllerPhase::Adjust,
            ControllerPhase::Adjust => ControllerPhase::Evaluate,
            ControllerPhase::Evaluate => ControllerPhase::Update,
            ControllerPhase::Update => ControllerPhase::Idle,
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
struct SolveStart {
    features: [f64; FEATURES],
    predicted: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ControllerStats {
    pub adaptations: u64,
    pub predictions: u64,
    pub correct_predictions: u64,
    pub model_resets: u64,
    pub learning_rate_increases: u64,
    pub learning_rate_decreases: u64,
    /// Aborted iterations whose data was dropped.
    pub discarded: u64,
    pub trend: Trend,
}

impl ControllerStats {
    /// `successes / total`, or 0 before the first evaluation.
    pub fn accuracy(&self) -> f64 {
        if self.predictions == 0 {
            0.0
        } else {
            self.correct_predictions as f64 / self.predictions as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveController {
    base_threshold: f64,
    base_learning_rate: f64,
    max_iterations: u32,

    iterations: HistoryRing,
    errors: HistoryRing,
    workloads: HistoryRing,

    ewma_iterations: Ewma,
    ewma_error: Ewma,
    ewma_workload: Ewma,

    model: LinearPredictor,
    /// Accuracy-scaled rate before the confidence tier is applied.
    learning_rate: f64,
    /// Model adaptations since the last reset.
    adaptation_count: u64,
    /// Features and prediction taken at the first iteration of the running solve.
    solve_start: Option<SolveStart>,

    policy: Policy,
    initial_policy: Policy,
    phase: ControllerPhase,
    stats: ControllerStats,
}

impl AdaptiveController {
    pub fn new(config: &EngineConfig) -> Self {
        let policy = Policy::initial(config);
        Self {
            base_threshold: config.base_threshold,
            base_learning_rate: config.base_learning_rate,
            max_iterations: config.max_iterations,
            iterations: HistoryRing::new(),
            errors: HistoryRing::new(),
            workloads: HistoryRing::new(),
            ewma_iterations: Ewma::new(),
            ewma_error: Ewma::new(),
            ewma_workload: Ewma::new(),
            model: LinearPredictor::identity(),
            learning_rate: config.base_learning_rate,
            adaptation_count: 0,
            solve_start: None,
            policy,
            initial_policy: policy,
            phase: ControllerPhase::Idle,
            stats: ControllerStats::default(),
        }
    }

    pub fn current_policy(&self) -> Policy {
        self.policy
    }

    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats
    }

    pub fn model(&self) -> &LinearPredictor {
        &self.model
    }

    pub fn ewma_iterations(&self) -> f64 {
        self.ewma_iterations.value()
    }

    pub fn ewma_error(&self) -> f64 {
        self.ewma_error.value()
    }

    pub fn ewma_workload(&self) -> f64 {
        self.ewma_workload.value()
    }

    fn step(&mut self) {
        self.phase = self.phase.next();
    }

    /// Run one full adaptation cycle and publish the new policy.
    ///
    /// Called after every completed iteration. The iteration-count model is
    /// only trained by [`record_solve`](Self::record_solve); here it is read.
    pub fn adapt(&mut self, obs: &Observation) -> Policy {
        // ---- Collect ----
        self.step();
        self.errors.push(obs.max_error);
        self.workloads.push(obs.workload as f64);

        // ---- Train ----
        self.step();
        self.ewma_error.update(self.errors.mean_recent(EWMA_BATCH));
        self.ewma_workload
            .update(self.workloads.mean_recent(EWMA_BATCH));
        self.adaptation_count += 1;
        self.stats.adaptations += 1;

        // ---- Predict ----
        self.step();
        let features = self.features(&obs.profile);
        let outputs = self.model.predict(&features);
        // A negative or non-finite output falls back to the smoothed count.
        let predicted = if outputs[0].is_finite() && outputs[0] >= 0.0 {
            outputs[0]
        } else {
            self.ewma_iterations.value()
        };
        let confidence = self.confidence();
        if obs.iterations <= 1 || self.solve_start.is_none() {
            self.solve_start = Some(SolveStart { features, predicted });
        }

        // ---- Adjust ----
        self.step();
        let trend = Trend::classify(&self.errors);
        let threshold = compute_threshold(self.base_threshold, &obs.profile, trend, obs.workload);
        let mut mode = IterationLimitMode::from_prediction(predicted);
        if obs.congested {
            mode = mode.loosen();
        }
        if obs.deadline_approaching {
            mode = mode.tighten();
        }
        // No finished solve yet: the prediction means nothing, keep the ceiling.
        let iteration_cap = if self.iterations.is_empty() {
            self.max_iterations.max(1)
        } else {
            self.iteration_cap(mode, predicted)
        };
        let tier = ConfidenceTier::from_score(confidence);
        let aggressiveness = aggressiveness_for(self.ewma_iterations.value(), obs.workload);

        // ---- Evaluate ----
        self.step();
        self.stats.trend = trend;

        // ---- Update ----
        self.step();
        let learning_rate =
            self.clamp_learning_rate(self.learning_rate * tier.learning_rate_factor());
        self.policy = Policy {
            threshold,
            iteration_limit_mode: mode,
            iteration_cap,
            aggressiveness,
            learning_rate,
            predicted_iterations: predicted,
            confidence,
        };
        self.step();
        debug!(
            "policy: threshold {:e}, mode {:?}, cap {}, aggressiveness {}, confidence {:.0}",
            threshold, mode, iteration_cap, aggressiveness, confidence
        );
        self.policy
    }

    /// Fold a finished solve into the model, converged or stopped at the cap.
    ///
    /// `iterations` is the realized count. It enters the iteration history,
    /// trains the predictor on the features seen when the solve started and
    /// grades the prediction made at that point.
    pub fn record_solve(&mut self, iterations: u32) {
        let realized = iterations as f64;
        self.iterations.push(realized);
        self.ewma_iterations
            .update(self.iterations.mean_recent(EWMA_BATCH));

        let Some(start) = self.solve_start.take() else {
            return;
        };
        let targets = [
            realized,
            self.errors.latest().unwrap_or(0.0),
            self.policy.iteration_limit_mode.score(),
            self.policy.aggressiveness as f64 / MAX_AGGRESSIVENESS as f64,
        ];
        self.model
            .train(&start.features, &targets, self.policy.learning_rate);

        self.stats.predictions += 1;
        let correct = (start.predicted - realized).abs() <= PREDICTION_TOLERANCE;
        if correct {
            self.stats.correct_predictions += 1;
        }
        debug!(
            "solve took {iterations} iterations, predicted {:.1} ({})",
            start.predicted,
            if correct { "hit" } else { "miss" }
        );

        self.update_learning_rate();
        self.check_divergence();
    }

    fn features(&self, profile: &MatrixProfile) -> [f64; FEATURES] {
        [
            self.ewma_iterations.value(),
            self.ewma_error.value(),
            profile.sparsity as f64 / 100.0,
            profile.condition as f64 / 10.0,
        ]
    }

    /// `100 - min(variance, 60) - min(4 * max_step, 40)`, clamped to `[0, 100]`.
    fn confidence(&self) -> f64 {
        let variance = self.iterations.variance().min(60.0);
        let instability = (4.0 * self.iterations.max_step()).min(40.0);
        (100.0 - variance - instability).clamp(0.0, 100.0)
    }

    fn iteration_cap(&self, mode: IterationLimitMode, predicted: f64) -> u32 {
        let raw = (mode.cap_factor() * predicted).ceil();
        let cap = if raw.is_finite() && raw > 0.0 {
            raw.min(u32::MAX as f64) as u32
        } else {
            0
        };
        cap.max(MIN_ITERATION_CAP).min(self.max_iterations.max(1))
    }

    fn update_learning_rate(&mut self) {
        if self.stats.predictions == 0 {
            return;
        }
        let accuracy = self.stats.accuracy();
        if accuracy > ACCURACY_HIGH_WATER {
            self.learning_rate *= 1.3;
            self.stats.learning_rate_increases += 1;
        } else if accuracy < ACCURACY_LOW_WATER {
            self.learning_rate *= 0.7;
            self.stats.learning_rate_decreases += 1;
        }
        self.learning_rate = self.clamp_learning_rate(self.learning_rate);
    }

    fn clamp_learning_rate(&self, rate: f64) -> f64 {
        rate.clamp(self.base_learning_rate / 4.0, self.base_learning_rate * 2.0)
    }

    fn check_divergence(&mut self) {
        let accuracy = self.stats.accuracy();
        let collapsed =
            accuracy < DIVERGENCE_ACCURACY && self.stats.predictions > DIVERGENCE_MIN_PREDICTIONS;
        let stale =
            self.adaptation_count > STALE_MODEL_ADAPTATIONS && accuracy < STALE_MODEL_ACCURACY;
        if !(collapsed || stale) {
            return;
        }
        warn!("{}", EngineError::PredictorDivergence { accuracy });
        self.model.reset();
        self.adaptation_count = 0;
        self.stats.predictions = 0;
        self.stats.correct_predictions = 0;
        self.stats.model_resets += 1;
    }

    /// Record an aborted iteration. Nothing from it enters the history.
    pub fn discard_iteration(&mut self, iteration: u8) {
        self.stats.discarded += 1;
        // An abort ends the solve; it is never graded.
        self.solve_start = None;
        self.phase = ControllerPhase::Idle;
        debug!("iteration {iteration} discarded, policy unchanged");
    }

    /// Restore the initial model, history and policy.
    pub fn reset(&mut self) {
        let resets = self.stats.model_resets;
        self.iterations.clear();
        self.errors.clear();
        self.workloads.clear();
        self.ewma_iterations.reset();
        self.ewma_error.reset();
        self.ewma_workload.reset();
        self.model.reset();
        self.learning_rate = self.base_learning_rate;
        self.adaptation_count = 0;
        self.solve_start = None;
        self.policy = self.initial_policy;
        self.phase = ControllerPhase::Idle;
        self.stats = ControllerStats {
            model_resets: resets,
            ..ControllerStats::default()
        };
    }
}

/// Threshold from independent multiplicative factors, clamped to
/// `[THRESHOLD_MIN, THRESHOLD_MAX]`.
pub fn compute_threshold(base: f64, profile: &MatrixProfile, trend: Trend, workload: u8) -> f64 {
    let sparsity = 1.0 - profile.sparsity.min(100) as f64 * 0.01;
    let conditioning = if profile.condition > ILL_CONDITIONED {
        0.8
    } else {
        1.0
    };
    let load = 1.0 + workload as f64 * 0.01;
    let raw = base * sparsity * conditioning * trend.threshold_factor() * load;
    if raw.is_nan() {
        return THRESHOLD_MIN;
    }
    raw.clamp(THRESHOLD_MIN, THRESHOLD_MAX)
}

/// Fast convergence → low aggressiveness, slow → high.
pub fn aggressiveness_for(ewma_iterations: f64, workload: u8) -> u8 {
    let base: u8 = if ewma_iterations < 20.0 {
        3
    } else if ewma_iterations < 50.0 {
        8
    } else {
        13
    };
    let boost = if workload > 10 { 2 } else { 0 };
    (base + boost).min(MAX_AGGRESSIVENESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(iterations: u32, max_error: f64) -> Observation {
        Observation {
            iterations,
            max_error,
            profile: MatrixProfile::new(50, 5),
            workload: 2,
            congested: false,
            deadline_approaching: false,
        }
    }

    fn controller() -> AdaptiveController {
        AdaptiveController::new(&EngineConfig::default())
    }

    #[test]
    fn test_phase_cycle_returns_to_idle() {
        let mut phase = ControllerPhase::Idle;
        for _ in 0..7 {
            phase = phase.next();
        }
        assert_eq!(phase, ControllerPhase::Idle);

        let mut ctl = controller();
        ctl.adapt(&obs(1, 0.5));
        assert_eq!(ctl.phase(), ControllerPhase::Idle);
    }

    #[test]
    fn test_trend_classification() {
        let mut ring = HistoryRing::new();
        for e in [0.4, 0.2, 0.1] {
            ring.push(e);
        }
        assert_eq!(Trend::classify(&ring), Trend::Accelerating);

        let mut ring = HistoryRing::new();
        for e in [0.1, 0.2, 0.4] {
            ring.push(e);
        }
        assert_eq!(Trend::classify(&ring), Trend::Decelerating);

        let mut ring = HistoryRing::new();
        for e in [0.1, 0.3, 0.2] {
            ring.push(e);
        }
        assert_eq!(Trend::classify(&ring), Trend::Oscillating);

        let mut ring = HistoryRing::new();
        for e in [0.1, 0.1, 0.1] {
            ring.push(e);
        }
        assert_eq!(Trend::classify(&ring), Trend::Stable);
    }

    #[test]
    fn test_threshold_factors() {
        let plain = compute_threshold(1e-4, &MatrixProfile::new(0, 0), Trend::Stable, 0);
        assert!((plain - 1e-4).abs() < 1e-18);

        let t = compute_threshold(1e-4, &MatrixProfile::new(50, 12), Trend::Decelerating, 10);
        let expected = 1e-4 * 0.5 * 0.8 * 1.3 * 1.1;
        assert!((t - expected).abs() < 1e-15, "{t} vs {expected}");
    }

    #[test]
    fn test_threshold_clamped() {
        let low = compute_threshold(1e-4, &MatrixProfile::new(100, 15), Trend::Accelerating, 0);
        assert_eq!(low, THRESHOLD_MIN);
        let high = compute_threshold(1.0, &MatrixProfile::new(0, 0), Trend::Oscillating, 15);
        assert_eq!(high, THRESHOLD_MAX);
    }

    #[test]
    fn test_mode_from_prediction_with_adjustments() {
        assert_eq!(IterationLimitMode::from_prediction(10.0), IterationLimitMode::Loose);
        assert_eq!(IterationLimitMode::from_prediction(30.0), IterationLimitMode::Medium);
        assert_eq!(IterationLimitMode::from_prediction(80.0), IterationLimitMode::Strict);
        assert_eq!(IterationLimitMode::Strict.loosen(), IterationLimitMode::Medium);
        assert_eq!(IterationLimitMode::Loose.tighten(), IterationLimitMode::Medium);
        assert_eq!(IterationLimitMode::Loose.loosen(), IterationLimitMode::Loose);
    }

    #[test]
    fn test_aggressiveness_from_convergence_speed() {
        assert_eq!(aggressiveness_for(5.0, 0), 3);
        assert_eq!(aggressiveness_for(30.0, 0), 8);
        assert_eq!(aggressiveness_for(90.0, 0), 13);
        assert_eq!(aggressiveness_for(90.0, 12), 15);
    }

    #[test]
    fn test_confidence_tiers() {
        assert_eq!(ConfidenceTier::from_score(85.0), ConfidenceTier::High);
        assert_eq!(ConfidenceTier::from_score(50.0), ConfidenceTier::Medium);
        assert_eq!(ConfidenceTier::from_score(10.0), ConfidenceTier::Low);
    }

    /// One solve of `iterations` steps, adapting after each as the
    /// coordinator does.
    fn run_solve(ctl: &mut AdaptiveController, iterations: u32) -> Policy {
        let mut policy = ctl.current_policy();
        for k in 1..=iterations {
            policy = ctl.adapt(&obs(k, 0.5 / k as f64));
        }
        ctl.record_solve(iterations);
        policy
    }

    #[test]
    fn test_unstable_history_lowers_confidence() {
        let mut steady = controller();
        let mut jumpy = controller();
        for i in 0..8 {
            run_solve(&mut steady, 10);
            run_solve(&mut jumpy, if i % 2 == 0 { 2 } else { 40 });
        }
        let a = steady.adapt(&obs(1, 0.1));
        let b = jumpy.adapt(&obs(1, 0.1));
        assert_eq!(a.confidence, 100.0);
        assert!(b.confidence < 40.0, "jumpy confidence {}", b.confidence);
        assert!(b.learning_rate < a.learning_rate);
    }

    #[test]
    fn test_published_learning_rate_stays_in_bounds() {
        // Low confidence (x0.4) on top of an accuracy-starved rate.
        let mut ctl = controller();
        let base = EngineConfig::default().base_learning_rate;
        for i in 0..40 {
            let p = run_solve(&mut ctl, if i % 2 == 0 { 2 } else { 40 });
            assert!(p.learning_rate >= base / 4.0 - 1e-18, "{}", p.learning_rate);
            assert!(p.learning_rate <= base * 2.0 + 1e-18, "{}", p.learning_rate);
        }
        assert!(ctl.stats().accuracy() < ACCURACY_LOW_WATER);
        let p = ctl.adapt(&obs(1, 0.1));
        assert_eq!(ConfidenceTier::from_score(p.confidence), ConfidenceTier::Low);
        assert!((p.learning_rate - base / 4.0).abs() < 1e-18, "{}", p.learning_rate);
    }

    #[test]
    fn test_iteration_cap_bounds() {
        let ctl = controller();
        assert_eq!(ctl.iteration_cap(IterationLimitMode::Loose, 2.0), MIN_ITERATION_CAP);
        assert_eq!(ctl.iteration_cap(IterationLimitMode::Medium, 30.0), 60);
        assert_eq!(ctl.iteration_cap(IterationLimitMode::Strict, 1e6), 500);
    }

    #[test]
    fn test_congestion_loosens_deadline_tightens() {
        let mut ctl = controller();
        ctl.record_solve(30);
        let mut o = obs(1, 0.1);
        o.congested = true;
        let p = ctl.adapt(&o);
        assert_eq!(p.iteration_limit_mode, IterationLimitMode::Loose);

        let mut ctl = controller();
        ctl.record_solve(30);
        let mut o = obs(1, 0.1);
        o.deadline_approaching = true;
        let p = ctl.adapt(&o);
        assert_eq!(p.iteration_limit_mode, IterationLimitMode::Strict);
    }

    #[test]
    fn test_first_solve_runs_to_the_ceiling() {
        let mut ctl = controller();
        let p = ctl.adapt(&obs(1, 0.5));
        assert_eq!(p.iteration_cap, EngineConfig::default().max_iterations);
    }

    #[test]
    fn test_repeated_solves_predict_their_length() {
        let mut ctl = controller();
        for _ in 0..5 {
            run_solve(&mut ctl, 30);
        }
        for _ in 0..60 {
            run_solve(&mut ctl, 30);
        }
        let stats = ctl.stats();
        assert_eq!(stats.predictions, 65);
        // Only the first solve, predicted with no history, misses.
        assert_eq!(stats.correct_predictions, 64);
        assert!(stats.accuracy() > ACCURACY_HIGH_WATER);
        assert_eq!(stats.model_resets, 0);
        assert!(stats.learning_rate_increases > 0);

        let p = ctl.adapt(&obs(1, 0.5));
        assert!((p.predicted_iterations - 30.0).abs() <= PREDICTION_TOLERANCE);
        assert_eq!(p.iteration_limit_mode, IterationLimitMode::Medium);
        assert!((58..=62).contains(&p.iteration_cap), "{}", p.iteration_cap);
        let base = EngineConfig::default().base_learning_rate;
        assert!(p.learning_rate <= base * 2.0);
    }

    #[test]
    fn test_divergence_resets_model() {
        // 20 correct out of 80 predictions: 25% accuracy with more than 50
        // predictions triggers the reset on the next update.
        let mut ctl = controller();
        ctl.model.train(&[1.0; 4], &[9.0; 4], 0.1);
        assert!(!ctl.model().is_identity());
        ctl.stats.predictions = 80;
        ctl.stats.correct_predictions = 20;
        ctl.adaptation_count = 80;

        ctl.check_divergence();
        assert!(ctl.model().is_identity());
        assert_eq!(ctl.adaptation_count, 0);
        assert_eq!(ctl.stats().predictions, 0);
        assert_eq!(ctl.stats().model_resets, 1);
    }

    #[test]
    fn test_no_reset_with_few_predictions() {
        let mut ctl = controller();
        ctl.stats.predictions = 40;
        ctl.stats.correct_predictions = 0;
        ctl.check_divergence();
        assert_eq!(ctl.stats().model_resets, 0);
    }

    #[test]
    fn test_one_in_three_is_not_divergence() {
        // 20 of 60 is 33%, above the 30% floor.
        let mut ctl = controller();
        ctl.stats.predictions = 60;
        ctl.stats.correct_predictions = 20;
        ctl.check_divergence();
        assert_eq!(ctl.stats().model_resets, 0);
    }

    #[test]
    fn test_stale_model_reset() {
        let mut ctl = controller();
        ctl.adaptation_count = 1001;
        ctl.stats.predictions = 10;
        ctl.stats.correct_predictions = 4;
        ctl.check_divergence();
        assert_eq!(ctl.stats().model_resets, 1);
    }

    #[test]
    fn test_reset_restores_initial_policy() {
        let mut ctl = controller();
        let initial = ctl.current_policy();
        for i in 0..5 {
            ctl.adapt(&obs(i * 10, 0.5 / (i + 1) as f64));
        }
        ctl.reset();
        assert_eq!(ctl.current_policy(), initial);
        assert!(ctl.model().is_identity());
        assert_eq!(ctl.stats().adaptations, 0);
    }

    #[test]
    fn test_discarded_iteration_leaves_policy_alone() {
        let mut ctl = controller();
        ctl.adapt(&obs(1, 0.5));
        let before = ctl.current_policy();
        let ewma = ctl.ewma_iterations();
        ctl.discard_iteration(1);
        assert_eq!(ctl.current_policy(), before);
        assert_eq!(ctl.ewma_iterations(), ewma);
        assert_eq!(ctl.stats().discarded, 1);
        assert_eq!(ctl.stats().adaptations, 1);

        // The aborted solve is never graded.
        ctl.record_solve(7);
        assert_eq!(ctl.stats().predictions, 0);
        assert_eq!(ctl.ewma_iterations(), 7.0);
    }
}

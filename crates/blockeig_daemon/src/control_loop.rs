//! Tick-driven runner: one solve per tick against a drifting matrix.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use blockeig_core::{BlockSource, Coordinator, EngineConfig, EngineError, SupervisorHandle};
use tracing::{debug, info, warn};

use crate::config::MatrixConfig;
use crate::matrix::{JitterUnit, SyntheticMatrix};
use crate::stats::{RunSummary, TickRecord};

pub struct ControlLoop {
    coordinator: Coordinator<SyntheticMatrix>,
    summary: RunSummary,
    interval: Duration,
    tick: u64,
}

impl ControlLoop {
    pub fn new(
        engine: EngineConfig,
        matrix: MatrixConfig,
        seed: u64,
        interval: Duration,
    ) -> anyhow::Result<Self> {
        let unit = Arc::new(JitterUnit::new(matrix.jitter_us));
        let source = SyntheticMatrix::new(matrix, seed);
        let dimension = source.dimension();
        info!(
            dimension,
            stored = source.stored(),
            sparsity = source.profile().sparsity,
            condition = source.profile().condition,
            "Synthetic matrix ready"
        );

        let coordinator = Coordinator::new(engine, source, unit)?;
        Ok(Self {
            coordinator,
            summary: RunSummary::new(seed, dimension),
            interval,
            tick: 0,
        })
    }

    pub fn supervisor(&self) -> SupervisorHandle {
        self.coordinator.supervisor()
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Solve once. Convergence failures and aborts are recorded, not fatal.
    pub fn step(&mut self) -> anyhow::Result<TickRecord> {
        let started = Instant::now();
        let tick = self.tick;

        let record = match self.coordinator.solve() {
            Ok(outcome) => {
                info!(
                    tick,
                    iterations = outcome.iterations,
                    eigenvalue = outcome.eigenvalue,
                    max_error = outcome.max_error,
                    threshold = outcome.policy.threshold,
                    mode = ?outcome.policy.iteration_limit_mode,
                    aggressiveness = outcome.policy.aggressiveness,
                    "Tick converged"
                );
                TickRecord {
                    tick,
                    converged: true,
                    iterations: outcome.iterations,
                    eigenvalue: outcome.eigenvalue,
                    max_error: outcome.max_error,
                    threshold: outcome.policy.threshold,
                    elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
                }
            }
            Err(EngineError::ConvergenceFailure {
                iterations,
                max_error,
                threshold,
            }) => {
                warn!(tick, iterations, max_error, threshold, "Tick did not converge");
                TickRecord {
                    tick,
                    converged: false,
                    iterations,
                    eigenvalue: self.coordinator.buffer().last_norm().unwrap_or(0.0),
                    max_error,
                    threshold,
                    elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
                }
            }
            Err(EngineError::Aborted { iteration }) => {
                warn!(tick, iteration, "Tick aborted by supervisor");
                TickRecord {
                    tick,
                    converged: false,
                    iterations: 0,
                    eigenvalue: 0.0,
                    max_error: f64::INFINITY,
                    threshold: self.coordinator.current_policy().threshold,
                    elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
                }
            }
            Err(e) => return Err(e.into()),
        };

        self.summary.ticks.push(record.clone());
        self.tick += 1;
        self.coordinator.source_mut().drift();
        Ok(record)
    }

    /// Run `ticks` solves, sleeping `interval` between them.
    pub fn run(&mut self, ticks: u64) -> anyhow::Result<&RunSummary> {
        for n in 0..ticks {
            self.step()?;
            if n + 1 < ticks && !self.interval.is_zero() {
                debug!(interval_ms = self.interval.as_millis() as u64, "Sleeping until next tick");
                thread::sleep(self.interval);
            }
        }
        self.snapshot();

        info!(
            ticks = self.summary.ticks.len(),
            converged = self.summary.converged(),
            mean_iterations = self.summary.mean_iterations(),
            forced_commits = self.summary.reorder.forced_commits,
            steals = self.summary.steals.steals,
            model_resets = self.summary.controller.model_resets,
            "Run complete"
        );
        Ok(&self.summary)
    }

    fn snapshot(&mut self) {
        self.summary.final_policy = Some(self.coordinator.current_policy());
        self.summary.reorder = self.coordinator.buffer().stats();
        self.summary.controller = self.coordinator.controller().stats();
        self.summary.steals = self.coordinator.scheduler().stats();
        self.summary.mapper = self.coordinator.mapper().stats();
    }
}

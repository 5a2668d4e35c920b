use serde::{Deserialize, Serialize};

#[cfg(feature = "cli")]
use clap::Args;

use crate::error::{EngineError, Result};

/// Hard upper bound on primary lanes; lane ids must fit the block id space.
pub const MAX_LANES: usize = 255;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "cli", derive(Args))]
#[serde(default)]
pub struct EngineConfig {
    /// Number of primary compute lanes
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 4))]
    pub lanes: usize,

    /// Number of shared spare lanes for redundant execution
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 2))]
    pub spare_lanes: usize,

    /// Capacity of each lane queue
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 8))]
    pub queue_depth: usize,

    /// Number of reorder buffer slots
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 16))]
    pub buffer_capacity: usize,

    /// Cycles a stalled result may be retried before BufferOverflow is surfaced
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 64))]
    pub retry_budget: u32,

    /// Convergence threshold before adaptive scaling
    #[cfg_attr(feature = "cli", arg(long, default_value = "0.0001"))]
    pub base_threshold: f64,

    /// Learning rate of the controller's linear predictor before tiering
    #[cfg_attr(feature = "cli", arg(long, default_value = "0.0001"))]
    pub base_learning_rate: f64,

    /// Absolute iteration ceiling for one solve
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 500))]
    pub max_iterations: u32,

    /// Wall-clock budget for one solve (ms); tightens the iteration policy near the end
    #[cfg_attr(feature = "cli", arg(long))]
    pub deadline_ms: Option<u64>,

    /// How many times an iteration is redone after a sequence error
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 3))]
    pub redo_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lanes: 4,
            spare_lanes: 2,
            queue_depth: 8,
            buffer_capacity: 16,
            retry_budget: 64,
            base_threshold: 1e-4,
            base_learning_rate: 1e-4,
            max_iterations: 500,
            deadline_ms: None,
            redo_limit: 3,
        }
    }
}

impl EngineConfig {
    /// Reject configurations the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.lanes == 0 || self.lanes > MAX_LANES {
            return Err(EngineError::InvalidConfig(format!(
                "lanes must be in 1..={MAX_LANES}, got {}",
                self.lanes
            )));
        }
        if self.queue_depth == 0 {
            return Err(EngineError::InvalidConfig("queue_depth must be > 0".into()));
        }
        if self.buffer_capacity < 2 || self.buffer_capacity > u16::MAX as usize / 2 {
            return Err(EngineError::InvalidConfig(format!(
                "buffer_capacity must be in 2..={}, got {}",
                u16::MAX / 2,
                self.buffer_capacity
            )));
        }
        if !(self.base_threshold > 0.0) {
            return Err(EngineError::InvalidConfig(
                "base_threshold must be positive".into(),
            ));
        }
        if !(self.base_learning_rate > 0.0) {
            return Err(EngineError::InvalidConfig(
                "base_learning_rate must be positive".into(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(EngineError::InvalidConfig(
                "max_iterations must be > 0".into(),
            ));
        }
        Ok(())
    }
}

//! Error taxonomy for the runtime core.
//!
//! Only a subset of these ever reaches a caller. Sequence resets, duplicate
//! resolution, corruption flushes and predictor resets are recovered inside the
//! component that detects them and are surfaced as counters and `warn!` logs.
//! The variants exist so those recoveries can be named in logs and stats.

use thiserror::Error;

/// Errors raised by the lane pool, reorder buffer, controller and coordinator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Sequence monotonicity or wraparound violated in the reorder buffer.
    /// Recovered by resetting the sequence counters and redoing the iteration.
    #[error("sequence error: expected {expected}, got {got}")]
    Sequence { expected: u16, got: u16 },

    /// Same block seen twice in one iteration. Recovered by keeping the
    /// higher-sequence entry.
    #[error("duplicate block {block_id} in iteration {iteration}")]
    DuplicateBlock { block_id: u8, iteration: u8 },

    /// A result could not be admitted within the retry budget.
    #[error("reorder buffer overflow: result rejected for {attempts} cycles")]
    BufferOverflow { attempts: u32 },

    /// Unrecognised error code; the reorder buffer was flushed.
    #[error("unknown corruption code {code:#04x}, buffer flushed")]
    UnknownCorruption { code: u8 },

    /// Controller accuracy collapsed; the linear model was reset.
    #[error("predictor diverged (accuracy {accuracy:.2}), model reset")]
    PredictorDivergence { accuracy: f64 },

    /// Iteration cap reached without meeting the convergence threshold.
    #[error("no convergence after {iterations} iterations (max error {max_error:e} > threshold {threshold:e})")]
    ConvergenceFailure {
        iterations: u32,
        max_error: f64,
        threshold: f64,
    },

    /// The supervisory loop aborted the iteration in flight.
    #[error("iteration {iteration} aborted")]
    Aborted { iteration: u8 },

    /// A lane worker hung up its channel.
    #[error("lane pool disconnected")]
    LanePoolDisconnected,

    #[error("failed to spawn lane worker: {0}")]
    LaneSpawn(String),

    /// The block source produced a block set that does not tile the vector.
    #[error("invalid block set: {0}")]
    InvalidBlocks(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// Whether the error is terminal for the current run from the caller's
    /// point of view. Locally recovered kinds return `false`.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            EngineError::Sequence { .. }
                | EngineError::DuplicateBlock { .. }
                | EngineError::UnknownCorruption { .. }
                | EngineError::PredictorDivergence { .. }
        )
    }
}

pub type Result<T> = core::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_recoveries_are_not_terminal() {
        assert!(!EngineError::Sequence { expected: 3, got: 900 }.is_terminal());
        assert!(!EngineError::DuplicateBlock { block_id: 1, iteration: 2 }.is_terminal());
        assert!(!EngineError::UnknownCorruption { code: 0x7f }.is_terminal());
        assert!(!EngineError::PredictorDivergence { accuracy: 0.1 }.is_terminal());
    }

    #[test]
    fn test_surfaced_errors_are_terminal() {
        assert!(EngineError::BufferOverflow { attempts: 64 }.is_terminal());
        assert!(EngineError::ConvergenceFailure {
            iterations: 100,
            max_error: 1e-2,
            threshold: 1e-4
        }
        .is_terminal());
        assert!(EngineError::Aborted { iteration: 4 }.is_terminal());
    }

    #[test]
    fn test_display_includes_context() {
        let msg = EngineError::UnknownCorruption { code: 0x2a }.to_string();
        assert!(msg.contains("0x2a"), "message was {msg}");
    }
}

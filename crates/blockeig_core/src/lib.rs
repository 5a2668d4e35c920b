//! Runtime core of a block-parallel iterative eigensolver.
//!
//! A matrix is partitioned into 2-row blocks; every power iteration fans the
//! blocks out over a pool of compute lanes and reassembles their results in
//! order:
//!
//! | Module        | Role                                                     |
//! |---------------|----------------------------------------------------------|
//! | `lanes`       | bounded per-lane queues, compute unit, worker pool       |
//! | `scheduler`   | work stealing, redundant spare-lane mapping              |
//! | `reorder`     | sequence-ordered commit, normalization, error recovery   |
//! | `adaptive`    | EWMA + linear predictor driving threshold and limits     |
//! | `coordinator` | the decision cycle tying everything together             |

extern crate alloc;

pub mod adaptive;
pub mod block;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lanes;
pub mod reorder;
pub mod scheduler;

pub use adaptive::{AdaptiveController, IterationLimitMode, Observation, Policy, Trend};
pub use block::{Block, Element, LaneSlot, MatrixProfile, Payload, ResultEntry, ResultKind, Task};
pub use config::EngineConfig;
pub use coordinator::{
    BlockSource, Coordinator, IterationReport, LaneMetrics, SolveOutcome, SupervisorHandle,
};
pub use error::{EngineError, Result};
pub use lanes::{BlockMultiplier, ComputeUnit};
pub use reorder::{ErrorCode, ReorderBuffer, ReorderPhase};
pub use scheduler::{RedundantMapper, WorkStealingScheduler};

//! Compute lanes: per-lane queues, the compute-unit boundary and the worker pool.

pub mod compute;
pub mod pool;
pub mod queue;

pub use compute::{BlockMultiplier, ComputeUnit};
pub use pool::{Completion, Job, LanePool};
pub use queue::{LaneQueue, LaneQueues, QueuePressure, Queued, Relocation};

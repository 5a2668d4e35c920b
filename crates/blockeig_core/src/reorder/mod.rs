//! Reorder buffer: out-of-order lane results in, ordered normalized
//! iteration vector out.

pub mod buffer;
pub mod phase;
pub mod vector;

pub use buffer::{
    Admission, ErrorCode, IterationOutput, ReorderBuffer, ReorderStats,
    DUPLICATE_STORM_THRESHOLD,
};
pub use phase::{ReorderEvent, ReorderPhase};
pub use vector::IterationVector;

//! Load balancing across the primary lanes.
//!
//! ```text
//!  lane queues ──► WorkStealingScheduler ── unrelieved ──► congested flag
//!                          │                                     │
//!                          ▼                                     ▼
//!                  one relocation/cycle             RedundantMapper (spare lanes)
//! ```

pub mod redundant;
pub mod work_stealing;

pub use redundant::{MapperAction, MapperStats, RedundantMapper, SpareLane};
pub use work_stealing::{
    plan_steal, LaneView, NoSteal, StealOutcome, StealPlan, StealStats, WorkStealingScheduler,
};

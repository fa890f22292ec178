//! Instance lifecycle: the status state machine and the cycles that drive it.

pub mod machine;
mod manager;

pub use machine::{can_transition, check_transition};
pub use manager::{CycleKind, CycleResult, CycleSummary, LifecycleManager};

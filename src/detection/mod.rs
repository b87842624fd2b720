// src/detection/mod.rs

pub mod overlap;
pub mod replay;
pub mod state_machine;
mod types;

pub use overlap::{overlap_ratio, OverlapEvaluator};
pub use replay::ReplayDetector;
pub use state_machine::{ClearReason, WarningState, WarningStateMachine, WarningUpdate};
pub use types::*;

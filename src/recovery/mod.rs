pub mod classifier;
pub mod planner;

pub use classifier::{analyze_error, ErrorEvent, ErrorKind};
pub use planner::{ErrorSummary, RecoveryPlanner, RecoveryStrategy, StrategyTable};

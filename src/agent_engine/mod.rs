pub mod decomposer;
pub mod engine;
pub mod history;
pub mod loop_control;
pub mod plan;
pub mod planner;
pub mod state;
pub mod verifier;

pub use engine::Engine;
pub use plan::{Subtask, SubtaskStatus, TaskPlan};
pub use state::{AgentStatus, RunReport, StopHandle};

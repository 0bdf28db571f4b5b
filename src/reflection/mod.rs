pub mod workflow;

pub use workflow::{ReflectionResult, ReflectionWorkflow};

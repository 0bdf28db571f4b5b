pub mod agent_engine;
pub mod config;
pub mod errors;
pub mod executor;
pub mod grounding;
pub mod llm;
pub mod memory;
pub mod perception;
pub mod recovery;
pub mod reflection;
pub mod skills;

pub use agent_engine::{Engine, RunReport, StopHandle};
pub use config::{load_config, AppConfig};
pub use errors::{PilotError, PilotResult};

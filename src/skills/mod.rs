pub mod registry;
pub mod types;

pub use registry::SkillRegistry;
pub use types::{Skill, SkillParam, SkillStep};

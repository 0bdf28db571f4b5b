pub mod description;
pub mod grounder;
pub mod similarity;

pub use description::ElementDescription;
pub use grounder::{Grounder, GroundingResult};

pub mod cache;
pub mod store;

pub use cache::ElementCache;
pub use store::{JsonMemoryStore, MemoryContext, MemoryStore, SessionOutcome};

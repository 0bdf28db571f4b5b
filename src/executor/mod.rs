pub mod action;
pub mod input;

pub use action::Action;
pub use input::InputExecutor;

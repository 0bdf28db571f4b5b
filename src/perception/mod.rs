pub mod annotator;
pub mod detector;
pub mod marks;
pub mod screenshot;
pub mod traits;
pub mod types;
pub mod ui_automation;

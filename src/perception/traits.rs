use async_trait::async_trait;

use crate::errors::PilotResult;
use crate::perception::screenshot::Screenshot;
use crate::perception::types::{ElementTree, SoMElement};

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> PilotResult<Screenshot>;
}

/// OS accessibility tree reader.
#[async_trait]
pub trait AccessibilitySource: Send + Sync {
    async fn get_element_tree(&self) -> PilotResult<ElementTree>;

    fn is_available(&self) -> bool {
        true
    }
}

/// Browser page / DOM reader. Elements come back unnumbered.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn get_interactive_elements(&self) -> PilotResult<Vec<SoMElement>>;

    fn is_available(&self) -> bool;
}

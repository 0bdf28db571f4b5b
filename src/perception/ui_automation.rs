/// Windows UI Automation reader and a short-lived tree cache.
///
/// The reader walks the control view of the desktop into an [`ElementTree`].
/// Other platforms get a reader that reports itself unavailable.
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::errors::PilotResult;
use crate::perception::traits::AccessibilitySource;
use crate::perception::types::{ControlType, ElementTree};

/// Map a UIA `*ControlTypeId` to the engine's control types.
pub fn control_type_from_uia(id: i32) -> ControlType {
    match id {
        50000 | 50031 => ControlType::Button, // Button, SplitButton
        50002 => ControlType::CheckBox,
        50003 => ControlType::ComboBox,
        50004 => ControlType::Edit,
        50005 => ControlType::Hyperlink,
        50007 | 50029 => ControlType::ListItem, // ListItem, DataItem
        50008 | 50028 => ControlType::List,     // List, DataGrid
        50009 | 50010 => ControlType::Menu,     // Menu, MenuBar
        50011 => ControlType::MenuItem,
        50013 => ControlType::RadioButton,
        50018 => ControlType::Tab,
        50019 => ControlType::TabItem,
        50020 => ControlType::Text,
        50023 => ControlType::Tree,
        50024 => ControlType::TreeItem,
        50025 => ControlType::Custom,
        50026 | 50021 => ControlType::Group, // Group, ToolBar
        50030 => ControlType::Document,
        50032 => ControlType::Window,
        50033 => ControlType::Pane,
        _ => ControlType::Unknown,
    }
}

#[cfg(target_os = "windows")]
mod win {
    use windows::Win32::Foundation::RECT;
    use windows::Win32::System::Com::{
        CoCreateInstance, CoInitializeEx, CoUninitialize, CLSCTX_ALL, COINIT_MULTITHREADED,
    };
    use windows::Win32::UI::Accessibility::{
        CUIAutomation, IUIAutomation, IUIAutomationElement, IUIAutomationTreeWalker,
    };

    use super::control_type_from_uia;
    use crate::errors::{PilotError, PilotResult};
    use crate::perception::types::{BoundingRect, ElementTree, NodeId, UIElement};

    struct ComGuard;

    impl ComGuard {
        fn new() -> PilotResult<Self> {
            unsafe {
                CoInitializeEx(None, COINIT_MULTITHREADED)
                    .ok()
                    .map_err(|e| PilotError::Perception(format!("CoInitializeEx: {e}")))?;
            }
            Ok(Self)
        }
    }

    impl Drop for ComGuard {
        fn drop(&mut self) {
            unsafe { CoUninitialize() };
        }
    }

    pub struct WalkLimits {
        pub max_depth: u32,
        pub max_nodes: usize,
    }

    /// Blocking walk; must run on a thread that may initialise COM.
    pub fn read_tree_sync(limits: &WalkLimits) -> PilotResult<ElementTree> {
        let _com = ComGuard::new()?;

        let automation: IUIAutomation = unsafe {
            CoCreateInstance(&CUIAutomation, None, CLSCTX_ALL)
                .map_err(|e| PilotError::Perception(format!("CoCreateInstance UIA: {e}")))?
        };
        let root = unsafe {
            automation
                .GetRootElement()
                .map_err(|e| PilotError::Perception(format!("GetRootElement: {e}")))?
        };
        let walker = unsafe {
            automation
                .ControlViewWalker()
                .map_err(|e| PilotError::Perception(format!("ControlViewWalker: {e}")))?
        };

        let mut tree = ElementTree::new();
        walk(&walker, &root, None, 0, limits, &mut tree);
        tracing::debug!(nodes = tree.len(), "UIA tree read");
        Ok(tree)
    }

    fn walk(
        walker: &IUIAutomationTreeWalker,
        element: &IUIAutomationElement,
        parent: Option<NodeId>,
        depth: u32,
        limits: &WalkLimits,
        tree: &mut ElementTree,
    ) {
        if depth > limits.max_depth || tree.len() >= limits.max_nodes {
            return;
        }
        let id = tree.push(parent, read_node(element));

        let Ok(mut child) = (unsafe { walker.GetFirstChildElement(element) }) else {
            return;
        };
        loop {
            walk(walker, &child, Some(id), depth + 1, limits, tree);
            match unsafe { walker.GetNextSiblingElement(&child) } {
                Ok(next) => child = next,
                Err(_) => break,
            }
        }
    }

    fn read_node(element: &IUIAutomationElement) -> UIElement {
        let name = unsafe { element.CurrentName().map(|s| s.to_string()).unwrap_or_default() };
        let control_type = unsafe { element.CurrentControlType().map(|c| c.0).unwrap_or(0) };
        let rect: Option<RECT> = unsafe { element.CurrentBoundingRectangle().ok() };
        let offscreen = unsafe { element.CurrentIsOffscreen().map(|b| b.as_bool()).unwrap_or(false) };
        let enabled = unsafe { element.CurrentIsEnabled().map(|b| b.as_bool()).unwrap_or(false) };
        let focusable = unsafe {
            element
                .CurrentIsKeyboardFocusable()
                .map(|b| b.as_bool())
                .unwrap_or(false)
        };
        let automation_id = unsafe {
            element
                .CurrentAutomationId()
                .map(|s| s.to_string())
                .ok()
                .filter(|s| !s.is_empty())
        };

        let rect = rect
            .map(|r| BoundingRect::new(r.left, r.top, r.right, r.bottom))
            .filter(|r| !r.is_empty());

        let mut node = UIElement::new(name, control_type_from_uia(control_type), rect);
        node.is_visible = !offscreen;
        node.is_enabled = enabled;
        node.is_focusable = focusable;
        node.automation_id = automation_id;
        node
    }
}

/// Accessibility reader backed by Windows UI Automation.
#[derive(Debug, Clone)]
pub struct UiAutomationSource {
    pub max_depth: u32,
    pub max_nodes: usize,
}

impl Default for UiAutomationSource {
    fn default() -> Self {
        Self {
            max_depth: 12,
            max_nodes: 2000,
        }
    }
}

#[async_trait]
impl AccessibilitySource for UiAutomationSource {
    #[cfg(target_os = "windows")]
    async fn get_element_tree(&self) -> PilotResult<ElementTree> {
        let limits = win::WalkLimits {
            max_depth: self.max_depth,
            max_nodes: self.max_nodes,
        };
        tokio::task::spawn_blocking(move || win::read_tree_sync(&limits))
            .await
            .map_err(|e| crate::errors::PilotError::Perception(format!("join: {e}")))?
    }

    #[cfg(not(target_os = "windows"))]
    async fn get_element_tree(&self) -> PilotResult<ElementTree> {
        Ok(ElementTree::new())
    }

    fn is_available(&self) -> bool {
        cfg!(target_os = "windows")
    }
}

/// Reuses the last accessibility snapshot for a short window so that
/// planning and grounding in the same step see one tree.
pub struct TreeCache {
    ttl: Duration,
    entry: Mutex<Option<(Instant, Arc<ElementTree>)>>,
}

impl TreeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    fn fresh(&self) -> Option<Arc<ElementTree>> {
        let guard = self.entry.lock().ok()?;
        guard
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, tree)| Arc::clone(tree))
    }

    /// Returns the cached tree, or reads a new one. Read failures yield an
    /// empty tree so that callers can still act on raw coordinates.
    pub async fn get(&self, source: &dyn AccessibilitySource) -> Arc<ElementTree> {
        if let Some(tree) = self.fresh() {
            return tree;
        }
        if !source.is_available() {
            return Arc::new(ElementTree::new());
        }
        let tree = match source.get_element_tree().await {
            Ok(tree) => Arc::new(tree),
            Err(e) => {
                tracing::warn!(error = %e, "accessibility tree read failed; continuing without");
                Arc::new(ElementTree::new())
            }
        };
        if let Ok(mut guard) = self.entry.lock() {
            *guard = Some((Instant::now(), Arc::clone(&tree)));
        }
        tree
    }

    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.entry.lock() {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::perception::types::{BoundingRect, UIElement};

    struct CountingSource {
        reads: AtomicUsize,
    }

    #[async_trait]
    impl AccessibilitySource for CountingSource {
        async fn get_element_tree(&self) -> PilotResult<ElementTree> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let mut tree = ElementTree::new();
            tree.push(
                None,
                UIElement::new("OK", ControlType::Button, Some(BoundingRect::new(0, 0, 10, 10))),
            );
            Ok(tree)
        }
    }

    #[test]
    fn uia_ids_map_to_control_types() {
        assert_eq!(control_type_from_uia(50000), ControlType::Button);
        assert_eq!(control_type_from_uia(50004), ControlType::Edit);
        assert_eq!(control_type_from_uia(50024), ControlType::TreeItem);
        assert_eq!(control_type_from_uia(12345), ControlType::Unknown);
    }

    #[tokio::test]
    async fn cache_reuses_tree_until_invalidated() {
        let source = CountingSource { reads: AtomicUsize::new(0) };
        let cache = TreeCache::new(Duration::from_secs(60));
        let first = cache.get(&source).await;
        let second = cache.get(&source).await;
        assert_eq!(first.len(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.reads.load(Ordering::SeqCst), 1);

        cache.invalidate();
        cache.get(&source).await;
        assert_eq!(source.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_ttl_always_rereads() {
        let source = CountingSource { reads: AtomicUsize::new(0) };
        let cache = TreeCache::new(Duration::ZERO);
        cache.get(&source).await;
        cache.get(&source).await;
        assert_eq!(source.reads.load(Ordering::SeqCst), 2);
    }
}

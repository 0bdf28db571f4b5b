use std::fmt;

use serde::{Deserialize, Serialize};

/// Screen coordinate in physical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        let dx = f64::from(self.x - other.x);
        let dy = f64::from(self.y - other.y);
        (dx * dx + dy * dy).sqrt()
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Axis-aligned rectangle with inclusive edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BoundingRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl BoundingRect {
    /// Swapped edges are reordered so that `right >= left` and `bottom >= top`.
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left: left.min(right),
            top: top.min(bottom),
            right: left.max(right),
            bottom: top.max(bottom),
        }
    }

    pub fn from_xywh(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self::new(x, y, x + width, y + height)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn center(&self) -> Point {
        Point::new(self.left + self.width() / 2, self.top + self.height() / 2)
    }

    pub fn area(&self) -> i64 {
        i64::from(self.width()) * i64::from(self.height())
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    pub fn contains(&self, point: Point) -> bool {
        self.left <= point.x && point.x <= self.right && self.top <= point.y && point.y <= self.bottom
    }

    pub fn intersection(&self, other: &BoundingRect) -> Option<BoundingRect> {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right.min(other.right);
        let bottom = self.bottom.min(other.bottom);
        (right > left && bottom > top).then(|| BoundingRect { left, top, right, bottom })
    }

    /// Intersection over union. Areas are floored at one pixel so degenerate
    /// boxes never divide by zero.
    pub fn iou(&self, other: &BoundingRect) -> f64 {
        let inter = self.intersection(other).map(|r| r.area()).unwrap_or(0);
        if inter == 0 {
            return 0.0;
        }
        let union = self.area().max(1) + other.area().max(1) - inter;
        inter as f64 / union.max(1) as f64
    }

    /// True when the rectangle lies entirely outside a `width` x `height` screen.
    pub fn is_offscreen(&self, width: i32, height: i32) -> bool {
        self.right < 0 || self.bottom < 0 || self.left > width || self.top > height
    }
}

impl fmt::Display for BoundingRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})-({}, {})", self.left, self.top, self.right, self.bottom)
    }
}

/// Accessibility control types the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlType {
    Button,
    Edit,
    Text,
    List,
    ListItem,
    Menu,
    MenuItem,
    ComboBox,
    Tab,
    TabItem,
    Tree,
    TreeItem,
    CheckBox,
    RadioButton,
    Hyperlink,
    Window,
    Pane,
    Group,
    Document,
    Custom,
    #[serde(other)]
    Unknown,
}

impl ControlType {
    pub const ALL: [ControlType; 21] = [
        ControlType::Button,
        ControlType::Edit,
        ControlType::Text,
        ControlType::List,
        ControlType::ListItem,
        ControlType::Menu,
        ControlType::MenuItem,
        ControlType::ComboBox,
        ControlType::Tab,
        ControlType::TabItem,
        ControlType::Tree,
        ControlType::TreeItem,
        ControlType::CheckBox,
        ControlType::RadioButton,
        ControlType::Hyperlink,
        ControlType::Window,
        ControlType::Pane,
        ControlType::Group,
        ControlType::Document,
        ControlType::Custom,
        ControlType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlType::Button => "Button",
            ControlType::Edit => "Edit",
            ControlType::Text => "Text",
            ControlType::List => "List",
            ControlType::ListItem => "ListItem",
            ControlType::Menu => "Menu",
            ControlType::MenuItem => "MenuItem",
            ControlType::ComboBox => "ComboBox",
            ControlType::Tab => "Tab",
            ControlType::TabItem => "TabItem",
            ControlType::Tree => "Tree",
            ControlType::TreeItem => "TreeItem",
            ControlType::CheckBox => "CheckBox",
            ControlType::RadioButton => "RadioButton",
            ControlType::Hyperlink => "Hyperlink",
            ControlType::Window => "Window",
            ControlType::Pane => "Pane",
            ControlType::Group => "Group",
            ControlType::Document => "Document",
            ControlType::Custom => "Custom",
            ControlType::Unknown => "Unknown",
        }
    }

    /// Case-insensitive lookup; accepts the `ButtonControl` spelling used by
    /// UIA programmatic names. Anything unrecognised maps to `Unknown`.
    pub fn from_name(name: &str) -> Self {
        let lowered = name.trim().to_lowercase();
        let lowered = lowered.strip_suffix("control").unwrap_or(&lowered);
        Self::ALL
            .iter()
            .copied()
            .find(|ct| ct.as_str().to_lowercase() == lowered)
            .unwrap_or(ControlType::Unknown)
    }

    /// Control types a click is expected to act on.
    pub fn is_clickable(&self) -> bool {
        matches!(
            self,
            ControlType::Button
                | ControlType::Hyperlink
                | ControlType::MenuItem
                | ControlType::ListItem
                | ControlType::TabItem
                | ControlType::TreeItem
                | ControlType::CheckBox
                | ControlType::RadioButton
        )
    }
}

impl fmt::Display for ControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index of a node inside an [`ElementTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// One accessibility node. Rebuilt wholesale with every snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UIElement {
    pub name: String,
    pub control_type: ControlType,
    pub rect: Option<BoundingRect>,
    pub is_enabled: bool,
    pub is_visible: bool,
    pub is_focusable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automation_id: Option<String>,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub parent: Option<NodeId>,
    #[serde(default)]
    pub children: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_type: Option<ControlType>,
}

impl UIElement {
    pub fn new(name: impl Into<String>, control_type: ControlType, rect: Option<BoundingRect>) -> Self {
        Self {
            name: name.into(),
            control_type,
            rect,
            is_enabled: true,
            is_visible: true,
            is_focusable: false,
            value: None,
            automation_id: None,
            depth: 0,
            parent: None,
            children: Vec::new(),
            parent_name: None,
            parent_type: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.is_visible = false;
        self
    }

    pub fn center(&self) -> Option<Point> {
        self.rect.map(|r| r.center())
    }

    /// Visible, enabled and located on screen.
    pub fn is_interactable(&self) -> bool {
        self.is_visible && self.is_enabled && self.rect.is_some()
    }

    pub fn is_clickable(&self) -> bool {
        self.control_type.is_clickable() && self.is_interactable()
    }
}

/// Arena-backed accessibility tree. Arena order is pre-order traversal when
/// nodes are pushed depth first, which is how the readers build it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElementTree {
    nodes: Vec<UIElement>,
}

impl ElementTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node under `parent` (or as a root) and fills in its depth and
    /// parent fields.
    pub fn push(&mut self, parent: Option<NodeId>, mut element: UIElement) -> NodeId {
        let id = NodeId(self.nodes.len());
        element.parent = parent;
        element.children.clear();
        match parent.and_then(|p| self.nodes.get(p.0).map(|n| (p, n))) {
            Some((pid, parent_node)) => {
                element.depth = parent_node.depth + 1;
                element.parent_name = Some(parent_node.name.clone());
                element.parent_type = Some(parent_node.control_type);
                self.nodes.push(element);
                self.nodes[pid.0].children.push(id);
            }
            None => {
                element.parent = None;
                element.depth = 0;
                self.nodes.push(element);
            }
        }
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> Option<NodeId> {
        (!self.nodes.is_empty()).then_some(NodeId(0))
    }

    pub fn get(&self, id: NodeId) -> Option<&UIElement> {
        self.nodes.get(id.0)
    }

    pub fn parent(&self, id: NodeId) -> Option<&UIElement> {
        self.get(id)?.parent.and_then(|p| self.get(p))
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = (NodeId, &UIElement)> {
        self.get(id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(move |c| self.get(*c).map(|n| (*c, n)))
    }

    /// Flattened view in arena order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &UIElement)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    /// Case-insensitive name lookup, substring match unless `exact`.
    pub fn find_by_name(&self, name: &str, exact: bool) -> Vec<NodeId> {
        let needle = name.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.iter()
            .filter(|(_, n)| {
                let hay = n.name.to_lowercase();
                if exact {
                    hay == needle
                } else {
                    hay.contains(&needle)
                }
            })
            .map(|(id, _)| id)
            .collect()
    }

    pub fn find_by_type(&self, control_type: ControlType) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, n)| n.control_type == control_type)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn find_clickable(&self) -> Vec<NodeId> {
        self.iter().filter(|(_, n)| n.is_clickable()).map(|(id, _)| id).collect()
    }

    /// Visible nodes containing `point`, deepest first.
    pub fn find_at_point(&self, point: Point) -> Vec<NodeId> {
        let mut hits: Vec<(NodeId, u32)> = self
            .iter()
            .filter(|(_, n)| n.is_visible && n.rect.is_some_and(|r| r.contains(point)))
            .map(|(id, n)| (id, n.depth))
            .collect();
        hits.sort_by(|a, b| b.1.cmp(&a.1));
        hits.into_iter().map(|(id, _)| id).collect()
    }

    /// Interactable nodes whose centre lies within `radius` of `point`,
    /// nearest first.
    pub fn find_near_point(&self, point: Point, radius: f64) -> Vec<(NodeId, f64)> {
        let mut near: Vec<(NodeId, f64)> = self
            .iter()
            .filter(|(_, n)| n.is_interactable())
            .filter_map(|(id, n)| {
                let d = n.center()?.distance(&point);
                (d <= radius).then_some((id, d))
            })
            .collect();
        near.sort_by(|a, b| a.1.total_cmp(&b.1));
        near
    }

    /// Compact listing for model prompts: `[i] Type: "name" at (x, y)`.
    pub fn to_text_representation(&self, max_elements: usize) -> String {
        let listed: Vec<&UIElement> = self
            .nodes
            .iter()
            .filter(|n| n.is_interactable() && (!n.name.trim().is_empty() || n.control_type.is_clickable()))
            .collect();
        let mut lines: Vec<String> = listed
            .iter()
            .take(max_elements)
            .enumerate()
            .filter_map(|(i, n)| {
                let c = n.center()?;
                Some(format!("[{i}] {}: \"{}\" at ({}, {})", n.control_type, n.name, c.x, c.y))
            })
            .collect();
        if listed.len() > max_elements {
            lines.push(format!("... and {} more elements", listed.len() - max_elements));
        }
        lines.join("\n")
    }
}

/// Which detector produced a marked element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementSource {
    Accessibility,
    Page,
}

/// An element eligible for a numbered mark on the annotated screenshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoMElement {
    /// Zero until the annotator assigns a mark.
    pub id: u32,
    pub name: String,
    pub element_type: String,
    pub rect: BoundingRect,
    pub source: ElementSource,
    pub is_enabled: bool,
    pub is_visible: bool,
}

impl SoMElement {
    pub fn new(
        name: impl Into<String>,
        element_type: impl Into<String>,
        rect: BoundingRect,
        source: ElementSource,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            element_type: element_type.into(),
            rect,
            source,
            is_enabled: true,
            is_visible: true,
        }
    }

    /// Converts an accessibility node; nodes without a rectangle have no mark.
    pub fn from_ui_element(element: &UIElement) -> Option<Self> {
        let rect = element.rect?;
        Some(Self {
            id: 0,
            name: element.name.clone(),
            element_type: element.control_type.as_str().to_string(),
            rect,
            source: ElementSource::Accessibility,
            is_enabled: element.is_enabled,
            is_visible: element.is_visible,
        })
    }

    pub fn center(&self) -> Point {
        self.rect.center()
    }
}

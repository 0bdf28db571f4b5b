use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::perception::types::Point;

/// What the model said about the control it wants to act on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementDescription {
    pub name: Option<String>,
    pub text_content: Option<String>,
    /// Free-text hint such as "search box" or "button".
    pub control_type: Option<String>,
    pub parent_description: Option<String>,
    pub relative_position: Option<String>,
    pub approximate_coords: Option<Point>,
    pub additional_context: Option<String>,
}

fn first_str(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn coord(v: &Value) -> Option<i32> {
    v.as_i64()
        .or_else(|| v.as_f64().map(|f| f.round() as i64))
        .and_then(|n| i32::try_from(n).ok())
}

impl ElementDescription {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Reads the loosely keyed object a model emits. Unknown keys are
    /// ignored, so malformed output degrades to an empty description.
    pub fn from_json(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return match value.as_str() {
                Some(s) if !s.trim().is_empty() => Self::named(s.trim()),
                _ => Self::default(),
            };
        };
        let approximate_coords = obj
            .get("approximate_coordinates")
            .or_else(|| obj.get("coordinates"))
            .and_then(Value::as_array)
            .filter(|a| a.len() >= 2)
            .and_then(|a| Some(Point::new(coord(&a[0])?, coord(&a[1])?)));

        Self {
            name: first_str(obj, &["name", "element_name"]),
            text_content: first_str(obj, &["text", "label"]),
            control_type: first_str(obj, &["type", "control_type"]),
            parent_description: first_str(obj, &["parent", "container"]),
            relative_position: first_str(obj, &["position", "location"]),
            approximate_coords,
            additional_context: first_str(obj, &["context", "description"]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.text_content.is_none()
            && self.control_type.is_none()
            && self.approximate_coords.is_none()
    }

    /// Short human-readable label for logs and action history.
    pub fn label(&self) -> String {
        let mut parts = Vec::new();
        if let Some(n) = &self.name {
            parts.push(format!("\"{n}\""));
        } else if let Some(t) = &self.text_content {
            parts.push(format!("\"{t}\""));
        }
        if let Some(t) = &self.control_type {
            parts.push(t.clone());
        }
        if let Some(p) = &self.approximate_coords {
            parts.push(format!("near {p}"));
        }
        if parts.is_empty() {
            "unspecified element".to_string()
        } else {
            parts.join(" ")
        }
    }
}

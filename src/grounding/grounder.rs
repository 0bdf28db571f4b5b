use serde::Serialize;

use crate::config::GroundingConfig;
use crate::grounding::description::ElementDescription;
use crate::grounding::similarity::text_similarity;
use crate::memory::cache::ElementCache;
use crate::perception::types::{ControlType, ElementTree, NodeId, Point, UIElement};

/// Free-text type hints recognised for each control family.
const TYPE_KEYWORDS: &[(ControlType, &[&str])] = &[
    (ControlType::Button, &["button", "btn", "click", "press"]),
    (
        ControlType::Edit,
        &["input", "textbox", "text field", "edit", "search box", "search bar", "field"],
    ),
    (ControlType::Hyperlink, &["link", "hyperlink", "url"]),
    (ControlType::CheckBox, &["checkbox", "check box", "toggle"]),
    (ControlType::RadioButton, &["radio", "option button"]),
    (ControlType::ComboBox, &["dropdown", "combo box", "select", "combobox"]),
    (
        ControlType::ListItem,
        &["list item", "item", "option", "result", "search result"],
    ),
    (ControlType::MenuItem, &["menu item", "menu option", "menu"]),
    (ControlType::TabItem, &["tab"]),
    (ControlType::TreeItem, &["tree item", "folder"]),
    (ControlType::Text, &["text", "label"]),
];

pub const METHOD_SPATIAL_FALLBACK: &str = "spatial_fallback";
pub const METHOD_CACHE: &str = "cache";
pub const METHOD_NONE: &str = "none";

/// `GroundingResult::success` requires confidence above this. Fixed: the
/// spatial fallback and the cache confidence are calibrated against it.
pub const SUCCESS_THRESHOLD: f64 = 0.3;

/// Whether a free-text type hint names `control_type`.
pub fn type_matches(control_type: ControlType, hint: &str) -> bool {
    let hint = hint.to_lowercase();
    if hint.contains(&control_type.as_str().to_lowercase()) {
        return true;
    }
    TYPE_KEYWORDS
        .iter()
        .find(|(ct, _)| *ct == control_type)
        .is_some_and(|(_, words)| words.iter().any(|w| hint.contains(w)))
}

#[derive(Debug, Clone, Serialize)]
pub struct GroundedElement {
    pub node: NodeId,
    pub element: UIElement,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroundingResult {
    pub element: Option<GroundedElement>,
    pub confidence: f64,
    /// `+`-joined trace of the signals that fired, e.g. `name(1.00)+type`.
    pub match_method: String,
    pub candidates: Vec<(GroundedElement, f64)>,
    pub coordinates: Option<Point>,
}

impl GroundingResult {
    fn failed(confidence: f64, method: impl Into<String>, candidates: Vec<(GroundedElement, f64)>) -> Self {
        Self {
            element: None,
            confidence,
            match_method: method.into(),
            candidates,
            coordinates: None,
        }
    }

    pub fn success(&self) -> bool {
        self.element.is_some() && self.confidence > SUCCESS_THRESHOLD
    }

    pub fn element_name(&self) -> Option<&str> {
        self.element.as_ref().map(|e| e.element.name.as_str())
    }
}

struct Scored {
    node: NodeId,
    score: f64,
    method: String,
}

/// Resolves model descriptions to elements of an accessibility snapshot.
#[derive(Debug, Clone, Default)]
pub struct Grounder {
    config: GroundingConfig,
}

impl Grounder {
    pub fn new(config: GroundingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GroundingConfig {
        &self.config
    }

    fn grounded(tree: &ElementTree, node: NodeId) -> Option<GroundedElement> {
        tree.get(node).map(|e| GroundedElement {
            node,
            element: e.clone(),
        })
    }

    /// Score of one element against a description, with its method trace.
    pub fn score_element(
        &self,
        element: &UIElement,
        description: &ElementDescription,
        screen_size: (u32, u32),
    ) -> (f64, String) {
        let c = &self.config;
        let mut score = 0.0;
        let mut parts: Vec<String> = Vec::new();

        if let Some(name) = &description.name {
            let s = text_similarity(&element.name, name);
            if s > c.similarity_gate {
                score += s * c.name_weight;
                parts.push(format!("name({s:.2})"));
            }
            if let Some(value) = element.value.as_deref().filter(|v| !v.is_empty()) {
                let s = text_similarity(value, name);
                if s > c.similarity_gate {
                    score += s * c.value_weight;
                    parts.push(format!("value({s:.2})"));
                }
            }
        }

        if let Some(text) = &description.text_content {
            let s = text_similarity(&element.name, text);
            score += s * c.text_weight;
            if s > 0.5 {
                parts.push(format!("text({s:.2})"));
            }
        }

        if let Some(hint) = &description.control_type {
            if type_matches(element.control_type, hint) {
                score += c.type_bonus;
                parts.push("type".to_string());
            }
        }

        if let (Some(target), Some(center)) = (description.approximate_coords, element.center()) {
            let (w, h) = (f64::from(screen_size.0), f64::from(screen_size.1));
            let diagonal = (w * w + h * h).sqrt().max(1.0);
            let proximity = 1.0 - (center.distance(&target) / diagonal).min(1.0);
            if proximity > c.spatial_gate {
                score += proximity * c.spatial_weight;
                parts.push(format!("spatial({proximity:.2})"));
            }
        }

        if let (Some(parent_hint), Some(parent_name)) = (&description.parent_description, &element.parent_name) {
            let s = text_similarity(parent_name, parent_hint);
            if s > c.similarity_gate {
                score += s * c.parent_weight;
                parts.push(format!("parent({s:.2})"));
            }
        }

        let method = if parts.is_empty() {
            METHOD_NONE.to_string()
        } else {
            parts.join("+")
        };
        (score, method)
    }

    pub fn ground(
        &self,
        description: &ElementDescription,
        tree: &ElementTree,
        screen_size: (u32, u32),
    ) -> GroundingResult {
        let c = &self.config;
        let mut scored: Vec<Scored> = tree
            .iter()
            .filter(|(_, e)| e.is_interactable())
            .filter_map(|(node, e)| {
                let (score, method) = self.score_element(e, description, screen_size);
                (score > c.min_candidate_score).then_some(Scored { node, score, method })
            })
            .collect();
        // stable: equal scores keep tree order
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));

        let Some(best) = scored.first() else {
            tracing::debug!(target_desc = %description.label(), "no grounding candidates");
            return match description.approximate_coords {
                Some(p) => self.ground_by_coordinates(p, tree),
                None => GroundingResult::failed(0.0, METHOD_NONE, Vec::new()),
            };
        };

        if best.score < c.fallback_threshold {
            tracing::debug!(best = best.score, "best grounding score below threshold");
            if let Some(p) = description.approximate_coords {
                let spatial = self.ground_by_coordinates(p, tree);
                if spatial.success() {
                    return spatial;
                }
            }
            let candidates = scored
                .iter()
                .take(c.max_runner_ups)
                .filter_map(|s| Some((Self::grounded(tree, s.node)?, s.score)))
                .collect();
            return GroundingResult::failed(best.score, best.method.clone(), candidates);
        }

        let element = Self::grounded(tree, best.node);
        let coordinates = element.as_ref().and_then(|e| e.element.center());
        let candidates = scored
            .iter()
            .skip(1)
            .take(c.max_runner_ups)
            .filter_map(|s| Some((Self::grounded(tree, s.node)?, s.score)))
            .collect();
        tracing::debug!(
            target_desc = %description.label(),
            score = best.score,
            method = %best.method,
            "element grounded"
        );
        GroundingResult {
            element,
            confidence: best.score,
            match_method: best.method.clone(),
            candidates,
            coordinates,
        }
    }

    /// Nearest eligible element to `point` within the fallback radius.
    pub fn ground_by_coordinates(&self, point: Point, tree: &ElementTree) -> GroundingResult {
        let c = &self.config;
        let near = tree.find_near_point(point, c.fallback_radius);
        let Some(&(node, distance)) = near.first() else {
            return GroundingResult::failed(0.0, METHOD_SPATIAL_FALLBACK, Vec::new());
        };
        let element = Self::grounded(tree, node);
        let coordinates = element.as_ref().and_then(|e| e.element.center());
        let candidates = near
            .iter()
            .skip(1)
            .take(3)
            .filter_map(|(n, _)| Some((Self::grounded(tree, *n)?, c.fallback_runner_up_score)))
            .collect();
        GroundingResult {
            element,
            confidence: (1.0 - distance / c.fallback_radius).max(0.0),
            match_method: METHOD_SPATIAL_FALLBACK.to_string(),
            candidates,
            coordinates,
        }
    }

    /// Like [`Grounder::ground`], but when grounding fails and the element was
    /// seen recently under the same name, reports the cached location. Such a
    /// result carries coordinates but no element, so `success()` stays false.
    pub fn ground_cached(
        &self,
        description: &ElementDescription,
        tree: &ElementTree,
        screen_size: (u32, u32),
        cache: &ElementCache,
    ) -> GroundingResult {
        let result = self.ground(description, tree, screen_size);
        if result.success() {
            return result;
        }
        let Some(point) = description.name.as_deref().and_then(|n| cache.get(n)) else {
            return result;
        };
        tracing::debug!(target_desc = %description.label(), %point, "using cached element location");
        GroundingResult {
            element: None,
            confidence: self.config.cache_confidence,
            match_method: METHOD_CACHE.to_string(),
            candidates: result.candidates,
            coordinates: Some(point),
        }
    }
}

use std::sync::Arc;

use crate::config::DetectorConfig;
use crate::perception::traits::PageSource;
use crate::perception::types::{ElementTree, SoMElement};

/// Appends the `secondary` elements that do not duplicate any `primary`
/// element. A pair is a duplicate when its IoU reaches `iou_threshold`.
pub fn merge_sources(
    primary: Vec<SoMElement>,
    secondary: Vec<SoMElement>,
    iou_threshold: f64,
) -> Vec<SoMElement> {
    if secondary.is_empty() {
        return primary;
    }
    if primary.is_empty() {
        return secondary;
    }
    let anchors = primary.len();
    let mut merged = primary;
    for candidate in secondary {
        let duplicate = merged[..anchors]
            .iter()
            .any(|p| p.rect.iou(&candidate.rect) >= iou_threshold);
        if !duplicate {
            merged.push(candidate);
        }
    }
    merged
}

/// Combines clickable accessibility elements with elements reported by the
/// page reader.
pub struct HybridDetector {
    page: Option<Arc<dyn PageSource>>,
    config: DetectorConfig,
}

impl HybridDetector {
    pub fn new(page: Option<Arc<dyn PageSource>>, config: DetectorConfig) -> Self {
        Self { page, config }
    }

    /// Reader failures are logged and count as an empty source.
    pub async fn detect(&self, tree: &ElementTree) -> Vec<SoMElement> {
        let accessibility: Vec<SoMElement> = if self.config.use_accessibility {
            tree.find_clickable()
                .into_iter()
                .filter_map(|id| tree.get(id).and_then(SoMElement::from_ui_element))
                .collect()
        } else {
            Vec::new()
        };

        let page = match &self.page {
            Some(src) if self.config.use_page && src.is_available() => {
                match src.get_interactive_elements().await {
                    Ok(elements) => elements,
                    Err(e) => {
                        tracing::warn!(error = %e, "page element read failed; using accessibility only");
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };

        let (a, b) = (accessibility.len(), page.len());
        let merged = merge_sources(accessibility, page, self.config.iou_threshold);
        tracing::debug!(accessibility = a, page = b, merged = merged.len(), "hybrid detection");
        merged
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::errors::{PilotError, PilotResult};
    use crate::perception::types::{BoundingRect, ControlType, ElementSource, UIElement};

    fn page_el(name: &str, rect: BoundingRect) -> SoMElement {
        SoMElement::new(name, "link", rect, ElementSource::Page)
    }

    fn acc_el(name: &str, rect: BoundingRect) -> SoMElement {
        SoMElement::new(name, "Button", rect, ElementSource::Accessibility)
    }

    struct FixedPage(PilotResult<Vec<SoMElement>>);

    #[async_trait]
    impl PageSource for FixedPage {
        async fn get_interactive_elements(&self) -> PilotResult<Vec<SoMElement>> {
            match &self.0 {
                Ok(v) => Ok(v.clone()),
                Err(e) => Err(PilotError::Perception(e.to_string())),
            }
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    #[test]
    fn drops_page_duplicates_at_threshold() {
        let a = vec![acc_el("Save", BoundingRect::new(0, 0, 100, 100))];
        let b = vec![
            // IoU exactly 0.5
            page_el("dup", BoundingRect::new(0, 0, 100, 50)),
            // IoU 0.25
            page_el("partial", BoundingRect::new(0, 0, 50, 50)),
            page_el("far", BoundingRect::new(300, 300, 340, 340)),
        ];
        let merged = merge_sources(a, b, 0.5);
        let names: Vec<&str> = merged.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Save", "partial", "far"]);
    }

    #[test]
    fn one_empty_source_returns_the_other() {
        let b = vec![page_el("only", BoundingRect::new(0, 0, 10, 10))];
        assert_eq!(merge_sources(Vec::new(), b.clone(), 0.5), b);
        let a = vec![acc_el("only", BoundingRect::new(0, 0, 10, 10))];
        assert_eq!(merge_sources(a.clone(), Vec::new(), 0.5), a);
    }

    #[tokio::test]
    async fn page_errors_fall_back_to_accessibility() {
        let mut tree = ElementTree::new();
        tree.push(
            None,
            UIElement::new("OK", ControlType::Button, Some(BoundingRect::new(0, 0, 40, 20))),
        );
        let page: Arc<dyn PageSource> =
            Arc::new(FixedPage(Err(PilotError::Perception("browser gone".into()))));
        let detector = HybridDetector::new(Some(page), DetectorConfig::default());
        let found = detector.detect(&tree).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].source, ElementSource::Accessibility);
    }

    #[tokio::test]
    async fn page_elements_merge_with_tree() {
        let mut tree = ElementTree::new();
        tree.push(
            None,
            UIElement::new("OK", ControlType::Button, Some(BoundingRect::new(0, 0, 40, 20))),
        );
        let page: Arc<dyn PageSource> = Arc::new(FixedPage(Ok(vec![
            page_el("ok-dup", BoundingRect::new(0, 0, 40, 20)),
            page_el("menu", BoundingRect::new(100, 0, 160, 20)),
        ])));
        let detector = HybridDetector::new(Some(page), DetectorConfig::default());
        let found = detector.detect(&tree).await;
        let names: Vec<&str> = found.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["OK", "menu"]);
    }
}

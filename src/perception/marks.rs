use serde::{Deserialize, Serialize};

use crate::errors::{PilotError, PilotResult};
use crate::perception::types::SoMElement;

/// Numbered elements produced by one annotation pass. Ids run 1..=n.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkSet {
    pub marks: Vec<SoMElement>,
    pub screen_width: u32,
    pub screen_height: u32,
}

impl MarkSet {
    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&SoMElement> {
        self.marks.iter().find(|m| m.id == id)
    }

    /// `[id] type: "name" at (x, y)` per mark, for prompts.
    pub fn describe(&self) -> String {
        if self.marks.is_empty() {
            return "No marked elements.".to_string();
        }
        self.marks
            .iter()
            .map(|m| {
                let c = m.center();
                format!("[{}] {}: \"{}\" at ({}, {})", m.id, m.element_type, m.name, c.x, c.y)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The marks the model may currently refer to.
///
/// Marks describe the screen as it was when annotated; any action that can
/// change the screen must call [`MarkTable::invalidate`] before dispatch.
#[derive(Debug, Default)]
pub struct MarkTable {
    current: Option<MarkSet>,
    generation: u64,
}

impl MarkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, marks: MarkSet) {
        self.generation += 1;
        tracing::debug!(generation = self.generation, marks = marks.len(), "mark table installed");
        self.current = Some(marks);
    }

    pub fn invalidate(&mut self) {
        if self.current.take().is_some() {
            self.generation += 1;
            tracing::debug!(generation = self.generation, "mark table invalidated");
        }
    }

    pub fn is_active(&self) -> bool {
        self.current.as_ref().is_some_and(|m| !m.is_empty())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current(&self) -> Option<&MarkSet> {
        self.current.as_ref()
    }

    pub fn resolve(&self, id: u32) -> PilotResult<&SoMElement> {
        let set = self
            .current
            .as_ref()
            .filter(|m| !m.is_empty())
            .ok_or(PilotError::NoMarks)?;
        set.get(id).ok_or(PilotError::UnknownMark {
            id,
            available: set.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::types::{BoundingRect, ElementSource};

    fn one_mark() -> MarkSet {
        let mut el = SoMElement::new("OK", "Button", BoundingRect::new(10, 10, 50, 30), ElementSource::Accessibility);
        el.id = 1;
        MarkSet {
            marks: vec![el],
            screen_width: 100,
            screen_height: 100,
        }
    }

    #[test]
    fn resolve_before_install_reports_no_marks() {
        let table = MarkTable::new();
        assert!(matches!(table.resolve(1), Err(PilotError::NoMarks)));
    }

    #[test]
    fn invalidate_clears_and_bumps_generation() {
        let mut table = MarkTable::new();
        table.install(one_mark());
        assert_eq!(table.resolve(1).unwrap().name, "OK");
        let before = table.generation();
        table.invalidate();
        assert!(table.generation() > before);
        assert!(!table.is_active());
        let err = table.resolve(1).unwrap_err();
        assert!(err.to_string().contains("no marks available"));
    }

    #[test]
    fn unknown_id_reports_available_count() {
        let mut table = MarkTable::new();
        table.install(one_mark());
        match table.resolve(7) {
            Err(PilotError::UnknownMark { id, available }) => {
                assert_eq!(id, 7);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn describe_lists_centres() {
        assert_eq!(one_mark().describe(), "[1] Button: \"OK\" at (30, 20)");
    }
}

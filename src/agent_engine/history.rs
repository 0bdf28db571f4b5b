use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::PilotResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// The task as the user gave it.
    Task,
    /// Raw model reply for a planning step.
    Model,
    Action,
    Verification,
    Error,
    Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts: i64,
    pub step: u32,
    pub kind: EntryKind,
    pub content: Option<String>,
    pub data: Option<Value>,
}

impl HistoryEntry {
    pub fn new(step: u32, kind: EntryKind, content: impl Into<String>) -> Self {
        Self {
            ts: chrono::Utc::now().timestamp_millis(),
            step,
            kind,
            content: Some(content.into()),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Per-run log. Entries are kept in memory and, when a directory is
/// configured, appended to `session_<id>.jsonl` as they arrive.
pub struct SessionHistory {
    pub session_id: String,
    entries: Vec<HistoryEntry>,
    file_path: Option<PathBuf>,
}

impl SessionHistory {
    pub fn new(dir: Option<&Path>) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let file_path = dir.and_then(|d| match std::fs::create_dir_all(d) {
            Ok(()) => Some(d.join(format!("session_{session_id}.jsonl"))),
            Err(e) => {
                tracing::warn!(dir = %d.display(), error = %e, "history directory unusable; keeping history in memory");
                None
            }
        });
        Self {
            session_id,
            entries: Vec::new(),
            file_path,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Stores the entry and appends it to the session file. Write failures
    /// are logged; the in-memory copy is kept either way.
    pub fn record(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "history write failed");
        }
    }

    fn flush(&self) -> PilotResult<()> {
        let (Some(path), Some(last)) = (&self.file_path, self.entries.last()) else {
            return Ok(());
        };
        let line = serde_json::to_string(last)?;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;
        tracing::trace!(path = %path.display(), "history entry flushed");
        Ok(())
    }
}

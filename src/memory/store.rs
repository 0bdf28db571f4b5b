use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{PilotError, PilotResult};
use crate::grounding::similarity::sequence_ratio;
use crate::perception::types::Point;

/// One finished run as remembered across sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: String,
    pub success: bool,
    pub steps: u32,
    #[serde(default)]
    pub actions: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration_secs: f64,
    #[serde(default)]
    pub learned_patterns: Vec<String>,
    #[serde(default)]
    pub error_kinds: Vec<String>,
}

/// What the engine hands to the store when a run ends.
#[derive(Debug, Clone, Default)]
pub struct SessionOutcome {
    pub task: String,
    pub success: bool,
    pub steps: u32,
    pub actions: Vec<String>,
    pub duration_secs: f64,
    pub learned_patterns: Vec<String>,
    pub error_kinds: Vec<String>,
}

/// Past experience relevant to a task, rendered into planning prompts.
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    pub similar_tasks: Vec<TaskRecord>,
    pub success_patterns: Vec<String>,
    /// `action: error` pairs seen to fail before.
    pub known_failures: Vec<String>,
    pub cached_elements: Vec<(String, Point)>,
    /// Actions that already failed in the current run.
    pub avoided_actions: Vec<String>,
}

impl MemoryContext {
    pub fn is_empty(&self) -> bool {
        self.similar_tasks.is_empty()
            && self.success_patterns.is_empty()
            && self.known_failures.is_empty()
            && self.cached_elements.is_empty()
            && self.avoided_actions.is_empty()
    }

    pub fn format_for_prompt(&self) -> String {
        if self.is_empty() {
            return "No memory context available.".to_string();
        }
        let mut lines = Vec::new();
        if !self.similar_tasks.is_empty() {
            lines.push("SIMILAR PAST TASKS:".to_string());
            for t in self.similar_tasks.iter().take(2) {
                let status = if t.success { "SUCCESS" } else { "FAILED" };
                lines.push(format!("  - [{status}] {} ({} steps)", t.task, t.steps));
                for a in t.actions.iter().take(5) {
                    lines.push(format!("      {a}"));
                }
            }
        }
        if !self.success_patterns.is_empty() {
            lines.push("SUCCESS PATTERNS:".to_string());
            lines.extend(self.success_patterns.iter().map(|p| format!("  - {p}")));
        }
        if !self.known_failures.is_empty() {
            lines.push("KNOWN FAILURE MODES:".to_string());
            lines.extend(self.known_failures.iter().map(|p| format!("  - {p}")));
        }
        if !self.avoided_actions.is_empty() {
            lines.push("ACTIONS TO AVOID (failed in this run):".to_string());
            lines.extend(self.avoided_actions.iter().map(|p| format!("  - {p}")));
        }
        if !self.cached_elements.is_empty() {
            lines.push("KNOWN ELEMENT LOCATIONS:".to_string());
            lines.extend(
                self.cached_elements
                    .iter()
                    .take(10)
                    .map(|(n, p)| format!("  - {n}: {p}")),
            );
        }
        lines.join("\n")
    }
}

/// Persistent knowledge collaborator.
pub trait MemoryStore: Send + Sync {
    fn context_for(&self, task: &str) -> MemoryContext;

    /// Most similar past runs first.
    fn similar_tasks(&self, task: &str, limit: usize) -> Vec<TaskRecord>;

    fn record_session(&self, outcome: SessionOutcome) -> PilotResult<()>;

    /// Remembers that `action` failed because of `reason`.
    fn record_failure(&self, action: &str, reason: &str);
}

/// Coarse task family used to share learned patterns between tasks.
pub fn classify_task(task: &str) -> &'static str {
    let lowered = task.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lowered.contains(w));
    if has(&["打开", "open", "launch", "启动"]) {
        "open_app"
    } else if has(&["输入", "type", "write", "填写"]) {
        "text_input"
    } else if has(&["点击", "click", "按"]) {
        "click_action"
    } else if has(&["搜索", "search", "find", "查找"]) {
        "search"
    } else if has(&["关闭", "close", "退出"]) {
        "close_app"
    } else if has(&["保存", "save"]) {
        "save"
    } else {
        "general"
    }
}

fn task_types_related(a: &str, b: &str) -> bool {
    const RELATED: [(&str, &str); 3] = [
        ("open_app", "search"),
        ("text_input", "search"),
        ("click_action", "close_app"),
    ];
    RELATED.iter().any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryFile {
    #[serde(default)]
    records: Vec<TaskRecord>,
    /// task family -> patterns
    #[serde(default)]
    patterns: HashMap<String, Vec<String>>,
    /// action verb -> failure descriptions
    #[serde(default)]
    failures: HashMap<String, Vec<String>>,
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|x| x == item) {
        list.push(item.to_string());
    }
}

/// [`MemoryStore`] persisted as one JSON document.
pub struct JsonMemoryStore {
    path: Option<PathBuf>,
    max_records: usize,
    data: Mutex<MemoryFile>,
}

impl JsonMemoryStore {
    /// Loads `path` if it exists. A corrupt file is logged and replaced on
    /// the next save.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let data = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<MemoryFile>(&text).unwrap_or_else(|e| {
                tracing::error!(path = %path.display(), error = %e, "memory file unreadable; starting empty");
                MemoryFile::default()
            }),
            Err(_) => MemoryFile::default(),
        };
        tracing::info!(path = %path.display(), records = data.records.len(), "memory loaded");
        Self {
            path: Some(path),
            max_records: 500,
            data: Mutex::new(data),
        }
    }

    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            max_records: 500,
            data: Mutex::new(MemoryFile::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().map(|d| d.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save(&self, data: &MemoryFile) -> PilotResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(data)?)?;
        tracing::debug!(path = %path.display(), records = data.records.len(), "memory saved");
        Ok(())
    }

    fn lock(&self) -> PilotResult<std::sync::MutexGuard<'_, MemoryFile>> {
        self.data
            .lock()
            .map_err(|_| PilotError::Memory("memory store lock poisoned".into()))
    }

    fn success_patterns(data: &MemoryFile, task: &str) -> Vec<String> {
        let family = classify_task(task);
        let mut out: Vec<String> = Vec::new();
        if let Some(own) = data.patterns.get(family) {
            own.iter().for_each(|p| push_unique(&mut out, p));
        }
        let mut related: Vec<(&String, &Vec<String>)> = data
            .patterns
            .iter()
            .filter(|(f, _)| f.as_str() != family && task_types_related(family, f))
            .collect();
        related.sort_by(|a, b| a.0.cmp(b.0));
        for (_, patterns) in related {
            patterns.iter().for_each(|p| push_unique(&mut out, p));
        }
        out.truncate(5);
        out
    }

    fn rank_similar(data: &MemoryFile, task: &str, limit: usize) -> Vec<TaskRecord> {
        let lowered = task.to_lowercase();
        let mut scored: Vec<(&TaskRecord, f64)> = data
            .records
            .iter()
            .map(|r| {
                let mut s = sequence_ratio(&lowered, &r.task.to_lowercase());
                if r.success {
                    s *= 1.2;
                }
                (r, s)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored
            .into_iter()
            .take(limit)
            .filter(|(_, s)| *s > 0.3)
            .map(|(r, _)| r.clone())
            .collect()
    }
}

impl MemoryStore for JsonMemoryStore {
    fn context_for(&self, task: &str) -> MemoryContext {
        let Ok(data) = self.lock() else {
            return MemoryContext::default();
        };
        let known_failures = {
            let mut verbs: Vec<&String> = data.failures.keys().collect();
            verbs.sort();
            verbs
                .into_iter()
                .flat_map(|v| data.failures[v].iter().take(2).map(move |e| format!("{v}: {e}")))
                .take(5)
                .collect()
        };
        MemoryContext {
            similar_tasks: Self::rank_similar(&data, task, 3),
            success_patterns: Self::success_patterns(&data, task),
            known_failures,
            ..MemoryContext::default()
        }
    }

    fn similar_tasks(&self, task: &str, limit: usize) -> Vec<TaskRecord> {
        self.lock()
            .map(|data| Self::rank_similar(&data, task, limit))
            .unwrap_or_default()
    }

    fn record_session(&self, outcome: SessionOutcome) -> PilotResult<()> {
        let mut data = self.lock()?;
        if outcome.success && !outcome.learned_patterns.is_empty() {
            let family = classify_task(&outcome.task).to_string();
            let list = data.patterns.entry(family).or_default();
            outcome.learned_patterns.iter().for_each(|p| push_unique(list, p));
        }
        if !outcome.success && !outcome.error_kinds.is_empty() {
            for action in &outcome.actions {
                let verb = action.split_whitespace().next().unwrap_or("unknown").to_lowercase();
                let list = data.failures.entry(verb).or_default();
                outcome.error_kinds.iter().for_each(|e| push_unique(list, e));
            }
        }
        data.records.push(TaskRecord {
            task: outcome.task,
            success: outcome.success,
            steps: outcome.steps,
            actions: outcome.actions,
            timestamp: Utc::now(),
            duration_secs: outcome.duration_secs,
            learned_patterns: outcome.learned_patterns,
            error_kinds: outcome.error_kinds,
        });
        if data.records.len() > self.max_records {
            let excess = data.records.len() - self.max_records;
            data.records.drain(..excess);
        }
        self.save(&data)
    }

    fn record_failure(&self, action: &str, reason: &str) {
        let Ok(mut data) = self.lock() else {
            return;
        };
        let verb = action.split_whitespace().next().unwrap_or("unknown").to_lowercase();
        push_unique(data.failures.entry(verb).or_default(), reason);
        if let Err(e) = self.save(&data) {
            tracing::warn!(error = %e, "failed to persist failure note");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(task: &str, success: bool) -> SessionOutcome {
        SessionOutcome {
            task: task.into(),
            success,
            steps: 4,
            actions: vec!["click at (1, 2)".into(), "type \"hello\"".into()],
            ..SessionOutcome::default()
        }
    }

    #[test]
    fn classifies_task_families() {
        assert_eq!(classify_task("Open Notepad"), "open_app");
        assert_eq!(classify_task("在记事本中输入文字"), "text_input");
        assert_eq!(classify_task("save the report"), "save");
        assert_eq!(classify_task("scroll around"), "general");
    }

    #[test]
    fn similar_tasks_prefer_successes_and_threshold() {
        let store = JsonMemoryStore::in_memory();
        store.record_session(outcome("open notepad and type hello", false)).unwrap();
        store.record_session(outcome("open notepad and type hi", true)).unwrap();
        store.record_session(outcome("zzzz", true)).unwrap();
        let similar = store.similar_tasks("open notepad and type hello world", 3);
        assert_eq!(similar.len(), 2);
        assert!(similar[0].success);
        assert!(similar.iter().all(|r| r.task != "zzzz"));
    }

    #[test]
    fn patterns_shared_with_related_families() {
        let store = JsonMemoryStore::in_memory();
        let mut o = outcome("search the web for rust", true);
        o.learned_patterns = vec!["press enter after typing the query".into()];
        store.record_session(o).unwrap();
        let ctx = store.context_for("open the browser");
        assert_eq!(ctx.success_patterns, vec!["press enter after typing the query"]);
    }

    #[test]
    fn failures_are_indexed_by_action_verb() {
        let store = JsonMemoryStore::in_memory();
        let mut o = outcome("close the dialog", false);
        o.error_kinds = vec!["popup_blocked".into()];
        store.record_session(o).unwrap();
        store.record_failure("click at (5, 5)", "popup_blocked");
        let ctx = store.context_for("anything");
        assert!(ctx.known_failures.contains(&"click: popup_blocked".to_string()));
        assert!(ctx.known_failures.contains(&"type: popup_blocked".to_string()));
        assert!(ctx.format_for_prompt().contains("KNOWN FAILURE MODES"));
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memory.json");
        {
            let store = JsonMemoryStore::open(&path);
            store.record_session(outcome("save the file", true)).unwrap();
        }
        let reopened = JsonMemoryStore::open(&path);
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.similar_tasks("save the file", 1)[0].steps, 4);
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::agent_engine::plan::Subtask;
use crate::config::ReflectionConfig;
use crate::llm::json::{extract_json_object, get_bool, get_f64, get_string};
use crate::llm::vision::VisionModel;
use crate::memory::store::{MemoryStore, TaskRecord};
use crate::perception::screenshot::Screenshot;

const VERIFY_SYSTEM: &str = "You judge objectively whether a subtask on a desktop has been completed.";
const ANALYZE_SYSTEM: &str = "You analyse why a desktop subtask failed and propose a different way to do it.";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReflectionResult {
    pub subtask_completed: bool,
    pub confidence: f64,
    pub observation: String,
    pub failure_reason: Option<String>,
    pub suggested_approach: Option<String>,
    pub should_retry: bool,
    #[serde(skip)]
    pub similar_cases: Vec<TaskRecord>,
}

fn head(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

fn format_cases(cases: &[TaskRecord]) -> String {
    if cases.is_empty() {
        return "none".to_string();
    }
    let mut lines = Vec::new();
    for (i, case) in cases.iter().take(3).enumerate() {
        let status = if case.success { "success" } else { "failed" };
        lines.push(format!("{}. [{status}] {} ({} steps)", i + 1, case.task, case.steps));
        lines.extend(case.actions.iter().take(3).map(|a| format!("   - {a}")));
    }
    lines.join("\n")
}

/// Subtask-level verification and failure analysis, with per-subtask
/// attempt bookkeeping.
pub struct ReflectionWorkflow {
    model: Arc<dyn VisionModel>,
    memory: Option<Arc<dyn MemoryStore>>,
    max_retries: u32,
    action_window: usize,
    /// Verification results per subtask id, oldest first.
    attempts: HashMap<String, Vec<ReflectionResult>>,
}

impl ReflectionWorkflow {
    pub fn new(model: Arc<dyn VisionModel>, memory: Option<Arc<dyn MemoryStore>>, config: &ReflectionConfig) -> Self {
        tracing::debug!(max_retries = config.max_retries, "reflection workflow ready");
        Self {
            model,
            memory,
            max_retries: config.max_retries,
            action_window: config.action_window.max(1),
            attempts: HashMap::new(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn recent_actions(&self, actions: &[String]) -> String {
        let skip = actions.len().saturating_sub(self.action_window);
        let lines: Vec<String> = actions[skip..].iter().map(|a| format!("  - {a}")).collect();
        if lines.is_empty() {
            "  (none)".to_string()
        } else {
            lines.join("\n")
        }
    }

    fn similar_cases(&self, subtask: &Subtask) -> Vec<TaskRecord> {
        self.memory
            .as_ref()
            .map(|m| m.similar_tasks(&subtask.description, 3))
            .unwrap_or_default()
    }

    /// Asks whether the subtask's success criterion holds. Model errors give
    /// an incomplete result that asks for a retry. Every call records an
    /// attempt for the subtask.
    pub async fn verify_subtask(&mut self, subtask: &Subtask, screenshot: &Screenshot, actions: &[String]) -> ReflectionResult {
        tracing::info!(subtask = %head(&subtask.description, 50), "verifying subtask");
        let similar = self.similar_cases(subtask);
        let prompt = format!(
            "Check whether this subtask is complete.\n\nSubtask: {}\nSuccess criterion: {}\n\n\
             Actions taken:\n{}\n\nSimilar past cases:\n{}\n\n\
             Reply with JSON only:\n\
             {{\"subtask_completed\": true|false, \"confidence\": 0.0-1.0, \
             \"observation\": \"what the screen shows\", \"failure_reason\": \"why not, if incomplete\"}}",
            subtask.description,
            subtask.success_criteria,
            self.recent_actions(actions),
            format_cases(&similar),
        );
        let result = match self.model.analyze(screenshot, &prompt, VERIFY_SYSTEM).await {
            Ok(reply) => parse_verify_reply(&reply, similar),
            Err(e) => {
                tracing::error!(error = %e, "subtask verification failed");
                ReflectionResult {
                    observation: format!("Verification error: {e}"),
                    should_retry: true,
                    ..ReflectionResult::default()
                }
            }
        };
        tracing::info!(
            completed = result.subtask_completed,
            confidence = result.confidence,
            "subtask verification result"
        );
        self.attempts.entry(subtask.id.clone()).or_default().push(result.clone());
        result
    }

    /// Works out why the subtask failed and what to try next, using earlier
    /// attempts and successful similar sessions.
    pub async fn reflect_on_failure(
        &self,
        subtask: &Subtask,
        screenshot: &Screenshot,
        actions: &[String],
        previous: &ReflectionResult,
    ) -> ReflectionResult {
        tracing::info!(subtask = %head(&subtask.description, 50), "reflecting on failure");
        let attempt_count = self.attempt_count(&subtask.id);
        let successes: Vec<TaskRecord> = self.similar_cases(subtask).into_iter().filter(|c| c.success).collect();
        let earlier: Vec<String> = self
            .attempts
            .get(&subtask.id)
            .map(|list| {
                list.iter()
                    .filter_map(|a| a.failure_reason.clone())
                    .map(|r| format!("  - {r}"))
                    .collect()
            })
            .unwrap_or_default();
        let prompt = format!(
            "A subtask failed. Find the root cause and propose a different approach.\n\n\
             Subtask: {}\nSuccess criterion: {}\n\nActions taken:\n{}\n\n\
             Attempts so far: {attempt_count}\nLast observation: {}\nLast failure: {}\n\
             Earlier failure reasons:\n{}\n\nSimilar successful cases:\n{}\n\n\
             Reply with JSON only:\n\
             {{\"confidence\": 0.0-1.0, \"observation\": \"...\", \"failure_reason\": \"...\", \
             \"suggested_approach\": \"concrete steps to try instead\", \"should_retry\": true|false}}",
            subtask.description,
            subtask.success_criteria,
            self.recent_actions(actions),
            previous.observation,
            previous.failure_reason.as_deref().unwrap_or("unknown"),
            if earlier.is_empty() { "  (none)".to_string() } else { earlier.join("\n") },
            format_cases(&successes),
        );
        let can_retry = (attempt_count as u32) < self.max_retries;
        let result = match self.model.analyze(screenshot, &prompt, ANALYZE_SYSTEM).await {
            Ok(reply) => parse_analyze_reply(&reply, can_retry),
            Err(e) => {
                tracing::error!(error = %e, "reflection analysis failed");
                ReflectionResult {
                    observation: format!("Reflection error: {e}"),
                    failure_reason: Some("Reflection analysis failed".into()),
                    should_retry: can_retry,
                    ..ReflectionResult::default()
                }
            }
        };
        tracing::info!(
            should_retry = result.should_retry,
            approach = %head(result.suggested_approach.as_deref().unwrap_or("none"), 50),
            "reflection result"
        );
        result
    }

    /// Final outcome for a subtask. Reports the last failure reason to memory
    /// on failure and drops the attempt history for the subtask. Returns a
    /// learned pattern when a retry with a suggested approach succeeded.
    pub fn record_outcome(&mut self, subtask: &Subtask, success: bool, total_attempts: u32) -> Option<String> {
        tracing::info!(
            subtask = %head(&subtask.description, 30),
            success,
            attempts = total_attempts,
            "recording subtask outcome"
        );
        let attempts = self.attempts.remove(&subtask.id).unwrap_or_default();
        if success {
            if total_attempts > 1 {
                return attempts
                    .iter()
                    .rev()
                    .find_map(|a| a.suggested_approach.clone())
                    .map(|approach| format!("Alternative approach: {approach}"));
            }
            return None;
        }
        if let (Some(memory), Some(reason)) = (
            &self.memory,
            attempts.iter().rev().find_map(|a| a.failure_reason.clone()),
        ) {
            memory.record_failure(&subtask.description, &reason);
        }
        None
    }

    /// Remembers the approach a reflection suggested so a later success can
    /// be credited to it.
    pub fn note_suggestion(&mut self, subtask: &Subtask, reflection: &ReflectionResult) {
        if let Some(last) = self.attempts.get_mut(&subtask.id).and_then(|l| l.last_mut()) {
            last.suggested_approach = reflection.suggested_approach.clone();
        }
    }

    pub fn attempt_count(&self, subtask_id: &str) -> usize {
        self.attempts.get(subtask_id).map_or(0, Vec::len)
    }

    pub fn should_continue_retry(&self, subtask_id: &str) -> bool {
        (self.attempt_count(subtask_id) as u32) < self.max_retries
    }

    /// Subtasks with live attempt bookkeeping.
    pub fn tracked_subtasks(&self) -> usize {
        self.attempts.len()
    }

    pub fn reset(&mut self) {
        self.attempts.clear();
    }
}

const DONE_WORDS: [&str; 6] = ["completed", "done", "finished", "完成", "成功", "success"];
const FAILED_WORDS: [&str; 5] = ["failed", "not complete", "incomplete", "失败", "未完成"];

pub fn parse_verify_reply(reply: &str, similar: Vec<TaskRecord>) -> ReflectionResult {
    if let Some(map) = extract_json_object(reply) {
        let completed = get_bool(&map, "subtask_completed")
            .or_else(|| get_bool(&map, "completed"))
            .unwrap_or(false);
        return ReflectionResult {
            subtask_completed: completed,
            confidence: get_f64(&map, "confidence").unwrap_or(0.5).clamp(0.0, 1.0),
            observation: get_string(&map, "observation").unwrap_or_else(|| head(reply, 500)),
            failure_reason: get_string(&map, "failure_reason"),
            suggested_approach: None,
            should_retry: !completed,
            similar_cases: similar,
        };
    }
    let lowered = reply.to_lowercase();
    let done = DONE_WORDS.iter().any(|w| lowered.contains(w));
    let failed = FAILED_WORDS.iter().any(|w| lowered.contains(w));
    ReflectionResult {
        subtask_completed: done && !failed,
        confidence: if done { 0.6 } else { 0.4 },
        observation: head(reply, 500),
        failure_reason: None,
        suggested_approach: None,
        should_retry: !done,
        similar_cases: similar,
    }
}

pub fn parse_analyze_reply(reply: &str, can_retry: bool) -> ReflectionResult {
    if let Some(map) = extract_json_object(reply) {
        return ReflectionResult {
            subtask_completed: false,
            confidence: get_f64(&map, "confidence").unwrap_or(0.5).clamp(0.0, 1.0),
            observation: get_string(&map, "observation").unwrap_or_else(|| head(reply, 500)),
            failure_reason: Some(get_string(&map, "failure_reason").unwrap_or_else(|| "Unknown".into())),
            suggested_approach: get_string(&map, "suggested_approach"),
            should_retry: get_bool(&map, "should_retry").unwrap_or(can_retry),
            similar_cases: Vec::new(),
        };
    }
    ReflectionResult {
        subtask_completed: false,
        confidence: 0.3,
        observation: head(reply, 500),
        failure_reason: Some("Could not parse reflection response".into()),
        suggested_approach: None,
        should_retry: can_retry,
        similar_cases: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::errors::{PilotError, PilotResult};
    use crate::memory::store::{JsonMemoryStore, SessionOutcome};

    struct Scripted {
        replies: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl VisionModel for Scripted {
        async fn analyze(&self, _s: &Screenshot, _p: &str, _sys: &str) -> PilotResult<String> {
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| PilotError::LlmProvider("script exhausted".into()))
        }

        async fn reason(&self, _p: &str, _sys: &str) -> PilotResult<String> {
            Err(PilotError::LlmProvider("unused".into()))
        }
    }

    fn subtask() -> Subtask {
        Subtask::new("2", "type hello into notepad", "hello is visible")
    }

    fn shot() -> Screenshot {
        Screenshot::blank(4, 4).unwrap()
    }

    #[test]
    fn verify_reply_json_and_keywords() {
        let r = parse_verify_reply(r#"{"subtask_completed": true, "confidence": 0.9}"#, Vec::new());
        assert!(r.subtask_completed && !r.should_retry);
        assert!((r.confidence - 0.9).abs() < 1e-9);

        let r = parse_verify_reply("任务已完成", Vec::new());
        assert!(r.subtask_completed);
        assert!((r.confidence - 0.6).abs() < 1e-9);

        let r = parse_verify_reply("The subtask is incomplete", Vec::new());
        assert!(!r.subtask_completed && r.should_retry);
        assert!((r.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn analyze_reply_fallbacks() {
        let r = parse_analyze_reply(r#"{"failure_reason": "wrong window", "suggested_approach": "focus notepad first"}"#, true);
        assert_eq!(r.failure_reason.as_deref(), Some("wrong window"));
        assert!(r.should_retry);
        let r = parse_analyze_reply("garbled", false);
        assert!(!r.should_retry);
        assert_eq!(r.confidence, 0.3);
    }

    #[tokio::test]
    async fn attempts_are_tracked_and_cleared_once() {
        let model = Scripted::new(&[
            r#"{"subtask_completed": false, "failure_reason": "text missing"}"#,
            r#"{"suggested_approach": "click the editor first", "should_retry": true}"#,
            r#"{"subtask_completed": true, "confidence": 0.8}"#,
        ]);
        let mut wf = ReflectionWorkflow::new(model, None, &ReflectionConfig::default());
        let st = subtask();
        let first = wf.verify_subtask(&st, &shot(), &["click at (1, 1)".into()]).await;
        assert!(!first.subtask_completed);
        assert!(wf.should_continue_retry(&st.id));

        let reflection = wf.reflect_on_failure(&st, &shot(), &[], &first).await;
        assert_eq!(reflection.suggested_approach.as_deref(), Some("click the editor first"));
        wf.note_suggestion(&st, &reflection);

        let second = wf.verify_subtask(&st, &shot(), &[]).await;
        assert!(second.subtask_completed);
        assert_eq!(wf.attempt_count(&st.id), 2);
        assert!(!wf.should_continue_retry(&st.id));

        let learned = wf.record_outcome(&st, true, 2);
        assert_eq!(learned.as_deref(), Some("Alternative approach: click the editor first"));
        assert_eq!(wf.attempt_count(&st.id), 0);
        assert_eq!(wf.tracked_subtasks(), 0);
        // second call finds nothing left to clear
        assert!(wf.record_outcome(&st, true, 2).is_none());
    }

    #[tokio::test]
    async fn model_errors_do_not_throw() {
        let mut wf = ReflectionWorkflow::new(Scripted::new(&[]), None, &ReflectionConfig::default());
        let r = wf.verify_subtask(&subtask(), &shot(), &[]).await;
        assert!(!r.subtask_completed && r.should_retry);
        assert_eq!(r.confidence, 0.0);
        let a = wf.reflect_on_failure(&subtask(), &shot(), &[], &r).await;
        // one attempt recorded, max_retries 2
        assert!(a.should_retry);
    }

    #[tokio::test]
    async fn failure_reason_reaches_memory() {
        let memory = Arc::new(JsonMemoryStore::in_memory());
        memory
            .record_session(SessionOutcome {
                task: "type hello into notepad".into(),
                success: true,
                steps: 2,
                ..SessionOutcome::default()
            })
            .unwrap();
        let model = Scripted::new(&[r#"{"subtask_completed": false, "failure_reason": "editor not focused"}"#]);
        let mut wf = ReflectionWorkflow::new(model, Some(memory.clone()), &ReflectionConfig::default());
        let r = wf.verify_subtask(&subtask(), &shot(), &[]).await;
        assert_eq!(r.similar_cases.len(), 1);
        wf.record_outcome(&subtask(), false, 3);
        let ctx = memory.context_for("anything");
        assert!(ctx.known_failures.iter().any(|f| f.contains("editor not focused")));
    }
}

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;

use crate::agent_engine::plan::{Subtask, SubtaskStatus, TaskPlan};
use crate::llm::json::{extract_json_object, get_bool, get_string};
use crate::llm::vision::VisionModel;
use crate::perception::screenshot::Screenshot;

const DECOMPOSE_SYSTEM: &str = "You break desktop tasks into short, independently verifiable subtasks.";

const CJK_KEYWORDS: [&str; 8] = ["并", "然后", "接着", "之后", "再", "首先", "最后", "同时"];

struct Patterns {
    english: Regex,
    multi_action: Vec<Regex>,
}

fn patterns() -> Option<&'static Patterns> {
    static P: OnceLock<Option<Patterns>> = OnceLock::new();
    P.get_or_init(|| {
        let english =
            Regex::new(r"\b(and|then|after|next|first|finally|also|before|while|followed by)\b").ok()?;
        let multi_action = [
            r"打开.*(输入|写|填)",
            r"点击.*(然后|再)",
            r"\bopen\b.*\b(type|write|enter)\b",
            r"\bclick\b.*\b(then|and)\b",
        ]
        .iter()
        .map(|p| Regex::new(p).ok())
        .collect::<Option<Vec<_>>>()?;
        Some(Patterns { english, multi_action })
    })
    .as_ref()
}

/// Splits complex tasks into a [`TaskPlan`] with the model's help.
pub struct TaskDecomposer {
    model: Arc<dyn VisionModel>,
    max_subtasks: usize,
}

impl TaskDecomposer {
    pub fn new(model: Arc<dyn VisionModel>, max_subtasks: usize) -> Self {
        Self {
            model,
            max_subtasks: max_subtasks.max(1),
        }
    }

    /// Cheap check run before asking the model: sequencing words, multi-verb
    /// phrasing, or a long task.
    pub fn should_decompose(task: &str) -> bool {
        let lowered = task.to_lowercase();
        let keyword = CJK_KEYWORDS.iter().any(|k| lowered.contains(k))
            || patterns().is_some_and(|p| p.english.is_match(&lowered));
        let multi_action = patterns().is_some_and(|p| p.multi_action.iter().any(|r| r.is_match(&lowered)));
        keyword || multi_action || task.chars().count() > 50
    }

    /// Never fails: model errors and unusable replies give a single-subtask plan.
    pub async fn decompose(&self, task: &str, screenshot: Option<&Screenshot>) -> TaskPlan {
        let prompt = format!(
            "Decide whether this task needs to be split into subtasks.\n\nTask: {task}\n\n\
             A single action (\"click X\", \"open Y\") needs no split. Otherwise give up to {max} \
             subtasks of one to three actions each, every one with a visually checkable success \
             criterion.\n\nReply with JSON only:\n\
             {{\"needs_decomposition\": true|false, \"reasoning\": \"...\", \"subtasks\": \
             [{{\"id\": \"1\", \"description\": \"...\", \"success_criteria\": \"...\"}}]}}",
            max = self.max_subtasks
        );
        let reply = match screenshot {
            Some(shot) => self.model.analyze(shot, &prompt, DECOMPOSE_SYSTEM).await,
            None => self.model.reason(&prompt, DECOMPOSE_SYSTEM).await,
        };
        let plan = match reply {
            Ok(text) => self.parse_plan(&text, task),
            Err(e) => {
                tracing::error!(error = %e, "task decomposition failed");
                TaskPlan::single(task)
            }
        };
        tracing::info!(subtasks = plan.len(), "task plan ready");
        for (i, s) in plan.subtasks.iter().enumerate() {
            tracing::debug!(index = i + 1, description = %s.description, "subtask");
        }
        plan
    }

    pub fn parse_plan(&self, reply: &str, task: &str) -> TaskPlan {
        let Some(map) = extract_json_object(reply) else {
            tracing::warn!("no JSON in decomposition reply");
            return TaskPlan::single(task);
        };
        if !get_bool(&map, "needs_decomposition").unwrap_or(false) {
            return TaskPlan::single(task);
        }
        let subtasks: Vec<Subtask> = map
            .get("subtasks")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_object)
                    .filter_map(|item| {
                        let description = get_string(item, "description")?;
                        Some((item, description))
                    })
                    .take(self.max_subtasks)
                    .enumerate()
                    .map(|(i, (item, description))| {
                        let id = match item.get("id") {
                            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
                            Some(Value::Number(n)) => n.to_string(),
                            _ => (i + 1).to_string(),
                        };
                        let criteria = get_string(item, "success_criteria")
                            .unwrap_or_else(|| "Subtask appears complete".to_string());
                        let mut subtask = Subtask::new(id, description, criteria);
                        if let Some(n) = item.get("estimated_steps").and_then(Value::as_u64) {
                            subtask.estimated_steps = n as u32;
                        }
                        subtask
                    })
                    .collect()
            })
            .unwrap_or_default();
        if subtasks.is_empty() {
            return TaskPlan::single(task);
        }
        TaskPlan::new(task, subtasks)
    }
}

/// Subtask section of the planning prompt.
pub fn subtask_context(plan: &TaskPlan) -> String {
    let Some(current) = plan.current() else {
        return String::new();
    };
    let mut lines = vec![
        format!("CURRENT SUBTASK ({}):", plan.progress()),
        format!("  Description: {}", current.description),
        format!("  Success criteria: {}", current.success_criteria),
    ];
    let completed: Vec<&Subtask> = plan
        .subtasks
        .iter()
        .filter(|s| s.status == SubtaskStatus::Completed)
        .collect();
    if !completed.is_empty() {
        lines.push("COMPLETED SUBTASKS:".into());
        let skip = completed.len().saturating_sub(3);
        lines.extend(completed[skip..].iter().map(|s| format!("  - {}", s.description)));
    }
    let upcoming: Vec<&Subtask> = plan.subtasks.iter().skip(plan.current_index + 1).take(2).collect();
    if !upcoming.is_empty() {
        lines.push("UPCOMING:".into());
        lines.extend(upcoming.iter().map(|s| format!("  - {}", s.description)));
    }
    lines.join("\n")
}

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::PilotResult;
use crate::llm::json::{extract_json_object, get_bool, get_string};
use crate::llm::vision::VisionModel;
use crate::perception::screenshot::Screenshot;

const VERIFY_SYSTEM: &str = "You check whether a desktop action had its intended effect. \
Look only at the screenshot and be objective.";

/// What the model saw after an action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub action_successful: bool,
    pub task_completed: bool,
    pub observation: String,
    pub issues: Option<String>,
    /// Explicit error kind name reported by the model, e.g. `permission_denied`.
    pub error_signal: Option<String>,
}

impl Verification {
    /// A passing verification, used when verification is disabled.
    pub fn assumed_ok() -> Self {
        Self {
            action_successful: true,
            ..Self::default()
        }
    }

    /// Verification describing a dispatch failure.
    pub fn dispatch_failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            action_successful: false,
            observation: message.clone(),
            issues: Some(message),
            ..Self::default()
        }
    }

    pub fn has_issues(&self) -> bool {
        !self.action_successful || self.issues.is_some()
    }

    pub fn issue_text(&self) -> &str {
        self.issues.as_deref().unwrap_or(&self.observation)
    }
}

fn meaningful(text: Option<String>) -> Option<String> {
    text.filter(|s| !matches!(s.to_lowercase().as_str(), "null" | "none" | "n/a" | "no issues"))
}

/// JSON first; otherwise keyword heuristics over the reply.
pub fn parse_verification(reply: &str) -> Verification {
    if let Some(map) = extract_json_object(reply) {
        return Verification {
            action_successful: get_bool(&map, "action_successful").unwrap_or(false),
            task_completed: get_bool(&map, "task_completed").unwrap_or(false),
            observation: get_string(&map, "observation").unwrap_or_default(),
            issues: meaningful(get_string(&map, "issues")),
            error_signal: meaningful(get_string(&map, "error_type").or_else(|| get_string(&map, "error_signal"))),
        };
    }
    tracing::warn!("no JSON in verification reply, using heuristics");
    let lowered = reply.to_lowercase();
    let failed = ["fail", "not ", "失败"].iter().any(|w| lowered.contains(w));
    let succeeded = ["success", "成功"].iter().any(|w| lowered.contains(w));
    Verification {
        action_successful: succeeded && !failed,
        task_completed: ["completed", "done", "完成"].iter().any(|w| lowered.contains(w)) && !failed,
        observation: reply.chars().take(500).collect(),
        issues: None,
        error_signal: None,
    }
}

/// Asks the model whether the last action worked.
pub struct Verifier {
    model: Arc<dyn VisionModel>,
}

impl Verifier {
    pub fn new(model: Arc<dyn VisionModel>) -> Self {
        Self { model }
    }

    pub async fn verify_action(&self, screenshot: &Screenshot, task: &str, action: &str) -> PilotResult<Verification> {
        let prompt = format!(
            "Task: {task}\nAction taken: {action}\n\n\
             Look at the current screen and judge the result of the action.\n\
             Reply with JSON only:\n\
             {{\"action_successful\": true|false, \"task_completed\": true|false, \
             \"observation\": \"what is on screen\", \"issues\": \"problems seen, or null\", \
             \"error_type\": \"permission_denied | unexpected_state | null\"}}"
        );
        let reply = self.model.analyze(screenshot, &prompt, VERIFY_SYSTEM).await?;
        let verification = parse_verification(&reply);
        tracing::debug!(
            ok = verification.action_successful,
            completed = verification.task_completed,
            observation = %verification.observation.chars().take(100).collect::<String>(),
            "verification"
        );
        Ok(verification)
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent_engine::plan::TaskPlan;
use crate::agent_engine::verifier::Verification;
use crate::perception::marks::MarkTable;
use crate::recovery::classifier::ErrorEvent;

/// Lifecycle states of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Planning,
    Decomposing,
    Executing,
    Verifying,
    Recovering,
    Completed,
    Failed,
}

impl AgentStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, AgentStatus::Completed | AgentStatus::Failed)
    }
}

/// Shared flag that asks a running engine to stop at the next step boundary.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Mutable state of one run.
#[derive(Debug)]
pub struct SessionState {
    pub task: String,
    pub status: AgentStatus,
    pub step: u32,
    pub max_steps: u32,
    pub completed: bool,
    pub failed: bool,
    pub last_action: Option<String>,
    /// Every dispatched action, in order.
    pub action_history: Vec<String>,
    pub plan: Option<TaskPlan>,
    /// Recovery attempts within the current step.
    pub recovery_attempts: u32,
    pub last_verification: Option<Verification>,
    pub error_history: Vec<ErrorEvent>,
    pub marks: MarkTable,
    /// Suggested approach from the last reflection, consumed by planning.
    pub reflection_hint: Option<String>,
    /// Actions of the current subtask attempt.
    pub subtask_actions: Vec<String>,
    pub last_error: Option<String>,
}

impl SessionState {
    pub fn new(task: impl Into<String>, max_steps: u32) -> Self {
        Self {
            task: task.into(),
            status: AgentStatus::Idle,
            step: 0,
            max_steps,
            completed: false,
            failed: false,
            last_action: None,
            action_history: Vec::new(),
            plan: None,
            recovery_attempts: 0,
            last_verification: None,
            error_history: Vec::new(),
            marks: MarkTable::new(),
            reflection_hint: None,
            subtask_actions: Vec::new(),
            last_error: None,
        }
    }

    pub fn set_status(&mut self, status: AgentStatus) {
        if self.status != status {
            tracing::debug!(from = ?self.status, to = ?status, step = self.step, "status change");
            self.status = status;
        }
    }

    pub fn budget_left(&self) -> u32 {
        self.max_steps.saturating_sub(self.step)
    }

    pub fn record_action(&mut self, action: impl Into<String>) {
        let action = action.into();
        self.action_history.push(action.clone());
        self.subtask_actions.push(action.clone());
        self.last_action = Some(action);
    }

    /// The last `n` actions of the run, oldest first.
    pub fn recent_actions(&self, n: usize) -> &[String] {
        let skip = self.action_history.len().saturating_sub(n);
        &self.action_history[skip..]
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(step = self.step, reason = %message, "run failed");
        self.failed = true;
        self.last_error = Some(message);
        self.set_status(AgentStatus::Failed);
    }

    pub fn complete(&mut self) {
        self.completed = true;
        self.set_status(AgentStatus::Completed);
    }

    pub fn is_finished(&self) -> bool {
        self.completed || self.failed
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            success: self.completed && !self.failed,
            steps: self.step,
            status: self.status,
            last_error: self.last_error.clone(),
            error_history: self.error_history.clone(),
            plan: self.plan.clone(),
        }
    }
}

/// Outcome of [`crate::agent_engine::engine::Engine::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub success: bool,
    pub steps: u32,
    pub status: AgentStatus,
    pub last_error: Option<String>,
    pub error_history: Vec<ErrorEvent>,
    pub plan: Option<TaskPlan>,
}

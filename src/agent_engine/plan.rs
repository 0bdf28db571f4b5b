use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// One independently verifiable unit of a decomposed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    pub success_criteria: String,
    pub estimated_steps: u32,
    pub status: SubtaskStatus,
    pub actual_steps: u32,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Subtask {
    pub fn new(id: impl Into<String>, description: impl Into<String>, success_criteria: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            success_criteria: success_criteria.into(),
            estimated_steps: 3,
            status: SubtaskStatus::Pending,
            actual_steps: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self) {
        self.status = SubtaskStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.status = SubtaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = SubtaskStatus::Failed;
        self.error_message = Some(error.into());
        self.completed_at = Some(Utc::now());
    }
}

/// Ordered subtasks with a cursor. At most one subtask is in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub original_task: String,
    pub subtasks: Vec<Subtask>,
    pub current_index: usize,
    pub created_at: DateTime<Utc>,
}

impl TaskPlan {
    pub fn new(original_task: impl Into<String>, subtasks: Vec<Subtask>) -> Self {
        Self {
            original_task: original_task.into(),
            subtasks,
            current_index: 0,
            created_at: Utc::now(),
        }
    }

    /// Plan with the whole task as its only subtask.
    pub fn single(task: &str) -> Self {
        Self::new(task, vec![Subtask::new("1", task, "The task is complete")])
    }

    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    pub fn current(&self) -> Option<&Subtask> {
        self.subtasks.get(self.current_index)
    }

    pub fn current_mut(&mut self) -> Option<&mut Subtask> {
        self.subtasks.get_mut(self.current_index)
    }

    /// `completed/total`.
    pub fn progress(&self) -> String {
        let done = self
            .subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Completed)
            .count();
        format!("{done}/{}", self.subtasks.len())
    }

    pub fn start(&mut self) {
        if let Some(first) = self.subtasks.first_mut() {
            first.start();
        }
    }

    /// Completes the current subtask if it is still in progress and starts
    /// the next one. Returns false when there is no next subtask.
    pub fn advance(&mut self) -> bool {
        if let Some(cur) = self.current_mut() {
            if cur.status == SubtaskStatus::InProgress {
                cur.complete();
            }
        }
        self.current_index += 1;
        match self.subtasks.get_mut(self.current_index) {
            Some(next) => {
                next.start();
                true
            }
            None => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.subtasks
            .iter()
            .all(|s| matches!(s.status, SubtaskStatus::Completed | SubtaskStatus::Skipped))
    }

    pub fn has_failures(&self) -> bool {
        self.subtasks.iter().any(|s| s.status == SubtaskStatus::Failed)
    }

    pub fn statuses(&self) -> Vec<SubtaskStatus> {
        self.subtasks.iter().map(|s| s.status).collect()
    }
}

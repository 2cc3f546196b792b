use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::Stage;
use crate::error::FailureReason;

/// Task identity: the ordinal assigned by the scheduler at dispatch time.
pub type TaskId = u64;

/// How a task attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Pending,
    Succeeded,
    /// Cancelled by an operator. Neither a success nor a failure.
    Skipped,
    Failed(FailureReason),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }

    pub(crate) fn terminal_stage(&self) -> Stage {
        match self {
            TaskOutcome::Pending => Stage::Starting,
            TaskOutcome::Succeeded => Stage::Succeeded,
            TaskOutcome::Skipped => Stage::Skipped,
            TaskOutcome::Failed(_) => Stage::Failed,
        }
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutcome::Pending => write!(f, "pending"),
            TaskOutcome::Succeeded => write!(f, "succeeded"),
            TaskOutcome::Skipped => write!(f, "skipped"),
            TaskOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// One end-to-end attempt at the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub stage: Stage,
    pub stage_history: Vec<Stage>,
    pub outcome: TaskOutcome,
    /// Identity of the pooled resource checked out for this attempt.
    pub resource: Option<String>,
    /// Address of the credential consumed by this attempt.
    pub credential: Option<String>,
    /// Candidate answers submitted to the challenge channel.
    pub submissions: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            stage: Stage::Starting,
            stage_history: Vec::new(),
            outcome: TaskOutcome::Pending,
            resource: None,
            credential: None,
            submissions: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Structured record produced when a task settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: TaskId,
    pub outcome: TaskOutcome,
    pub stages: Vec<Stage>,
    pub submissions: u32,
    pub resource: Option<String>,
    pub credential: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl TaskRecord {
    pub fn from_task(task: &Task) -> Self {
        let completed_at = task.finished_at.unwrap_or_else(Utc::now);
        let mut stages = task.stage_history.clone();
        stages.push(task.stage);

        Self {
            task: task.id,
            outcome: task.outcome.clone(),
            stages,
            submissions: task.submissions,
            resource: task.resource.clone(),
            credential: task.credential.clone(),
            started_at: task.started_at,
            completed_at,
            duration_ms: (completed_at - task.started_at).num_milliseconds(),
        }
    }
}

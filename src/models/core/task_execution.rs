use super::step_execution::StepExecution;
use crate::state_machine::RunStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One run of a task. Maps to the `plumber_task_executions` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ordered by `step_index`; only populated by single-execution reads
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepExecution>,
}

impl TaskExecution {
    pub(crate) fn started(task_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            status: RunStatus::Running,
            start_time: Some(now),
            end_time: None,
            created_at: now,
            updated_at: now,
            steps: Vec::new(),
        }
    }

    /// Step with the highest index created so far
    pub fn last_step(&self) -> Option<&StepExecution> {
        self.steps.iter().max_by_key(|s| s.step_index)
    }
}

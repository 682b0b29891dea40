use crate::error::Result;
use crate::models::task_config::TaskConfig;
use crate::state_machine::RunStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operator-defined workflow. Maps to the `plumber_tasks` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Step-list document, see [`TaskConfig`]
    pub config: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn parse_config(&self) -> Result<TaskConfig> {
        TaskConfig::parse(&self.config)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub config: String,
}

impl NewTask {
    pub(crate) fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            id: Uuid::new_v4(),
            name: self.name,
            description: self.description,
            config: self.config,
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

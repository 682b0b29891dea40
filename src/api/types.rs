//! Request and response payloads for [`PlumberService`](super::PlumberService).
//!
//! Identifiers arrive as strings so that malformed values surface as
//! validation errors rather than deserialization failures.

use crate::models::{AssignedStep, SshAuthType, TaskExecution};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAgentParams {
    pub agent_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentIdParams {
    pub agent_id: String,
}

/// Partial update; `None` keeps the stored value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateAgentParams {
    pub agent_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ssh_host: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<i32>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub ssh_auth_type: Option<SshAuthType>,
    #[serde(default)]
    pub ssh_password: Option<String>,
    #[serde(default)]
    pub ssh_private_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskIdParams {
    pub task_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateTaskParams {
    pub task_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionIdParams {
    pub execution_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListExecutionsParams {
    pub task_id: String,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Terminal result sent by an agent after running a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportParams {
    pub step_id: String,
    pub status: String,
    pub exit_code: i32,
    #[serde(default)]
    pub output: String,
}

/// Answer to an agent poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub has_task: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<AssignedStep>,
}

impl PollResponse {
    pub fn empty() -> Self {
        Self {
            has_task: false,
            task: None,
        }
    }

    pub fn with_task(task: AssignedStep) -> Self {
        Self {
            has_task: true,
            task: Some(task),
        }
    }
}

/// Generic acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusResponse {
    pub fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
            message: None,
        }
    }

    pub fn with_message(status: &str, message: &str) -> Self {
        Self {
            status: status.to_string(),
            message: Some(message.to_string()),
        }
    }
}

/// Outcome of applying a step report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    /// Step moved to the reported terminal status
    Updated,
    /// Step was already terminal; nothing changed
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportResponse {
    pub status: ReportOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTaskResponse {
    pub status: String,
    pub execution_id: Uuid,
    pub execution: TaskExecution,
}

/// Contents of an agent's `agent.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigDocument {
    pub id: Uuid,
    pub token: String,
    pub server_addr: String,
}

/// Rendered agent configuration ready to be written to disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigFile {
    /// Pretty-printed [`AgentConfigDocument`]
    pub config: String,
    pub filename: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_poll_omits_task() {
        let value = serde_json::to_value(PollResponse::empty()).unwrap();
        assert_eq!(value, json!({ "has_task": false }));
    }

    #[test]
    fn test_poll_with_task_shape() {
        let step_id = Uuid::new_v4();
        let value = serde_json::to_value(PollResponse::with_task(AssignedStep {
            step_id,
            path: "/srv/app".into(),
            command: "make".into(),
        }))
        .unwrap();
        assert_eq!(
            value,
            json!({
                "has_task": true,
                "task": { "step_id": step_id, "path": "/srv/app", "command": "make" }
            })
        );
    }

    #[test]
    fn test_report_params_default_output() {
        let params: ReportParams = serde_json::from_value(json!({
            "step_id": "abc",
            "status": "success",
            "exit_code": 0
        }))
        .unwrap();
        assert_eq!(params.output, "");
    }
}

//! Method dispatch table: a JSON-RPC method name plus its raw params become
//! one typed [`RpcMethod`] variant.

use crate::api::{
    AgentIdParams, ExecutionIdParams, ListExecutionsParams, RegisterAgentParams, ReportParams,
    TaskIdParams, UpdateAgentParams, UpdateTaskParams,
};
use crate::models::{NewAgent, NewTask};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MethodParseError {
    #[error("Method not found: {0}")]
    UnknownMethod(String),
    #[error("Invalid params for {method}: {reason}")]
    InvalidParams { method: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub enum RpcMethod {
    // Agent-facing
    AgentRegister(RegisterAgentParams),
    AgentHeartbeat(AgentIdParams),
    AgentPollTask(AgentIdParams),
    StepReport(ReportParams),

    // Agent administration
    AgentCreate(NewAgent),
    AgentList,
    AgentGet(AgentIdParams),
    AgentUpdate(UpdateAgentParams),
    AgentDelete(AgentIdParams),
    AgentGetConfig(AgentIdParams),

    // Tasks and executions
    TaskCreate(NewTask),
    TaskGet(TaskIdParams),
    TaskList,
    TaskUpdate(UpdateTaskParams),
    TaskDelete(TaskIdParams),
    TaskRun(TaskIdParams),
    ExecutionGet(ExecutionIdParams),
    ExecutionList(ListExecutionsParams),
}

pub const AGENT_REGISTER: &str = "plumber.agent.register";
pub const AGENT_HEARTBEAT: &str = "plumber.agent.heartbeat";
pub const AGENT_POLL_TASK: &str = "plumber.agent.pollTask";
pub const STEP_REPORT: &str = "plumber.step.report";
pub const AGENT_CREATE: &str = "plumber.agent.create";
pub const AGENT_LIST: &str = "plumber.agent.list";
pub const AGENT_GET: &str = "plumber.agent.get";
pub const AGENT_UPDATE: &str = "plumber.agent.update";
pub const AGENT_DELETE: &str = "plumber.agent.delete";
pub const AGENT_GET_CONFIG: &str = "plumber.agent.getConfig";
pub const TASK_CREATE: &str = "plumber.task.create";
pub const TASK_GET: &str = "plumber.task.get";
pub const TASK_LIST: &str = "plumber.task.list";
pub const TASK_UPDATE: &str = "plumber.task.update";
pub const TASK_DELETE: &str = "plumber.task.delete";
pub const TASK_RUN: &str = "plumber.task.run";
pub const EXECUTION_GET: &str = "plumber.execution.get";
pub const EXECUTION_LIST: &str = "plumber.execution.list";

fn params<T: DeserializeOwned>(method: &'static str, raw: Value) -> Result<T, MethodParseError> {
    serde_json::from_value(raw).map_err(|e| MethodParseError::InvalidParams {
        method,
        reason: e.to_string(),
    })
}

impl RpcMethod {
    pub fn parse(method: &str, raw: Value) -> Result<Self, MethodParseError> {
        let parsed = match method {
            AGENT_REGISTER => Self::AgentRegister(params(AGENT_REGISTER, raw)?),
            AGENT_HEARTBEAT => Self::AgentHeartbeat(params(AGENT_HEARTBEAT, raw)?),
            AGENT_POLL_TASK => Self::AgentPollTask(params(AGENT_POLL_TASK, raw)?),
            STEP_REPORT => Self::StepReport(params(STEP_REPORT, raw)?),
            AGENT_CREATE => Self::AgentCreate(params(AGENT_CREATE, raw)?),
            AGENT_LIST => Self::AgentList,
            AGENT_GET => Self::AgentGet(params(AGENT_GET, raw)?),
            AGENT_UPDATE => Self::AgentUpdate(params(AGENT_UPDATE, raw)?),
            AGENT_DELETE => Self::AgentDelete(params(AGENT_DELETE, raw)?),
            AGENT_GET_CONFIG => Self::AgentGetConfig(params(AGENT_GET_CONFIG, raw)?),
            TASK_CREATE => Self::TaskCreate(params(TASK_CREATE, raw)?),
            TASK_GET => Self::TaskGet(params(TASK_GET, raw)?),
            TASK_LIST => Self::TaskList,
            TASK_UPDATE => Self::TaskUpdate(params(TASK_UPDATE, raw)?),
            TASK_DELETE => Self::TaskDelete(params(TASK_DELETE, raw)?),
            TASK_RUN => Self::TaskRun(params(TASK_RUN, raw)?),
            EXECUTION_GET => Self::ExecutionGet(params(EXECUTION_GET, raw)?),
            EXECUTION_LIST => Self::ExecutionList(params(EXECUTION_LIST, raw)?),
            other => return Err(MethodParseError::UnknownMethod(other.to_string())),
        };
        Ok(parsed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentRegister(_) => AGENT_REGISTER,
            Self::AgentHeartbeat(_) => AGENT_HEARTBEAT,
            Self::AgentPollTask(_) => AGENT_POLL_TASK,
            Self::StepReport(_) => STEP_REPORT,
            Self::AgentCreate(_) => AGENT_CREATE,
            Self::AgentList => AGENT_LIST,
            Self::AgentGet(_) => AGENT_GET,
            Self::AgentUpdate(_) => AGENT_UPDATE,
            Self::AgentDelete(_) => AGENT_DELETE,
            Self::AgentGetConfig(_) => AGENT_GET_CONFIG,
            Self::TaskCreate(_) => TASK_CREATE,
            Self::TaskGet(_) => TASK_GET,
            Self::TaskList => TASK_LIST,
            Self::TaskUpdate(_) => TASK_UPDATE,
            Self::TaskDelete(_) => TASK_DELETE,
            Self::TaskRun(_) => TASK_RUN,
            Self::ExecutionGet(_) => EXECUTION_GET,
            Self::ExecutionList(_) => EXECUTION_LIST,
        }
    }

    /// Methods called by agent processes rather than operators
    pub fn is_agent_method(&self) -> bool {
        matches!(
            self,
            Self::AgentRegister(_)
                | Self::AgentHeartbeat(_)
                | Self::AgentPollTask(_)
                | Self::StepReport(_)
        )
    }
}

use super::types::*;
use crate::config::PlumberConfig;
use crate::error::{PlumberError, Result};
use crate::logging::{log_agent_operation, log_step_operation};
use crate::models::{
    Agent, NewAgent, NewTask, StepCompletion, StepUpdate, Task, TaskConfig, TaskExecution,
};
use crate::orchestration::{ExecutionOrchestrator, StepAssignmentScheduler};
use crate::state_machine::RunStatus;
use crate::store::{retry_with_backoff, StateStore};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const AGENT_CONFIG_FILENAME: &str = "agent.json";

fn parse_id(field: &str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|e| PlumberError::validation(format!("invalid {field}: {e}")))
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(PlumberError::validation(format!("{field} is required")));
    }
    Ok(())
}

/// Operator and agent operations over the shared store and orchestrator
#[derive(Debug, Clone)]
pub struct PlumberService {
    store: Arc<dyn StateStore>,
    scheduler: Arc<StepAssignmentScheduler>,
    orchestrator: Arc<ExecutionOrchestrator>,
    config: Arc<PlumberConfig>,
}

impl PlumberService {
    pub fn new(
        store: Arc<dyn StateStore>,
        scheduler: Arc<StepAssignmentScheduler>,
        orchestrator: Arc<ExecutionOrchestrator>,
        config: Arc<PlumberConfig>,
    ) -> Self {
        Self {
            store,
            scheduler,
            orchestrator,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<ExecutionOrchestrator> {
        &self.orchestrator
    }

    // =========================================================================
    // Agent-facing operations
    // =========================================================================

    /// Bring a pre-created agent online with its reported host details.
    /// Unknown agents are rejected; they must be created by an operator first.
    #[instrument(skip(self, params), fields(agent_id = %params.agent_id))]
    pub async fn register_agent(&self, params: RegisterAgentParams) -> Result<Agent> {
        let agent_id = parse_id("agent_id", &params.agent_id)?;
        let agent = self
            .store
            .register_agent(agent_id, &params.hostname, &params.ip)
            .await?;
        log_agent_operation(
            "register",
            agent.id,
            agent.status.as_str(),
            Some(&format!("hostname={} ip={}", params.hostname, params.ip)),
        );
        Ok(agent)
    }

    pub async fn heartbeat(&self, agent_id: &str) -> Result<StatusResponse> {
        let agent_id = parse_id("agent_id", agent_id)?;
        retry_with_backoff(&self.config.backoff, "heartbeat", || {
            self.store.heartbeat(agent_id)
        })
        .await?;
        debug!(%agent_id, "Heartbeat recorded");
        Ok(StatusResponse::new("ok"))
    }

    /// Hand the agent at most one eligible step
    pub async fn poll_task(&self, agent_id: &str) -> Result<PollResponse> {
        let agent_id = parse_id("agent_id", agent_id)?;
        Ok(match self.scheduler.poll(agent_id).await? {
            Some(task) => PollResponse::with_task(task),
            None => PollResponse::empty(),
        })
    }

    /// Apply a terminal step result.
    ///
    /// A `success` report with a non-zero exit code is stored as `failed`.
    /// Reports for steps that already finished are accepted and ignored.
    #[instrument(skip(self, params), fields(step_id = %params.step_id))]
    pub async fn report_step(&self, params: ReportParams) -> Result<ReportResponse> {
        let step_id = parse_id("step_id", &params.step_id)?;
        let mut status: RunStatus = params.status.parse().map_err(PlumberError::Validation)?;
        if !status.is_terminal() {
            return Err(PlumberError::validation(format!(
                "status must be success or failed, got {status}"
            )));
        }
        if status == RunStatus::Success && params.exit_code != 0 {
            status = RunStatus::Failed;
        }

        let update = self
            .store
            .complete_step(StepCompletion {
                step_id,
                status,
                exit_code: params.exit_code,
                output: params.output,
            })
            .await?;

        let outcome = match &update {
            StepUpdate::Applied(step) => {
                self.orchestrator.notify_step_finished(step.id);
                ReportOutcome::Updated
            }
            StepUpdate::AlreadyFinished(_) => ReportOutcome::Ignored,
        };

        let step = update.step();
        log_step_operation(
            "report",
            step.execution_id,
            Some(step.id),
            step.step_index as usize,
            step.status.as_str(),
            Some(&format!(
                "exit_code={} outcome={outcome:?}",
                params.exit_code
            )),
        );
        Ok(ReportResponse { status: outcome })
    }

    // =========================================================================
    // Agent administration
    // =========================================================================

    pub async fn create_agent(&self, params: NewAgent) -> Result<Agent> {
        require_non_empty("name", &params.name)?;
        let agent = self.store.create_agent(params).await?;
        log_agent_operation("create", agent.id, agent.status.as_str(), Some(&agent.name));
        Ok(agent)
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.store.list_agents().await?)
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Agent> {
        let agent_id = parse_id("agent_id", agent_id)?;
        Ok(self.store.get_agent(agent_id).await?)
    }

    pub async fn update_agent(&self, params: UpdateAgentParams) -> Result<Agent> {
        let agent_id = parse_id("agent_id", &params.agent_id)?;
        let mut agent = self.store.get_agent(agent_id).await?;

        if let Some(name) = params.name {
            require_non_empty("name", &name)?;
            agent.name = name;
        }
        if let Some(host) = params.ssh_host {
            agent.ssh_host = Some(host);
        }
        if let Some(port) = params.ssh_port {
            if !(1..=65535).contains(&port) {
                return Err(PlumberError::validation(format!("invalid ssh_port: {port}")));
            }
            agent.ssh_port = port;
        }
        if let Some(user) = params.ssh_user {
            agent.ssh_user = Some(user);
        }
        if let Some(auth) = params.ssh_auth_type {
            agent.ssh_auth_type = auth;
        }
        if let Some(password) = params.ssh_password {
            agent.ssh_password = Some(password);
        }
        if let Some(key) = params.ssh_private_key {
            agent.ssh_private_key = Some(key);
        }

        let updated = self.store.update_agent(&agent).await?;
        log_agent_operation("update", updated.id, updated.status.as_str(), None);
        Ok(updated)
    }

    pub async fn delete_agent(&self, agent_id: &str) -> Result<StatusResponse> {
        let agent_id = parse_id("agent_id", agent_id)?;
        self.store.delete_agent(agent_id).await?;
        log_agent_operation("delete", agent_id, "deleted", None);
        Ok(StatusResponse::new("deleted"))
    }

    /// Render the `agent.json` an agent process needs to reach this server
    pub async fn get_agent_config(&self, agent_id: &str) -> Result<AgentConfigFile> {
        let agent_id = parse_id("agent_id", agent_id)?;
        self.store.get_agent(agent_id).await?;

        let document = AgentConfigDocument {
            id: agent_id,
            token: self.config.server.agent_token.clone(),
            server_addr: self.config.server.export_endpoint.clone(),
        };
        Ok(AgentConfigFile {
            config: serde_json::to_string_pretty(&document)?,
            filename: AGENT_CONFIG_FILENAME.to_string(),
        })
    }

    // =========================================================================
    // Tasks and executions
    // =========================================================================

    pub async fn create_task(&self, params: NewTask) -> Result<Task> {
        require_non_empty("name", &params.name)?;
        let steps = TaskConfig::parse(&params.config)?;
        let task = self.store.create_task(params).await?;
        info!(task_id = %task.id, steps = steps.len(), "Task created");
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        let task_id = parse_id("task_id", task_id)?;
        Ok(self.store.get_task(task_id).await?)
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks().await?)
    }

    pub async fn update_task(&self, params: UpdateTaskParams) -> Result<Task> {
        let task_id = parse_id("task_id", &params.task_id)?;
        let mut task = self.store.get_task(task_id).await?;

        if let Some(name) = params.name {
            require_non_empty("name", &name)?;
            task.name = name;
        }
        if let Some(description) = params.description {
            task.description = description;
        }
        if let Some(config) = params.config {
            TaskConfig::parse(&config)?;
            task.config = config;
        }

        Ok(self.store.update_task(&task).await?)
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<StatusResponse> {
        let task_id = parse_id("task_id", task_id)?;
        self.store.delete_task(task_id).await?;
        info!(%task_id, "Task deleted");
        Ok(StatusResponse::new("deleted"))
    }

    /// Start an execution and return without waiting for it
    pub async fn run_task(&self, task_id: &str) -> Result<RunTaskResponse> {
        let task_id = parse_id("task_id", task_id)?;
        let execution = self.orchestrator.start_execution(task_id).await?;
        Ok(RunTaskResponse {
            status: "started".to_string(),
            execution_id: execution.id,
            execution,
        })
    }

    /// Execution with its steps ordered by `step_index`
    pub async fn get_execution(&self, execution_id: &str) -> Result<TaskExecution> {
        let execution_id = parse_id("execution_id", execution_id)?;
        Ok(self.store.get_execution(execution_id).await?)
    }

    /// Most recent executions of a task, newest first
    pub async fn list_executions(&self, params: ListExecutionsParams) -> Result<Vec<TaskExecution>> {
        let task_id = parse_id("task_id", &params.task_id)?;
        let limit = params
            .limit
            .filter(|limit| *limit > 0)
            .unwrap_or(self.config.orchestrator.list_executions_limit);
        Ok(self.store.list_executions_for_task(task_id, limit).await?)
    }
}

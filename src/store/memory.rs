//! # In-Memory State Store
//!
//! All records live behind one `parking_lot::Mutex`. Holding that lock for the
//! whole of a claim gives the same contract as the Postgres row locks: the
//! candidate scan, eligibility check and `assigned` write happen as one unit,
//! so a concurrent poller can never observe a step between selection and
//! assignment.
//!
//! Intended for tests and single-process deployments; nothing is persisted.

use super::StateStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    Agent, NewAgent, NewStepExecution, NewTask, StepCompletion, StepExecution, StepUpdate, Task,
    TaskExecution,
};
use crate::state_machine::{AgentStatus, RunStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

#[derive(Debug, Default)]
struct StoreState {
    agents: HashMap<Uuid, Agent>,
    tasks: HashMap<Uuid, Task>,
    executions: HashMap<Uuid, TaskExecution>,
    /// Creation order of executions
    execution_order: Vec<Uuid>,
    steps: HashMap<Uuid, StepExecution>,
    /// Creation order of steps; claims hand out the oldest first
    step_order: Vec<Uuid>,
}

impl StoreState {
    fn agent_mut(&mut self, id: Uuid) -> StoreResult<&mut Agent> {
        self.agents
            .get_mut(&id)
            .filter(|a| a.deleted_at.is_none())
            .ok_or_else(|| StoreError::not_found("agent", id))
    }

    fn task_mut(&mut self, id: Uuid) -> StoreResult<&mut Task> {
        self.tasks
            .get_mut(&id)
            .filter(|t| t.deleted_at.is_none())
            .ok_or_else(|| StoreError::not_found("task", id))
    }

    fn step_mut(&mut self, id: Uuid) -> StoreResult<&mut StepExecution> {
        self.steps
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("step", id))
    }

    fn steps_of(&self, execution_id: Uuid) -> Vec<StepExecution> {
        let mut steps: Vec<StepExecution> = self
            .steps
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_index);
        steps
    }

    fn with_steps(&self, execution: &TaskExecution) -> TaskExecution {
        let mut execution = execution.clone();
        execution.steps = self.steps_of(execution.id);
        execution
    }

    fn is_eligible(&self, candidate: &StepExecution) -> bool {
        candidate.is_claimable()
            && candidate.predecessors_satisfied(
                self.steps
                    .values()
                    .filter(|s| s.execution_id == candidate.execution_id),
            )
    }
}

#[derive(Debug)]
pub struct InMemoryStateStore {
    state: Mutex<StoreState>,
    available: AtomicBool,
    /// Remaining injected `Unavailable` failures per operation name
    injected_failures: Mutex<HashMap<&'static str, u32>>,
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            available: AtomicBool::new(true),
            injected_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Simulate a storage outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Overwrite an agent's heartbeat timestamp
    pub fn set_last_heartbeat(&self, agent_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.agent_mut(agent_id)?.last_heartbeat = Some(at);
        Ok(())
    }

    /// Make the next `times` calls of `operation` (`"start_step"` or
    /// `"complete_step"`) fail with [`StoreError::Unavailable`]
    pub fn fail_next(&self, operation: &'static str, times: u32) {
        self.injected_failures.lock().insert(operation, times);
    }

    fn check_operation(&self, operation: &'static str) -> StoreResult<()> {
        self.check_available()?;
        let mut injected = self.injected_failures.lock();
        match injected.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Unavailable(format!("injected {operation} failure")))
            }
            _ => Ok(()),
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_agent(&self, agent: NewAgent) -> StoreResult<Agent> {
        self.check_available()?;
        let agent = agent.into_agent(Utc::now());
        self.state.lock().agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, id: Uuid) -> StoreResult<Agent> {
        self.check_available()?;
        Ok(self.state.lock().agent_mut(id)?.clone())
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        self.check_available()?;
        let state = self.state.lock();
        let mut agents: Vec<Agent> = state
            .agents
            .values()
            .filter(|a| a.deleted_at.is_none())
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn update_agent(&self, agent: &Agent) -> StoreResult<Agent> {
        self.check_available()?;
        let mut state = self.state.lock();
        let stored = state.agent_mut(agent.id)?;
        stored.name = agent.name.clone();
        stored.ssh_host = agent.ssh_host.clone();
        stored.ssh_port = agent.ssh_port;
        stored.ssh_user = agent.ssh_user.clone();
        stored.ssh_auth_type = agent.ssh_auth_type;
        stored.ssh_password = agent.ssh_password.clone();
        stored.ssh_private_key = agent.ssh_private_key.clone();
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn register_agent(&self, id: Uuid, hostname: &str, ip: &str) -> StoreResult<Agent> {
        self.check_available()?;
        let now = Utc::now();
        let mut state = self.state.lock();
        let agent = state.agent_mut(id)?;
        agent.hostname = Some(hostname.to_string());
        agent.ip = Some(ip.to_string());
        agent.status = AgentStatus::Online;
        agent.last_heartbeat = Some(now);
        agent.updated_at = now;
        Ok(agent.clone())
    }

    async fn heartbeat(&self, agent_id: Uuid) -> StoreResult<()> {
        self.check_available()?;
        let now = Utc::now();
        let mut state = self.state.lock();
        let agent = state.agent_mut(agent_id)?;
        agent.last_heartbeat = Some(now);
        agent.status = AgentStatus::Online;
        agent.updated_at = now;
        Ok(())
    }

    async fn set_agent_status(&self, agent_id: Uuid, status: AgentStatus) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let agent = state.agent_mut(agent_id)?;
        agent.status = status;
        agent.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_stale_agents_offline(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        self.check_available()?;
        let now = Utc::now();
        let mut state = self.state.lock();
        let mut changed = Vec::new();
        for agent in state.agents.values_mut() {
            if agent.deleted_at.is_none() && agent.is_stale(cutoff) {
                agent.status = AgentStatus::Offline;
                agent.updated_at = now;
                changed.push(agent.id);
            }
        }
        Ok(changed)
    }

    async fn delete_agent(&self, id: Uuid) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let agent = state.agent_mut(id)?;
        agent.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn create_task(&self, task: NewTask) -> StoreResult<Task> {
        self.check_available()?;
        let task = task.into_task(Utc::now());
        self.state.lock().tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: Uuid) -> StoreResult<Task> {
        self.check_available()?;
        Ok(self.state.lock().task_mut(id)?.clone())
    }

    async fn list_tasks(&self) -> StoreResult<Vec<Task>> {
        self.check_available()?;
        let state = self.state.lock();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.deleted_at.is_none())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn update_task(&self, task: &Task) -> StoreResult<Task> {
        self.check_available()?;
        let mut state = self.state.lock();
        let stored = state.task_mut(task.id)?;
        stored.name = task.name.clone();
        stored.description = task.description.clone();
        stored.config = task.config.clone();
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn set_task_status(&self, id: Uuid, status: RunStatus) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let task = state.task_mut(id)?;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_task(&self, id: Uuid) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.task_mut(id)?.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn create_execution(&self, task_id: Uuid) -> StoreResult<TaskExecution> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.task_mut(task_id)?;
        let execution = TaskExecution::started(task_id, Utc::now());
        state.execution_order.push(execution.id);
        state.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<TaskExecution> {
        self.check_available()?;
        let state = self.state.lock();
        let execution = state
            .executions
            .get(&id)
            .ok_or_else(|| StoreError::not_found("execution", id))?;
        Ok(state.with_steps(execution))
    }

    async fn list_executions_for_task(
        &self,
        task_id: Uuid,
        limit: u32,
    ) -> StoreResult<Vec<TaskExecution>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .execution_order
            .iter()
            .rev()
            .filter_map(|id| state.executions.get(id))
            .filter(|e| e.task_id == task_id)
            .take(limit as usize)
            .map(|e| state.with_steps(e))
            .collect())
    }

    async fn list_executions_by_status(
        &self,
        status: RunStatus,
    ) -> StoreResult<Vec<TaskExecution>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .execution_order
            .iter()
            .filter_map(|id| state.executions.get(id))
            .filter(|e| e.status == status)
            .map(|e| state.with_steps(e))
            .collect())
    }

    async fn finish_execution(&self, id: Uuid, status: RunStatus) -> StoreResult<TaskExecution> {
        self.check_available()?;
        let now = Utc::now();
        let mut state = self.state.lock();
        let execution = state
            .executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("execution", id))?;
        if !execution.status.can_transition_to(status) || !status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                entity: "execution",
                id,
                from: execution.status.to_string(),
                to: status.to_string(),
            });
        }
        execution.status = status;
        execution.end_time = Some(now);
        execution.updated_at = now;
        let execution = execution.clone();
        Ok(state.with_steps(&execution))
    }

    async fn create_step(&self, step: NewStepExecution) -> StoreResult<StepExecution> {
        self.check_available()?;
        let mut state = self.state.lock();
        if !state.executions.contains_key(&step.execution_id) {
            return Err(StoreError::not_found("execution", step.execution_id));
        }
        let step = step.into_step(Utc::now());
        state.step_order.push(step.id);
        state.steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn get_step(&self, id: Uuid) -> StoreResult<StepExecution> {
        self.check_available()?;
        Ok(self.state.lock().step_mut(id)?.clone())
    }

    async fn list_steps(&self, execution_id: Uuid) -> StoreResult<Vec<StepExecution>> {
        self.check_available()?;
        Ok(self.state.lock().steps_of(execution_id))
    }

    async fn claim_pending_steps(
        &self,
        agent_id: Uuid,
        limit: u32,
    ) -> StoreResult<Vec<StepExecution>> {
        self.check_available()?;
        let now = Utc::now();
        let mut state = self.state.lock();

        let chosen: Vec<Uuid> = state
            .step_order
            .iter()
            .filter_map(|id| state.steps.get(id))
            .filter(|s| s.agent_id == agent_id && state.is_eligible(s))
            .take(limit as usize)
            .map(|s| s.id)
            .collect();

        let mut claimed = Vec::with_capacity(chosen.len());
        for id in chosen {
            let step = state.step_mut(id)?;
            step.assigned = true;
            step.updated_at = now;
            claimed.push(step.clone());
        }
        Ok(claimed)
    }

    async fn start_step(&self, id: Uuid) -> StoreResult<Option<StepExecution>> {
        self.check_operation("start_step")?;
        let now = Utc::now();
        let mut state = self.state.lock();
        let step = state.step_mut(id)?;
        if step.status != RunStatus::Pending || !step.assigned {
            return Ok(None);
        }
        step.status = RunStatus::Running;
        step.start_time = Some(now);
        step.updated_at = now;
        Ok(Some(step.clone()))
    }

    async fn complete_step(&self, completion: StepCompletion) -> StoreResult<StepUpdate> {
        self.check_operation("complete_step")?;
        let now = Utc::now();
        let mut state = self.state.lock();
        let step = state.step_mut(completion.step_id)?;

        if step.status.is_terminal() {
            return Ok(StepUpdate::AlreadyFinished(step.clone()));
        }
        if !step.accepts_report() || !completion.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                entity: "step",
                id: step.id,
                from: step.status.to_string(),
                to: completion.status.to_string(),
            });
        }

        step.status = completion.status;
        step.start_time.get_or_insert(now);
        step.exit_code = Some(completion.exit_code);
        step.output = completion.output;
        step.end_time = Some(now);
        step.updated_at = now;
        Ok(StepUpdate::Applied(step.clone()))
    }

    async fn fail_unfinished_step(&self, id: Uuid) -> StoreResult<Option<StepExecution>> {
        self.check_available()?;
        let now = Utc::now();
        let mut state = self.state.lock();
        let step = state.step_mut(id)?;
        if !step.status.is_unfinished() {
            return Ok(None);
        }
        step.status = RunStatus::Failed;
        step.assigned = true;
        step.end_time = Some(now);
        step.updated_at = now;
        Ok(Some(step.clone()))
    }
}

//! # State Store
//!
//! Durable records for agents, tasks, executions and steps behind the
//! [`StateStore`] contract. Every operation is atomic: it either applies in
//! full or returns a [`StoreError`], never a partial write.
//!
//! Two operations exist specifically for the scheduler:
//!
//! - [`StateStore::heartbeat`] sets `last_heartbeat = now, status = online`
//! - [`StateStore::claim_pending_steps`] is the at-most-once dispatch primitive
//!
//! Implementations:
//!
//! - [`PostgresStateStore`]: row locking with `FOR UPDATE SKIP LOCKED`
//! - [`InMemoryStateStore`]: a single mutex as the single-writer-wins unit

pub mod memory;
pub mod postgres;
pub mod retry;

use crate::error::StoreResult;
use crate::models::{
    Agent, NewAgent, NewStepExecution, NewTask, StepCompletion, StepExecution, StepUpdate, Task,
    TaskExecution,
};
use crate::state_machine::{AgentStatus, RunStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::InMemoryStateStore;
pub use postgres::PostgresStateStore;
pub use retry::retry_with_backoff;

#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    // Agents
    async fn create_agent(&self, agent: NewAgent) -> StoreResult<Agent>;
    async fn get_agent(&self, id: Uuid) -> StoreResult<Agent>;
    async fn list_agents(&self) -> StoreResult<Vec<Agent>>;
    /// Persist operator-editable fields (name, SSH metadata)
    async fn update_agent(&self, agent: &Agent) -> StoreResult<Agent>;
    /// Record reported hostname/IP and bring the agent online
    async fn register_agent(&self, id: Uuid, hostname: &str, ip: &str) -> StoreResult<Agent>;
    /// Atomically set `last_heartbeat = now` and `status = online`
    async fn heartbeat(&self, agent_id: Uuid) -> StoreResult<()>;
    async fn set_agent_status(&self, agent_id: Uuid, status: AgentStatus) -> StoreResult<()>;
    /// Move every online agent whose heartbeat is older than `cutoff` offline.
    /// Returns the ids that changed.
    async fn mark_stale_agents_offline(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Uuid>>;
    /// Soft delete
    async fn delete_agent(&self, id: Uuid) -> StoreResult<()>;

    // Tasks
    async fn create_task(&self, task: NewTask) -> StoreResult<Task>;
    async fn get_task(&self, id: Uuid) -> StoreResult<Task>;
    async fn list_tasks(&self) -> StoreResult<Vec<Task>>;
    async fn update_task(&self, task: &Task) -> StoreResult<Task>;
    async fn set_task_status(&self, id: Uuid, status: RunStatus) -> StoreResult<()>;
    async fn delete_task(&self, id: Uuid) -> StoreResult<()>;

    // Executions
    /// Create a `running` execution with its start time set
    async fn create_execution(&self, task_id: Uuid) -> StoreResult<TaskExecution>;
    /// Fetch an execution with its steps ordered by `step_index`
    async fn get_execution(&self, id: Uuid) -> StoreResult<TaskExecution>;
    /// Newest first, steps included
    async fn list_executions_for_task(
        &self,
        task_id: Uuid,
        limit: u32,
    ) -> StoreResult<Vec<TaskExecution>>;
    async fn list_executions_by_status(&self, status: RunStatus)
        -> StoreResult<Vec<TaskExecution>>;
    /// Set the terminal status and end time
    async fn finish_execution(&self, id: Uuid, status: RunStatus) -> StoreResult<TaskExecution>;

    // Steps
    async fn create_step(&self, step: NewStepExecution) -> StoreResult<StepExecution>;
    async fn get_step(&self, id: Uuid) -> StoreResult<StepExecution>;
    async fn list_steps(&self, execution_id: Uuid) -> StoreResult<Vec<StepExecution>>;
    /// Select up to `limit` eligible steps for `agent_id` (pending, unassigned,
    /// every predecessor succeeded), oldest first, and mark them assigned in
    /// the same atomic unit. Concurrent callers never receive the same step.
    async fn claim_pending_steps(
        &self,
        agent_id: Uuid,
        limit: u32,
    ) -> StoreResult<Vec<StepExecution>>;
    /// Assigned + pending -> running with start time. `None` when the step
    /// is no longer pending (e.g. abandoned by a timeout in the meantime).
    async fn start_step(&self, id: Uuid) -> StoreResult<Option<StepExecution>>;
    /// Apply an agent report. Terminal steps are left untouched.
    async fn complete_step(&self, completion: StepCompletion) -> StoreResult<StepUpdate>;
    /// Fail a pending or running step without an exit code and mark it
    /// assigned so it can never be dispatched afterwards. `None` when the
    /// step had already finished.
    async fn fail_unfinished_step(&self, id: Uuid) -> StoreResult<Option<StepExecution>>;
}

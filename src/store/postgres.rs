//! # PostgreSQL State Store
//!
//! ## Atomic Step Claiming
//!
//! `claim_pending_steps` runs in one transaction:
//!
//! 1. select the agent's pending, unassigned steps whose earlier siblings all
//!    succeeded, oldest first, `LIMIT $limit FOR UPDATE SKIP LOCKED`
//! 2. set `assigned = TRUE` on the selected rows
//! 3. commit
//!
//! A concurrent claim skips rows locked by an in-flight attempt instead of
//! blocking on them, and once the first transaction commits the rows no
//! longer match `assigned = FALSE`. Together this gives at-most-once
//! dispatch without any in-process coordination.

use super::StateStore;
use crate::config::DatabaseConfig;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    Agent, NewAgent, NewStepExecution, NewTask, SshAuthType, StepCompletion, StepExecution,
    StepUpdate, Task, TaskExecution,
};
use crate::state_machine::{AgentStatus, RunStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS plumber_agents (
    id UUID PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    ssh_host VARCHAR(255),
    ssh_port INTEGER NOT NULL DEFAULT 22,
    ssh_user VARCHAR(100),
    ssh_auth_type VARCHAR(20) NOT NULL DEFAULT 'none',
    ssh_password VARCHAR(255),
    ssh_private_key TEXT,
    hostname VARCHAR(255),
    ip VARCHAR(50),
    status VARCHAR(20) NOT NULL DEFAULT 'offline',
    last_heartbeat TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    deleted_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_plumber_agents_status ON plumber_agents (status, last_heartbeat);

CREATE TABLE IF NOT EXISTS plumber_tasks (
    id UUID PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    config TEXT NOT NULL,
    status VARCHAR(20) NOT NULL DEFAULT 'pending',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    deleted_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS plumber_task_executions (
    id UUID PRIMARY KEY,
    task_id UUID NOT NULL REFERENCES plumber_tasks (id),
    status VARCHAR(20) NOT NULL DEFAULT 'pending',
    start_time TIMESTAMPTZ,
    end_time TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_plumber_executions_task ON plumber_task_executions (task_id, created_at);
CREATE INDEX IF NOT EXISTS idx_plumber_executions_status ON plumber_task_executions (status);

CREATE TABLE IF NOT EXISTS plumber_step_executions (
    id UUID PRIMARY KEY,
    execution_id UUID NOT NULL REFERENCES plumber_task_executions (id),
    step_index INTEGER NOT NULL,
    agent_id UUID NOT NULL,
    path VARCHAR(500) NOT NULL DEFAULT '',
    command TEXT NOT NULL,
    status VARCHAR(20) NOT NULL DEFAULT 'pending',
    assigned BOOLEAN NOT NULL DEFAULT FALSE,
    exit_code INTEGER,
    output TEXT NOT NULL DEFAULT '',
    start_time TIMESTAMPTZ,
    end_time TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (execution_id, step_index)
);
CREATE INDEX IF NOT EXISTS idx_plumber_steps_claim
    ON plumber_step_executions (agent_id, status, assigned, created_at);
"#;

const AGENT_COLUMNS: &str = "id, name, ssh_host, ssh_port, ssh_user, ssh_auth_type, ssh_password, \
     ssh_private_key, hostname, ip, status, last_heartbeat, created_at, updated_at, deleted_at";
const TASK_COLUMNS: &str =
    "id, name, description, config, status, created_at, updated_at, deleted_at";
const EXECUTION_COLUMNS: &str = "id, task_id, status, start_time, end_time, created_at, updated_at";
const STEP_COLUMNS: &str = "id, execution_id, step_index, agent_id, path, command, status, \
     assigned, exit_code, output, start_time, end_time, created_at, updated_at";

#[derive(Debug, FromRow)]
struct AgentRow {
    id: Uuid,
    name: String,
    ssh_host: Option<String>,
    ssh_port: i32,
    ssh_user: Option<String>,
    ssh_auth_type: String,
    ssh_password: Option<String>,
    ssh_private_key: Option<String>,
    hostname: Option<String>,
    ip: Option<String>,
    status: String,
    last_heartbeat: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<AgentRow> for Agent {
    type Error = StoreError;

    fn try_from(row: AgentRow) -> StoreResult<Self> {
        Ok(Agent {
            id: row.id,
            name: row.name,
            ssh_host: row.ssh_host,
            ssh_port: row.ssh_port,
            ssh_user: row.ssh_user,
            ssh_auth_type: row
                .ssh_auth_type
                .parse::<SshAuthType>()
                .map_err(StoreError::Serialization)?,
            ssh_password: row.ssh_password,
            ssh_private_key: row.ssh_private_key,
            hostname: row.hostname,
            ip: row.ip,
            status: row
                .status
                .parse::<AgentStatus>()
                .map_err(StoreError::Serialization)?,
            last_heartbeat: row.last_heartbeat,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TaskRow {
    id: Uuid,
    name: String,
    description: String,
    config: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> StoreResult<Self> {
        Ok(Task {
            id: row.id,
            name: row.name,
            description: row.description,
            config: row.config,
            status: parse_status(&row.status)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ExecutionRow {
    id: Uuid,
    task_id: Uuid,
    status: String,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ExecutionRow> for TaskExecution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> StoreResult<Self> {
        Ok(TaskExecution {
            id: row.id,
            task_id: row.task_id,
            status: parse_status(&row.status)?,
            start_time: row.start_time,
            end_time: row.end_time,
            created_at: row.created_at,
            updated_at: row.updated_at,
            steps: Vec::new(),
        })
    }
}

#[derive(Debug, FromRow)]
struct StepRow {
    id: Uuid,
    execution_id: Uuid,
    step_index: i32,
    agent_id: Uuid,
    path: String,
    command: String,
    status: String,
    assigned: bool,
    exit_code: Option<i32>,
    output: String,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StepRow> for StepExecution {
    type Error = StoreError;

    fn try_from(row: StepRow) -> StoreResult<Self> {
        Ok(StepExecution {
            id: row.id,
            execution_id: row.execution_id,
            step_index: row.step_index,
            agent_id: row.agent_id,
            path: row.path,
            command: row.command,
            status: parse_status(&row.status)?,
            assigned: row.assigned,
            exit_code: row.exit_code,
            output: row.output,
            start_time: row.start_time,
            end_time: row.end_time,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn parse_status(raw: &str) -> StoreResult<RunStatus> {
    raw.parse::<RunStatus>().map_err(StoreError::Serialization)
}

fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Map a missing row onto a typed not-found error
fn found<T>(entity: &'static str, id: Uuid, row: Option<T>) -> StoreResult<T> {
    row.ok_or_else(|| StoreError::not_found(entity, id))
}

#[derive(Debug, Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    /// Connect using the database section of the configuration and ensure the schema exists
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.url)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {}", e);
                StoreError::Unavailable(format!("failed to connect to database: {e}"))
            })?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("Database schema is up to date");
        Ok(())
    }

    async fn attach_steps(&self, mut executions: Vec<TaskExecution>) -> StoreResult<Vec<TaskExecution>> {
        if executions.is_empty() {
            return Ok(executions);
        }
        let ids: Vec<Uuid> = executions.iter().map(|e| e.id).collect();
        let rows: Vec<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLUMNS} FROM plumber_step_executions \
             WHERE execution_id = ANY($1) ORDER BY step_index ASC"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_execution: HashMap<Uuid, Vec<StepExecution>> = HashMap::new();
        for step in convert_all::<_, StepExecution>(rows)? {
            by_execution.entry(step.execution_id).or_default().push(step);
        }
        for execution in &mut executions {
            execution.steps = by_execution.remove(&execution.id).unwrap_or_default();
        }
        Ok(executions)
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn create_agent(&self, agent: NewAgent) -> StoreResult<Agent> {
        let agent = agent.into_agent(Utc::now());
        let row: AgentRow = sqlx::query_as(&format!(
            "INSERT INTO plumber_agents \
             (id, name, ssh_host, ssh_port, ssh_user, ssh_auth_type, ssh_password, ssh_private_key, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {AGENT_COLUMNS}"
        ))
        .bind(agent.id)
        .bind(&agent.name)
        .bind(&agent.ssh_host)
        .bind(agent.ssh_port)
        .bind(&agent.ssh_user)
        .bind(agent.ssh_auth_type.as_str())
        .bind(&agent.ssh_password)
        .bind(&agent.ssh_private_key)
        .bind(agent.status.as_str())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_agent(&self, id: Uuid) -> StoreResult<Agent> {
        let row: Option<AgentRow> = sqlx::query_as(&format!(
            "SELECT {AGENT_COLUMNS} FROM plumber_agents WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        found("agent", id, row)?.try_into()
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        let rows: Vec<AgentRow> = sqlx::query_as(&format!(
            "SELECT {AGENT_COLUMNS} FROM plumber_agents WHERE deleted_at IS NULL ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn update_agent(&self, agent: &Agent) -> StoreResult<Agent> {
        let row: Option<AgentRow> = sqlx::query_as(&format!(
            "UPDATE plumber_agents SET name = $2, ssh_host = $3, ssh_port = $4, ssh_user = $5, \
             ssh_auth_type = $6, ssh_password = $7, ssh_private_key = $8, updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL RETURNING {AGENT_COLUMNS}"
        ))
        .bind(agent.id)
        .bind(&agent.name)
        .bind(&agent.ssh_host)
        .bind(agent.ssh_port)
        .bind(&agent.ssh_user)
        .bind(agent.ssh_auth_type.as_str())
        .bind(&agent.ssh_password)
        .bind(&agent.ssh_private_key)
        .fetch_optional(&self.pool)
        .await?;
        found("agent", agent.id, row)?.try_into()
    }

    async fn register_agent(&self, id: Uuid, hostname: &str, ip: &str) -> StoreResult<Agent> {
        let row: Option<AgentRow> = sqlx::query_as(&format!(
            "UPDATE plumber_agents SET hostname = $2, ip = $3, status = 'online', \
             last_heartbeat = NOW(), updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL RETURNING {AGENT_COLUMNS}"
        ))
        .bind(id)
        .bind(hostname)
        .bind(ip)
        .fetch_optional(&self.pool)
        .await?;
        found("agent", id, row)?.try_into()
    }

    async fn heartbeat(&self, agent_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE plumber_agents SET last_heartbeat = NOW(), status = 'online', updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("agent", agent_id));
        }
        Ok(())
    }

    async fn set_agent_status(&self, agent_id: Uuid, status: AgentStatus) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE plumber_agents SET status = $2, updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(agent_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("agent", agent_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_stale_agents_offline(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "UPDATE plumber_agents SET status = 'offline', updated_at = NOW() \
             WHERE status = 'online' AND deleted_at IS NULL AND last_heartbeat < $1 \
             RETURNING id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn delete_agent(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE plumber_agents SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("agent", id));
        }
        Ok(())
    }

    async fn create_task(&self, task: NewTask) -> StoreResult<Task> {
        let task = task.into_task(Utc::now());
        let row: TaskRow = sqlx::query_as(&format!(
            "INSERT INTO plumber_tasks (id, name, description, config, status) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {TASK_COLUMNS}"
        ))
        .bind(task.id)
        .bind(&task.name)
        .bind(&task.description)
        .bind(&task.config)
        .bind(task.status.as_str())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_task(&self, id: Uuid) -> StoreResult<Task> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM plumber_tasks WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        found("task", id, row)?.try_into()
    }

    async fn list_tasks(&self) -> StoreResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM plumber_tasks WHERE deleted_at IS NULL ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn update_task(&self, task: &Task) -> StoreResult<Task> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "UPDATE plumber_tasks SET name = $2, description = $3, config = $4, updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL RETURNING {TASK_COLUMNS}"
        ))
        .bind(task.id)
        .bind(&task.name)
        .bind(&task.description)
        .bind(&task.config)
        .fetch_optional(&self.pool)
        .await?;
        found("task", task.id, row)?.try_into()
    }

    async fn set_task_status(&self, id: Uuid, status: RunStatus) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE plumber_tasks SET status = $2, updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("task", id));
        }
        Ok(())
    }

    async fn delete_task(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE plumber_tasks SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("task", id));
        }
        Ok(())
    }

    async fn create_execution(&self, task_id: Uuid) -> StoreResult<TaskExecution> {
        // ensure the task is live before referencing it
        self.get_task(task_id).await?;
        let execution = TaskExecution::started(task_id, Utc::now());
        let row: ExecutionRow = sqlx::query_as(&format!(
            "INSERT INTO plumber_task_executions (id, task_id, status, start_time) \
             VALUES ($1, $2, $3, $4) RETURNING {EXECUTION_COLUMNS}"
        ))
        .bind(execution.id)
        .bind(task_id)
        .bind(execution.status.as_str())
        .bind(execution.start_time)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<TaskExecution> {
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM plumber_task_executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let execution: TaskExecution = found("execution", id, row)?.try_into()?;
        let mut executions = self.attach_steps(vec![execution]).await?;
        executions
            .pop()
            .ok_or_else(|| StoreError::not_found("execution", id))
    }

    async fn list_executions_for_task(
        &self,
        task_id: Uuid,
        limit: u32,
    ) -> StoreResult<Vec<TaskExecution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM plumber_task_executions \
             WHERE task_id = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(task_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        self.attach_steps(convert_all(rows)?).await
    }

    async fn list_executions_by_status(
        &self,
        status: RunStatus,
    ) -> StoreResult<Vec<TaskExecution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM plumber_task_executions \
             WHERE status = $1 ORDER BY created_at ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        self.attach_steps(convert_all(rows)?).await
    }

    async fn finish_execution(&self, id: Uuid, status: RunStatus) -> StoreResult<TaskExecution> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                entity: "execution",
                id,
                from: RunStatus::Running.to_string(),
                to: status.to_string(),
            });
        }
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "UPDATE plumber_task_executions SET status = $2, end_time = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'running' RETURNING {EXECUTION_COLUMNS}"
        ))
        .bind(id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let mut executions = self.attach_steps(vec![row.try_into()?]).await?;
                executions
                    .pop()
                    .ok_or_else(|| StoreError::not_found("execution", id))
            }
            None => {
                let current = self.get_execution(id).await?;
                Err(StoreError::InvalidTransition {
                    entity: "execution",
                    id,
                    from: current.status.to_string(),
                    to: status.to_string(),
                })
            }
        }
    }

    async fn create_step(&self, step: NewStepExecution) -> StoreResult<StepExecution> {
        let step = step.into_step(Utc::now());
        let row: StepRow = sqlx::query_as(&format!(
            "INSERT INTO plumber_step_executions \
             (id, execution_id, step_index, agent_id, path, command, status, assigned) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE) RETURNING {STEP_COLUMNS}"
        ))
        .bind(step.id)
        .bind(step.execution_id)
        .bind(step.step_index)
        .bind(step.agent_id)
        .bind(&step.path)
        .bind(&step.command)
        .bind(step.status.as_str())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_step(&self, id: Uuid) -> StoreResult<StepExecution> {
        let row: Option<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLUMNS} FROM plumber_step_executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        found("step", id, row)?.try_into()
    }

    async fn list_steps(&self, execution_id: Uuid) -> StoreResult<Vec<StepExecution>> {
        let rows: Vec<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLUMNS} FROM plumber_step_executions \
             WHERE execution_id = $1 ORDER BY step_index ASC"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    #[instrument(skip(self))]
    async fn claim_pending_steps(
        &self,
        agent_id: Uuid,
        limit: u32,
    ) -> StoreResult<Vec<StepExecution>> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<StepRow> = sqlx::query_as(
            r#"
            SELECT s.id, s.execution_id, s.step_index, s.agent_id, s.path, s.command, s.status,
                   s.assigned, s.exit_code, s.output, s.start_time, s.end_time,
                   s.created_at, s.updated_at
            FROM plumber_step_executions s
            WHERE s.agent_id = $1
              AND s.status = 'pending'
              AND s.assigned = FALSE
              AND NOT EXISTS (
                  SELECT 1 FROM plumber_step_executions p
                  WHERE p.execution_id = s.execution_id
                    AND p.step_index < s.step_index
                    AND p.status <> 'success'
              )
            ORDER BY s.created_at ASC, s.step_index ASC
            LIMIT $2
            FOR UPDATE OF s SKIP LOCKED
            "#,
        )
        .bind(agent_id)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed: Vec<StepExecution> = convert_all(rows)?;
        if !claimed.is_empty() {
            let ids: Vec<Uuid> = claimed.iter().map(|s| s.id).collect();
            sqlx::query(
                "UPDATE plumber_step_executions SET assigned = TRUE, updated_at = NOW() \
                 WHERE id = ANY($1)",
            )
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
            for step in &mut claimed {
                step.assigned = true;
            }
        }

        tx.commit().await?;
        debug!(claimed = claimed.len(), "Claim transaction committed");
        Ok(claimed)
    }

    async fn start_step(&self, id: Uuid) -> StoreResult<Option<StepExecution>> {
        let row: Option<StepRow> = sqlx::query_as(&format!(
            "UPDATE plumber_step_executions \
             SET status = 'running', start_time = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'pending' AND assigned = TRUE RETURNING {STEP_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None => {
                self.get_step(id).await?;
                Ok(None)
            }
        }
    }

    async fn complete_step(&self, completion: StepCompletion) -> StoreResult<StepUpdate> {
        let mut tx = self.pool.begin().await?;
        let row: Option<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLUMNS} FROM plumber_step_executions WHERE id = $1 FOR UPDATE"
        ))
        .bind(completion.step_id)
        .fetch_optional(&mut *tx)
        .await?;
        let current: StepExecution = found("step", completion.step_id, row)?.try_into()?;

        if current.status.is_terminal() {
            tx.rollback().await?;
            return Ok(StepUpdate::AlreadyFinished(current));
        }
        if !current.accepts_report() || !completion.status.is_terminal() {
            tx.rollback().await?;
            return Err(StoreError::InvalidTransition {
                entity: "step",
                id: current.id,
                from: current.status.to_string(),
                to: completion.status.to_string(),
            });
        }

        let row: StepRow = sqlx::query_as(&format!(
            "UPDATE plumber_step_executions \
             SET status = $2, exit_code = $3, output = $4, \
                 start_time = COALESCE(start_time, NOW()), end_time = NOW(), updated_at = NOW() \
             WHERE id = $1 RETURNING {STEP_COLUMNS}"
        ))
        .bind(completion.step_id)
        .bind(completion.status.as_str())
        .bind(completion.exit_code)
        .bind(&completion.output)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(StepUpdate::Applied(row.try_into()?))
    }

    async fn fail_unfinished_step(&self, id: Uuid) -> StoreResult<Option<StepExecution>> {
        let row: Option<StepRow> = sqlx::query_as(&format!(
            "UPDATE plumber_step_executions \
             SET status = 'failed', assigned = TRUE, end_time = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status IN ('pending', 'running') RETURNING {STEP_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None => {
                self.get_step(id).await?;
                Ok(None)
            }
        }
    }
}

//! # Execution Orchestrator
//!
//! ## Architecture
//!
//! Drives one task execution through its ordered step list:
//!
//! ```text
//! for each step in order:
//!     agent unknown or offline  -> execution failed (no step row created)
//!     create pending step row   -> picked up by the agent's next poll
//!     wait for a terminal status (report notification, store poll, deadline)
//!     success with exit code 0  -> next step
//!     anything else             -> execution failed, later steps never created
//! all steps succeeded           -> execution success
//! ```
//!
//! Each execution runs on its own spawned task, so a hung step only blocks
//! its own execution. Step rows are created lazily, one at a time, which is
//! what keeps later steps undispatchable until their predecessor succeeded.
//!
//! ## Completion Wait
//!
//! The wait is hybrid: [`ExecutionOrchestrator::notify_step_finished`] wakes
//! the waiter as soon as a report is applied, a periodic store read covers
//! reports applied by another process, and a deadline bounds the whole wait.
//! On deadline the step is failed in the store (no exit code) so a late
//! agent report is ignored.
//!
//! ## Shutdown and Recovery
//!
//! Cancelling the shutdown token stops every drive loop without touching
//! the store; the affected executions stay `running`.
//! [`ExecutionOrchestrator::recover_running_executions`] re-adopts them on
//! the next start.

use crate::config::{BackoffConfig, OrchestratorConfig};
use crate::error::{PlumberError, Result, StoreError};
use crate::logging::{log_execution_operation, log_step_operation};
use crate::models::{NewStepExecution, StepExecution, TaskConfig, TaskExecution, TaskStep};
use crate::state_machine::RunStatus;
use crate::store::{retry_with_backoff, StateStore};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// How a single step ended from the orchestrator's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Succeeded,
    Failed,
    /// Shutdown requested while waiting
    Interrupted,
}

#[derive(Debug)]
pub struct ExecutionOrchestrator {
    store: Arc<dyn StateStore>,
    config: OrchestratorConfig,
    backoff: BackoffConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    /// execution id -> task id for every execution driven by this process
    active: DashMap<Uuid, Uuid>,
    /// step id -> waiter wake-up handle
    completions: DashMap<Uuid, Arc<Notify>>,
}

impl ExecutionOrchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        config: OrchestratorConfig,
        backoff: BackoffConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            config,
            backoff,
            shutdown,
            tracker: TaskTracker::new(),
            active: DashMap::new(),
            completions: DashMap::new(),
        }
    }

    /// Start a new execution of `task_id` and return it immediately.
    ///
    /// The task's step list is parsed before anything is written, so an
    /// invalid configuration fails here and creates no execution.
    #[instrument(skip(self))]
    pub async fn start_execution(self: &Arc<Self>, task_id: Uuid) -> Result<TaskExecution> {
        if self.shutdown.is_cancelled() {
            return Err(PlumberError::Internal(
                "orchestrator is shutting down".to_string(),
            ));
        }

        let task = self.store.get_task(task_id).await?;
        let config = task.parse_config()?;

        let execution = self.store.create_execution(task_id).await?;
        self.store
            .set_task_status(task_id, RunStatus::Running)
            .await?;

        log_execution_operation(
            "start",
            execution.id,
            task_id,
            execution.status.as_str(),
            Some(&format!("{} steps", config.len())),
        );

        self.spawn_drive(execution.clone(), config);
        Ok(execution)
    }

    /// Wake the waiter of `step_id`, if any. Called after a report is applied.
    pub fn notify_step_finished(&self, step_id: Uuid) {
        if let Some(notify) = self.completions.get(&step_id) {
            notify.notify_one();
        }
    }

    /// Re-adopt executions left `running` by an earlier process.
    ///
    /// Executions already driven here are skipped. Returns how many were
    /// resumed.
    pub async fn recover_running_executions(self: &Arc<Self>) -> Result<usize> {
        let running = self
            .store
            .list_executions_by_status(RunStatus::Running)
            .await?;
        let mut resumed = 0;

        for execution in running {
            if self.active.contains_key(&execution.id) {
                continue;
            }

            let config = match self.store.get_task(execution.task_id).await {
                Ok(task) => task.parse_config(),
                Err(e) => Err(e.into()),
            };
            match config {
                Ok(config) => {
                    log_execution_operation(
                        "recover",
                        execution.id,
                        execution.task_id,
                        execution.status.as_str(),
                        Some(&format!("{} steps already created", execution.steps.len())),
                    );
                    if self.spawn_drive(execution, config) {
                        resumed += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        execution_id = %execution.id,
                        error = %e,
                        "Cannot resume execution, marking failed"
                    );
                    self.finalize(execution.id, execution.task_id, RunStatus::Failed)
                        .await?;
                }
            }
        }

        if resumed > 0 {
            info!(resumed, "Recovered running executions");
        }
        Ok(resumed)
    }

    /// Execution ids currently driven by this process
    pub fn active_executions(&self) -> Vec<Uuid> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }

    pub fn is_active(&self, execution_id: Uuid) -> bool {
        self.active.contains_key(&execution_id)
    }

    /// Stop all drive loops and wait for them to exit
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(
            interrupted = self.active.len(),
            "Execution orchestrator stopped"
        );
    }

    fn spawn_drive(self: &Arc<Self>, execution: TaskExecution, config: TaskConfig) -> bool {
        let execution_id = execution.id;
        match self.active.entry(execution_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => return false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(execution.task_id);
            }
        }

        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            this.run_execution(execution, config).await;
        });
        true
    }

    async fn run_execution(&self, execution: TaskExecution, config: TaskConfig) {
        let execution_id = execution.id;
        let task_id = execution.task_id;

        let result = match self.drive(&execution, &config).await {
            Ok(Some(status)) => self.finalize(execution_id, task_id, status).await,
            Ok(None) => {
                info!(%execution_id, "Execution interrupted by shutdown, left running");
                // keep the entry so recovery in this process does not double-drive
                return;
            }
            Err(e) => {
                error!(%execution_id, error = %e, "Execution aborted");
                self.finalize(execution_id, task_id, RunStatus::Failed).await
            }
        };

        if let Err(e) = result {
            error!(
                %execution_id,
                error = %e,
                "Failed to finalize execution, leaving it for recovery"
            );
        }
        self.active.remove(&execution_id);
    }

    /// Run the remaining steps. `None` means shutdown interrupted the run.
    async fn drive(
        &self,
        execution: &TaskExecution,
        config: &TaskConfig,
    ) -> Result<Option<RunStatus>> {
        let mut next_index = 0;

        if let Some(last) = execution.last_step() {
            next_index = last.step_index as usize + 1;
            let outcome = match last.status {
                RunStatus::Success if last.succeeded() => StepOutcome::Succeeded,
                RunStatus::Success | RunStatus::Failed => StepOutcome::Failed,
                RunStatus::Pending | RunStatus::Running => self.await_step(last).await?,
            };
            match outcome {
                StepOutcome::Succeeded => {}
                StepOutcome::Failed => return Ok(Some(RunStatus::Failed)),
                StepOutcome::Interrupted => return Ok(None),
            }
        }

        for (index, step) in config.steps.iter().enumerate().skip(next_index) {
            if self.shutdown.is_cancelled() {
                return Ok(None);
            }
            match self.execute_step(execution.id, index, step).await? {
                StepOutcome::Succeeded => continue,
                StepOutcome::Failed => return Ok(Some(RunStatus::Failed)),
                StepOutcome::Interrupted => return Ok(None),
            }
        }

        Ok(Some(RunStatus::Success))
    }

    async fn execute_step(
        &self,
        execution_id: Uuid,
        index: usize,
        step: &TaskStep,
    ) -> Result<StepOutcome> {
        let agent = match self.store.get_agent(step.agent_id).await {
            Ok(agent) => agent,
            Err(StoreError::NotFound { .. }) => {
                log_step_operation(
                    "skip",
                    execution_id,
                    None,
                    index,
                    RunStatus::Failed.as_str(),
                    Some(&format!("agent {} not found", step.agent_id)),
                );
                return Ok(StepOutcome::Failed);
            }
            Err(e) => return Err(e.into()),
        };

        if !agent.is_online() {
            let reason = PlumberError::AgentOffline { agent_id: agent.id };
            log_step_operation(
                "skip",
                execution_id,
                None,
                index,
                RunStatus::Failed.as_str(),
                Some(&reason.to_string()),
            );
            return Ok(StepOutcome::Failed);
        }

        let created = self
            .store
            .create_step(NewStepExecution {
                execution_id,
                step_index: index as i32,
                agent_id: step.agent_id,
                path: step.path.clone(),
                command: step.command.clone(),
            })
            .await?;
        log_step_operation(
            "create",
            execution_id,
            Some(created.id),
            index,
            created.status.as_str(),
            Some(&format!("waiting for agent {}", agent.id)),
        );

        self.await_step(&created).await
    }

    /// Wait for `step` to reach a terminal status, failing it on deadline
    async fn await_step(&self, step: &StepExecution) -> Result<StepOutcome> {
        let step_id = step.id;
        let notify = self
            .completions
            .entry(step_id)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();
        let outcome = self.wait_for_terminal(step, &notify).await;
        self.completions.remove(&step_id);
        outcome
    }

    async fn wait_for_terminal(&self, step: &StepExecution, notify: &Notify) -> Result<StepOutcome> {
        let deadline = Instant::now() + self.config.step_timeout();
        let poll_interval = self.config.step_poll_interval();

        loop {
            match self.store.get_step(step.id).await {
                Ok(current) if current.status.is_terminal() => {
                    return Ok(Self::classify(&current));
                }
                Ok(_) => {}
                Err(StoreError::Unavailable(reason)) => {
                    warn!(step_id = %step.id, %reason, "Step status read failed, will retry");
                }
                Err(e) => return Err(e.into()),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(StepOutcome::Interrupted),
                _ = tokio::time::sleep_until(deadline) => {
                    return self.expire_step(step).await;
                }
                _ = notify.notified() => {
                    debug!(step_id = %step.id, "Step completion notified");
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    async fn expire_step(&self, step: &StepExecution) -> Result<StepOutcome> {
        let timeout = PlumberError::StepTimeout {
            step_id: step.id,
            timeout: self.config.step_timeout(),
        };

        match self.store.fail_unfinished_step(step.id).await? {
            Some(failed) => {
                log_step_operation(
                    "timeout",
                    failed.execution_id,
                    Some(failed.id),
                    failed.step_index as usize,
                    failed.status.as_str(),
                    Some(&timeout.to_string()),
                );
                Ok(StepOutcome::Failed)
            }
            // A report landed between the last read and the deadline
            None => {
                let current = self.store.get_step(step.id).await?;
                Ok(Self::classify(&current))
            }
        }
    }

    fn classify(step: &StepExecution) -> StepOutcome {
        if step.succeeded() {
            StepOutcome::Succeeded
        } else {
            StepOutcome::Failed
        }
    }

    async fn finalize(&self, execution_id: Uuid, task_id: Uuid, status: RunStatus) -> Result<()> {
        let finished = retry_with_backoff(&self.backoff, "finish_execution", || {
            self.store.finish_execution(execution_id, status)
        })
        .await;
        match finished {
            Ok(_) => {}
            Err(StoreError::InvalidTransition { from, .. }) => {
                warn!(%execution_id, %from, "Execution already finished");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let task_update = retry_with_backoff(&self.backoff, "set_task_status", || {
            self.store.set_task_status(task_id, status)
        })
        .await;
        match task_update {
            Ok(()) => {}
            Err(StoreError::NotFound { .. }) => {
                debug!(%task_id, "Task deleted while executing, status not mirrored");
            }
            Err(e) => return Err(e.into()),
        }

        log_execution_operation("finish", execution_id, task_id, status.as_str(), None);
        Ok(())
    }
}

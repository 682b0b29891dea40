//! # Step Assignment Scheduler
//!
//! Hands pending steps to polling agents with at-most-once semantics.
//!
//! ## Key Features
//!
//! - **Atomic Claiming**: delegates selection and marking to
//!   [`StateStore::claim_pending_steps`], so two agents polling at the same
//!   instant never receive the same step
//! - **Ordering**: a step is only eligible once every earlier step of its
//!   execution succeeded
//! - **Start on Dispatch**: claimed steps move to `running` before they are
//!   returned; steps abandoned in between (timeout) are dropped silently
//! - **No Stranded Claims**: recording the start is retried with backoff, and
//!   a step whose start still cannot be recorded is dispatched anyway. The
//!   `assigned` flag alone keeps it from being handed out twice, and the
//!   agent's report is accepted for a dispatched `pending` step.

use crate::config::{BackoffConfig, SchedulerConfig};
use crate::error::Result;
use crate::logging::log_step_operation;
use crate::models::{AssignedStep, StepExecution};
use crate::store::{retry_with_backoff, StateStore};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StepAssignmentScheduler {
    store: Arc<dyn StateStore>,
    config: SchedulerConfig,
    backoff: BackoffConfig,
}

impl StepAssignmentScheduler {
    pub fn new(store: Arc<dyn StateStore>, config: SchedulerConfig) -> Self {
        Self {
            store,
            config,
            backoff: BackoffConfig::default(),
        }
    }

    /// Backoff used when recording the start of a claimed step
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Claim up to `limit` eligible steps for `agent_id` and start them.
    /// `limit` is capped at `scheduler.claim_limit`.
    ///
    /// A failed claim means nothing was assigned; the agent simply polls
    /// again. Once a claim commits, every claimed step is returned.
    #[instrument(skip(self))]
    pub async fn claim(&self, agent_id: Uuid, limit: u32) -> Result<Vec<StepExecution>> {
        let limit = limit.min(self.config.claim_limit);
        let claimed = self.store.claim_pending_steps(agent_id, limit).await?;
        let mut dispatched = Vec::with_capacity(claimed.len());

        for step in claimed {
            let started = retry_with_backoff(&self.backoff, "start_step", || {
                self.store.start_step(step.id)
            })
            .await;
            match started {
                Ok(Some(running)) => {
                    log_step_operation(
                        "dispatch",
                        running.execution_id,
                        Some(running.id),
                        running.step_index as usize,
                        running.status.as_str(),
                        Some(&format!("assigned to agent {agent_id}")),
                    );
                    dispatched.push(running);
                }
                Ok(None) => debug!(step_id = %step.id, "Claimed step no longer pending, skipping"),
                Err(e) => {
                    warn!(
                        step_id = %step.id,
                        error = %e,
                        "Could not record step start, dispatching as claimed"
                    );
                    log_step_operation(
                        "dispatch",
                        step.execution_id,
                        Some(step.id),
                        step.step_index as usize,
                        step.status.as_str(),
                        Some(&format!("assigned to agent {agent_id}, start not recorded")),
                    );
                    dispatched.push(step);
                }
            }
        }

        Ok(dispatched)
    }

    /// Poll entry point. A poll response carries one step, so exactly one
    /// is claimed.
    pub async fn poll(&self, agent_id: Uuid) -> Result<Option<AssignedStep>> {
        let steps = self.claim(agent_id, 1).await?;
        Ok(steps.first().map(AssignedStep::from))
    }
}

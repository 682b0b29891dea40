use crate::state_machine::RunStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One command on one agent within an execution.
/// Maps to the `plumber_step_executions` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    /// 0-based position; defines the required ordering inside the execution
    pub step_index: i32,
    pub agent_id: Uuid,
    pub path: String,
    pub command: String,
    pub status: RunStatus,
    /// Set once the step has been handed to an agent poll; never cleared
    pub assigned: bool,
    pub exit_code: Option<i32>,
    pub output: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepExecution {
    /// Whether every earlier step of the same execution in `siblings` succeeded
    pub fn predecessors_satisfied<'a>(
        &self,
        siblings: impl IntoIterator<Item = &'a StepExecution>,
    ) -> bool {
        siblings
            .into_iter()
            .filter(|s| s.execution_id == self.execution_id && s.step_index < self.step_index)
            .all(|s| s.status.satisfies_predecessor())
    }

    pub fn is_claimable(&self) -> bool {
        self.status == RunStatus::Pending && !self.assigned
    }

    /// A reported `success` only counts when the command exited cleanly
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success && self.exit_code.unwrap_or(0) == 0
    }

    /// A result can be recorded once the step is running, or once it was
    /// dispatched to its agent even if the start was never recorded
    pub fn accepts_report(&self) -> bool {
        self.status == RunStatus::Running || (self.status == RunStatus::Pending && self.assigned)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStepExecution {
    pub execution_id: Uuid,
    pub step_index: i32,
    pub agent_id: Uuid,
    pub path: String,
    pub command: String,
}

impl NewStepExecution {
    pub(crate) fn into_step(self, now: DateTime<Utc>) -> StepExecution {
        StepExecution {
            id: Uuid::new_v4(),
            execution_id: self.execution_id,
            step_index: self.step_index,
            agent_id: self.agent_id,
            path: self.path,
            command: self.command,
            status: RunStatus::Pending,
            assigned: false,
            exit_code: None,
            output: String::new(),
            start_time: None,
            end_time: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Terminal result reported by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletion {
    pub step_id: Uuid,
    pub status: RunStatus,
    pub exit_code: i32,
    pub output: String,
}

/// Outcome of applying a [`StepCompletion`]
#[derive(Debug, Clone, PartialEq)]
pub enum StepUpdate {
    /// The step moved from running (or dispatched) to the reported terminal status
    Applied(StepExecution),
    /// The step was already terminal; stored result left untouched
    AlreadyFinished(StepExecution),
}

impl StepUpdate {
    pub fn step(&self) -> &StepExecution {
        match self {
            Self::Applied(step) | Self::AlreadyFinished(step) => step,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Unit of work handed to an agent. Same shape as the push-dispatch
/// `plumber.agent.execute` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedStep {
    pub step_id: Uuid,
    pub path: String,
    pub command: String,
}

impl From<&StepExecution> for AssignedStep {
    fn from(step: &StepExecution) -> Self {
        Self {
            step_id: step.id,
            path: step.path.clone(),
            command: step.command.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(execution_id: Uuid, index: i32, status: RunStatus) -> StepExecution {
        let mut step = NewStepExecution {
            execution_id,
            step_index: index,
            agent_id: Uuid::new_v4(),
            path: "/srv".to_string(),
            command: "true".to_string(),
        }
        .into_step(Utc::now());
        step.status = status;
        step
    }

    #[test]
    fn test_predecessors_must_all_succeed() {
        let execution_id = Uuid::new_v4();
        let first = step(execution_id, 0, RunStatus::Success);
        let second = step(execution_id, 1, RunStatus::Running);
        let third = step(execution_id, 2, RunStatus::Pending);

        assert!(second.predecessors_satisfied([&first, &second, &third]));
        assert!(!third.predecessors_satisfied([&first, &second, &third]));
    }

    #[test]
    fn test_other_executions_do_not_block() {
        let blocked_elsewhere = step(Uuid::new_v4(), 0, RunStatus::Running);
        let candidate = step(Uuid::new_v4(), 1, RunStatus::Pending);
        assert!(candidate.predecessors_satisfied([&blocked_elsewhere]));
    }

    #[test]
    fn test_success_with_nonzero_exit_is_not_success() {
        let mut s = step(Uuid::new_v4(), 0, RunStatus::Success);
        s.exit_code = Some(0);
        assert!(s.succeeded());
        s.exit_code = Some(7);
        assert!(!s.succeeded());
    }
    #[test]
    fn test_only_dispatched_steps_accept_reports() {
        let mut s = step(Uuid::new_v4(), 0, RunStatus::Pending);
        assert!(!s.accepts_report());
        s.assigned = true;
        assert!(s.accepts_report());
        s.status = RunStatus::Running;
        assert!(s.accepts_report());
        s.status = RunStatus::Failed;
        assert!(!s.accepts_report());
    }
}

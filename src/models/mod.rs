//! # Data Model
//!
//! Durable records for agents, tasks, executions and steps, plus the task
//! step-list document format.

pub mod core;
pub mod task_config;

pub use self::core::{
    Agent, AssignedStep, NewAgent, NewStepExecution, NewTask, SshAuthType, StepCompletion,
    StepExecution, StepUpdate, Task, TaskExecution,
};
pub use task_config::{TaskConfig, TaskStep};

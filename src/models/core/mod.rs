pub mod agent;
pub mod step_execution;
pub mod task;
pub mod task_execution;

pub use agent::{Agent, NewAgent, SshAuthType};
pub use step_execution::{
    AssignedStep, NewStepExecution, StepCompletion, StepExecution, StepUpdate,
};
pub use task::{NewTask, Task};
pub use task_execution::TaskExecution;

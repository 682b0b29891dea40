//! # Orchestration
//!
//! Control flows that move work through the system. They share no
//! in-process state with each other beyond the [`StateStore`](crate::store::StateStore):
//!
//! - [`StepAssignmentScheduler`]: one invocation per agent poll
//! - [`AgentLivenessMonitor`]: one sweep per tick
//! - [`ExecutionOrchestrator`]: one drive loop per active execution
//! - [`PlumberSystem`]: lifecycle owner for all of the above

pub mod bootstrap;
pub mod execution_orchestrator;
pub mod liveness_monitor;
pub mod step_scheduler;

pub use bootstrap::PlumberSystem;
pub use execution_orchestrator::ExecutionOrchestrator;
pub use liveness_monitor::AgentLivenessMonitor;
pub use step_scheduler::StepAssignmentScheduler;

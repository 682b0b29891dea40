// Lifecycle states for tasks, executions, steps and agents.
//
// Transitions are enforced by the store's conditional updates; this module only
// defines the states and which moves between them are legal.

pub mod states;

pub use states::{AgentStatus, RunStatus};

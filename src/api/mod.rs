//! # Plumber API
//!
//! Transport-free operator and agent operations. [`PlumberService`] validates
//! input, talks to the [`StateStore`](crate::store::StateStore) and the
//! orchestration components, and returns typed responses. The JSON-RPC layer
//! in [`crate::rpc`] and the in-process agent transport both sit on top of it.

pub mod service;
pub mod types;

pub use service::PlumberService;
pub use types::{
    AgentConfigDocument, AgentConfigFile, AgentIdParams, ExecutionIdParams, ListExecutionsParams,
    PollResponse, RegisterAgentParams, ReportOutcome, ReportParams, ReportResponse,
    RunTaskResponse, StatusResponse, TaskIdParams, UpdateAgentParams, UpdateTaskParams,
};

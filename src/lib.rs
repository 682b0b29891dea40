#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Plumber Core
//!
//! Step-assignment and execution-orchestration engine for running ordered
//! shell-command workflows on a fleet of remote agents.
//!
//! ## Overview
//!
//! Operators declare **agents** and **tasks**. A task is an ordered list of
//! steps, each bound to one agent. Running a task creates an **execution**;
//! the orchestrator materializes its steps one at a time, agents poll for
//! eligible steps, run them through `sh -c` and report the result.
//!
//! ## Architecture
//!
//! ```text
//!  operator ──► RpcRouter ──► PlumberService ──► ExecutionOrchestrator ─┐
//!                                  │                                    │
//!  agent ◄── poll/report ──────────┤   StepAssignmentScheduler          │
//!                                  │   AgentLivenessMonitor             │
//!                                  ▼                                    ▼
//!                              StateStore (PostgreSQL | in-memory) ◄────┘
//! ```
//!
//! Components interact only through the [`store::StateStore`]. The
//! at-most-once dispatch guarantee lives entirely in
//! [`store::StateStore::claim_pending_steps`].
//!
//! ## Module Organization
//!
//! - [`models`] - Agents, tasks, executions, steps and the step-list format
//! - [`state_machine`] - Status enums and their transition rules
//! - [`store`] - Persistence contract and its implementations
//! - [`orchestration`] - Scheduler, liveness monitor, orchestrator, bootstrap
//! - [`api`] - Transport-free operator and agent operations
//! - [`rpc`] - JSON-RPC 2.0 dispatch on top of [`api`]
//! - [`agent`] - Agent-side executor and worker loop
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust
//! use plumber_core::config::PlumberConfig;
//! use plumber_core::orchestration::PlumberSystem;
//! use plumber_core::store::InMemoryStateStore;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let mut system =
//!     PlumberSystem::bootstrap(PlumberConfig::default(), Arc::new(InMemoryStateStore::new()))
//!         .await
//!         .unwrap();
//! let router = system.router();
//! let response = router
//!     .handle_raw(r#"{"jsonrpc":"2.0","method":"plumber.agent.list","id":1}"#)
//!     .await;
//! assert!(!response.is_error());
//! system.shutdown().await.unwrap();
//! # });
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod rpc;
pub mod state_machine;
pub mod store;

pub use api::PlumberService;
pub use config::{ConfigManager, PlumberConfig};
pub use error::{PlumberError, Result, StoreError};
pub use models::{Agent, StepExecution, Task, TaskConfig, TaskExecution};
pub use orchestration::{
    AgentLivenessMonitor, ExecutionOrchestrator, PlumberSystem, StepAssignmentScheduler,
};
pub use rpc::RpcRouter;
pub use state_machine::{AgentStatus, RunStatus};
pub use store::{InMemoryStateStore, PostgresStateStore, StateStore};

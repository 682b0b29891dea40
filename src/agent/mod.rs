//! # Agent Runtime
//!
//! Everything an agent process needs: its `agent.json` identity, a shell
//! command executor and the heartbeat/poll/report worker loop.

pub mod config;
pub mod executor;
pub mod worker;

pub use config::{AgentConfig, AgentRuntimeConfig};
pub use executor::{CommandExecutor, CommandOutput};
pub use worker::{AgentWorker, RpcServerApi, ServerApi};

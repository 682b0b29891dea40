//! # Agent Worker
//!
//! The agent-side loop: register once, then heartbeat and poll on fixed
//! intervals until cancelled. Each received step runs on its own task so a
//! long command never delays heartbeats or further polls.

use super::config::{AgentConfig, AgentRuntimeConfig};
use crate::config::BackoffConfig;
use super::executor::CommandExecutor;
use crate::api::{PlumberService, PollResponse, RegisterAgentParams, ReportParams};
use crate::error::{PlumberError, Result};
use crate::models::AssignedStep;
use crate::rpc::methods::{AGENT_HEARTBEAT, AGENT_POLL_TASK, AGENT_REGISTER, STEP_REPORT};
use crate::rpc::jsonrpc::INVALID_PARAMS;
use crate::rpc::{RpcRequest, RpcRouter};
use crate::state_machine::RunStatus;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The server operations an agent depends on
#[async_trait]
pub trait ServerApi: Send + Sync + std::fmt::Debug {
    async fn register(&self, agent_id: Uuid, hostname: &str, ip: &str) -> Result<()>;
    async fn heartbeat(&self, agent_id: Uuid) -> Result<()>;
    async fn poll(&self, agent_id: Uuid) -> Result<Option<AssignedStep>>;
    async fn report(
        &self,
        step_id: Uuid,
        status: RunStatus,
        exit_code: i32,
        output: String,
    ) -> Result<()>;
}

/// In-process transport
#[async_trait]
impl ServerApi for PlumberService {
    async fn register(&self, agent_id: Uuid, hostname: &str, ip: &str) -> Result<()> {
        self.register_agent(RegisterAgentParams {
            agent_id: agent_id.to_string(),
            hostname: hostname.to_string(),
            ip: ip.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn heartbeat(&self, agent_id: Uuid) -> Result<()> {
        PlumberService::heartbeat(self, &agent_id.to_string())
            .await
            .map(|_| ())
    }

    async fn poll(&self, agent_id: Uuid) -> Result<Option<AssignedStep>> {
        Ok(self.poll_task(&agent_id.to_string()).await?.task)
    }

    async fn report(
        &self,
        step_id: Uuid,
        status: RunStatus,
        exit_code: i32,
        output: String,
    ) -> Result<()> {
        self.report_step(ReportParams {
            step_id: step_id.to_string(),
            status: status.to_string(),
            exit_code,
            output,
        })
        .await
        .map(|_| ())
    }
}

/// JSON-RPC transport: every call goes through request/response envelopes
#[derive(Debug)]
pub struct RpcServerApi {
    router: RpcRouter,
    next_id: AtomicU64,
}

impl RpcServerApi {
    pub fn new(router: RpcRouter) -> Self {
        Self {
            router,
            next_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .router
            .handle(RpcRequest::new(method, params, id))
            .await;
        match (response.result, response.error) {
            (_, Some(error)) if error.code == INVALID_PARAMS => Err(PlumberError::Validation(
                format!("{method} rejected: {}", error.message),
            )),
            (_, Some(error)) => Err(PlumberError::Internal(format!(
                "{method} failed ({}): {}",
                error.code, error.message
            ))),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(serde_json::Value::Null),
        }
    }
}

#[async_trait]
impl ServerApi for RpcServerApi {
    async fn register(&self, agent_id: Uuid, hostname: &str, ip: &str) -> Result<()> {
        self.call(
            AGENT_REGISTER,
            json!({ "agent_id": agent_id, "hostname": hostname, "ip": ip }),
        )
        .await
        .map(|_| ())
    }

    async fn heartbeat(&self, agent_id: Uuid) -> Result<()> {
        self.call(AGENT_HEARTBEAT, json!({ "agent_id": agent_id }))
            .await
            .map(|_| ())
    }

    async fn poll(&self, agent_id: Uuid) -> Result<Option<AssignedStep>> {
        let value = self
            .call(AGENT_POLL_TASK, json!({ "agent_id": agent_id }))
            .await?;
        let response: PollResponse = serde_json::from_value(value)?;
        Ok(response.task.filter(|_| response.has_task))
    }

    async fn report(
        &self,
        step_id: Uuid,
        status: RunStatus,
        exit_code: i32,
        output: String,
    ) -> Result<()> {
        self.call(
            STEP_REPORT,
            json!({
                "step_id": step_id,
                "status": status,
                "exit_code": exit_code,
                "output": output,
            }),
        )
        .await
        .map(|_| ())
    }
}

#[derive(Debug)]
pub struct AgentWorker {
    agent_id: Uuid,
    hostname: String,
    ip: String,
    server: Arc<dyn ServerApi>,
    executor: CommandExecutor,
    config: AgentRuntimeConfig,
    tracker: TaskTracker,
}

impl AgentWorker {
    pub fn new(agent_id: Uuid, server: Arc<dyn ServerApi>, config: AgentRuntimeConfig) -> Self {
        let executor = CommandExecutor::new(config.work_dir.clone(), config.command_timeout());
        Self {
            agent_id,
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            ip: "127.0.0.1".to_string(),
            server,
            executor,
            config,
            tracker: TaskTracker::new(),
        }
    }

    /// Worker for the identity in an `agent.json` document
    pub fn from_config(
        identity: &AgentConfig,
        server: Arc<dyn ServerApi>,
        config: AgentRuntimeConfig,
    ) -> Result<Self> {
        identity.validate()?;
        Ok(Self::new(identity.agent_id()?, server, config))
    }

    pub fn with_host(mut self, hostname: impl Into<String>, ip: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self.ip = ip.into();
        self
    }

    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    /// Register, then heartbeat and poll until `shutdown` is cancelled.
    ///
    /// Registration failure is fatal. Commands still running at shutdown are
    /// killed and not reported.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.server
            .register(self.agent_id, &self.hostname, &self.ip)
            .await?;
        info!(agent_id = %self.agent_id, hostname = %self.hostname, "Agent registered");

        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            self.server.clone(),
            self.agent_id,
            self.config.clone(),
            shutdown.clone(),
        ));

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(&shutdown).await {
                        warn!(agent_id = %self.agent_id, error = %e, "Poll failed");
                    }
                }
            }
        }

        info!(agent_id = %self.agent_id, "Agent worker stopping");
        self.tracker.close();
        self.tracker.wait().await;
        heartbeat
            .await
            .map_err(|e| PlumberError::Internal(format!("heartbeat loop panicked: {e}")))?;
        Ok(())
    }

    /// Ask for one step and start it in the background. Returns whether a
    /// step was received.
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> Result<bool> {
        let Some(step) = self.server.poll(self.agent_id).await? else {
            return Ok(false);
        };
        info!(
            agent_id = %self.agent_id,
            step_id = %step.step_id,
            path = %step.path,
            command = %step.command,
            "Received step"
        );

        let server = self.server.clone();
        let executor = self.executor.clone();
        let backoff = self.config.report_backoff.clone();
        let shutdown = shutdown.clone();
        self.tracker.spawn(async move {
            let result = tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!(step_id = %step.step_id, "Shutdown during step, result not reported");
                    return;
                }
                result = executor.execute(&step.path, &step.command) => result,
            };

            let status = if result.succeeded() {
                RunStatus::Success
            } else {
                RunStatus::Failed
            };
            Self::report_with_retry(
                server.as_ref(),
                &backoff,
                step.step_id,
                status,
                result.exit_code,
                result.output,
            )
            .await;
        });
        Ok(true)
    }

    /// Deliver a step result, retrying with backoff unless the server
    /// rejects it outright
    async fn report_with_retry(
        server: &dyn ServerApi,
        backoff: &BackoffConfig,
        step_id: Uuid,
        status: RunStatus,
        exit_code: i32,
        output: String,
    ) {
        let mut attempt = 1;
        loop {
            match server.report(step_id, status, exit_code, output.clone()).await {
                Ok(()) => {
                    debug!(%step_id, attempt, "Step result reported");
                    return;
                }
                Err(e) if !e.is_rejection() && attempt < backoff.max_attempts => {
                    let delay = backoff.delay_for_attempt(attempt);
                    warn!(
                        %step_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Report failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(%step_id, attempt, error = %e, "Failed to report step result");
                    return;
                }
            }
        }
    }

    async fn heartbeat_loop(
        server: Arc<dyn ServerApi>,
        agent_id: Uuid,
        config: AgentRuntimeConfig,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    match server.heartbeat(agent_id).await {
                        Ok(()) => debug!(%agent_id, "Heartbeat sent"),
                        Err(e) => warn!(%agent_id, error = %e, "Heartbeat failed"),
                    }
                }
            }
        }
    }
}

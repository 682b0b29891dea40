//! Shared fixtures for the integration suites.

#![allow(dead_code)] // Not every suite uses every helper

use plumber_core::api::{PlumberService, ReportParams, ReportResponse};
use plumber_core::config::PlumberConfig;
use plumber_core::models::{Agent, AssignedStep, NewAgent, NewTask, Task, TaskExecution};
use plumber_core::orchestration::PlumberSystem;
use plumber_core::state_machine::RunStatus;
use plumber_core::store::{InMemoryStateStore, StateStore};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Intervals short enough for tests while keeping their relative order
pub fn fast_config() -> PlumberConfig {
    let mut config = PlumberConfig::default();
    config.liveness.sweep_interval_ms = 50;
    // Long enough that agents driven by hand never go stale mid-test
    config.liveness.heartbeat_timeout_ms = 10_000;
    config.orchestrator.step_timeout_ms = 3_000;
    config.orchestrator.step_poll_interval_ms = 20;
    config.backoff.initial_delay_ms = 1;
    config.backoff.max_delay_ms = 5;
    config.server.agent_token = "test-token".to_string();
    config.server.export_endpoint = "http://127.0.0.1:52181".to_string();
    config
}

/// Agents go stale after 300ms without a heartbeat
pub fn short_liveness_config() -> PlumberConfig {
    let mut config = fast_config();
    config.liveness.heartbeat_timeout_ms = 300;
    config
}

/// One TOML `[[step]]` table
pub fn step_toml(agent_id: Uuid, path: &str, command: &str) -> String {
    format!("[[step]]\nServerID = \"{agent_id}\"\nPath = \"{path}\"\nCMD = \"{command}\"\n\n")
}

pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// A running system over an in-memory store
pub struct TestHarness {
    pub store: Arc<InMemoryStateStore>,
    pub system: PlumberSystem,
    pub service: Arc<PlumberService>,
}

impl TestHarness {
    pub async fn start() -> Self {
        Self::start_with(fast_config()).await
    }

    pub async fn start_with(config: PlumberConfig) -> Self {
        Self::start_on(Arc::new(InMemoryStateStore::new()), config).await
    }

    /// Start on an existing store, e.g. to exercise startup recovery
    pub async fn start_on(store: Arc<InMemoryStateStore>, config: PlumberConfig) -> Self {
        let system = PlumberSystem::bootstrap(config, store.clone())
            .await
            .expect("bootstrap plumber system");
        let service = system.service();
        Self {
            store,
            system,
            service,
        }
    }

    pub async fn stop(mut self) {
        self.system.shutdown().await.expect("clean shutdown");
    }

    /// Create and register an agent so it is online
    pub async fn online_agent(&self, name: &str) -> Agent {
        let agent = self
            .store
            .create_agent(NewAgent::named(name))
            .await
            .expect("create agent");
        self.store
            .register_agent(agent.id, name, "127.0.0.1")
            .await
            .expect("register agent")
    }

    pub async fn offline_agent(&self, name: &str) -> Agent {
        self.store
            .create_agent(NewAgent::named(name))
            .await
            .expect("create agent")
    }

    /// Task whose steps run `(agent, command)` in order
    pub async fn task_with_steps(&self, steps: &[(Uuid, &str)]) -> Task {
        let config: String = steps
            .iter()
            .map(|(agent_id, command)| step_toml(*agent_id, "", command))
            .collect();
        self.service
            .create_task(NewTask {
                name: unique_name("task"),
                description: String::new(),
                config,
            })
            .await
            .expect("create task")
    }

    /// Poll as `agent_id` until a step arrives
    pub async fn next_step(&self, agent_id: Uuid) -> AssignedStep {
        for _ in 0..300 {
            let response = self
                .service
                .poll_task(&agent_id.to_string())
                .await
                .expect("poll");
            if let Some(task) = response.task {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent {agent_id} never received a step");
    }

    pub async fn report(&self, step_id: Uuid, exit_code: i32, output: &str) -> ReportResponse {
        let status = if exit_code == 0 { "success" } else { "failed" };
        self.service
            .report_step(ReportParams {
                step_id: step_id.to_string(),
                status: status.to_string(),
                exit_code,
                output: output.to_string(),
            })
            .await
            .expect("report")
    }

    /// Poll the store until the execution is terminal
    pub async fn wait_for_execution(&self, execution_id: Uuid) -> TaskExecution {
        wait_for_terminal(self.store.as_ref(), execution_id, Duration::from_secs(10)).await
    }
}

impl TestHarness {
    /// Task status is mirrored just after the execution finishes
    pub async fn wait_for_task_status(&self, task_id: Uuid, status: RunStatus) -> Task {
        for _ in 0..500 {
            let task = self.store.get_task(task_id).await.expect("get task");
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached {status}");
    }
}

pub async fn wait_for_terminal(
    store: &dyn StateStore,
    execution_id: Uuid,
    timeout: Duration,
) -> TaskExecution {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let execution = store
            .get_execution(execution_id)
            .await
            .expect("get execution");
        if execution.status.is_terminal() {
            return execution;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("execution {execution_id} still {} after {timeout:?}", execution.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

//! # Plumber System Bootstrap
//!
//! Wires the store, scheduler, liveness monitor, orchestrator and service
//! together and owns their lifecycle.
//!
//! ## Key Features
//!
//! - **Store Selection**: PostgreSQL from configuration, or any injected
//!   [`StateStore`] (the in-memory store in tests)
//! - **Startup Recovery**: re-adopts executions left `running` when
//!   `orchestrator.recover_on_startup` is set
//! - **Graceful Shutdown**: one [`CancellationToken`] stops the liveness
//!   monitor and every execution drive loop

use crate::api::PlumberService;
use crate::config::{ConfigManager, PlumberConfig};
use crate::error::{PlumberError, Result};
use crate::orchestration::{AgentLivenessMonitor, ExecutionOrchestrator, StepAssignmentScheduler};
use crate::rpc::RpcRouter;
use crate::store::{PostgresStateStore, StateStore};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Running engine handle
#[derive(Debug)]
pub struct PlumberSystem {
    config: Arc<PlumberConfig>,
    store: Arc<dyn StateStore>,
    orchestrator: Arc<ExecutionOrchestrator>,
    service: Arc<PlumberService>,
    shutdown: CancellationToken,
    /// Some while the liveness monitor runs
    monitor_handle: Option<JoinHandle<()>>,
}

impl PlumberSystem {
    /// Load configuration for the detected environment and connect to PostgreSQL
    pub async fn bootstrap_from_environment() -> Result<Self> {
        crate::logging::init_structured_logging();
        let manager = ConfigManager::load()?;
        info!(
            environment = %manager.environment(),
            "Bootstrapping plumber from environment configuration"
        );
        Self::bootstrap_with_postgres(manager.config().clone()).await
    }

    pub async fn bootstrap_with_postgres(config: PlumberConfig) -> Result<Self> {
        config.validate()?;
        let store = PostgresStateStore::connect(&config.database).await?;
        Self::bootstrap(config, Arc::new(store)).await
    }

    /// Start all background components on top of `store`
    pub async fn bootstrap(config: PlumberConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();

        let scheduler = Arc::new(
            StepAssignmentScheduler::new(store.clone(), config.scheduler.clone())
                .with_backoff(config.backoff.clone()),
        );
        let orchestrator = Arc::new(ExecutionOrchestrator::new(
            store.clone(),
            config.orchestrator.clone(),
            config.backoff.clone(),
            shutdown.child_token(),
        ));
        let service = Arc::new(PlumberService::new(
            store.clone(),
            scheduler,
            orchestrator.clone(),
            config.clone(),
        ));

        let monitor = AgentLivenessMonitor::new(store.clone(), config.liveness.clone());
        let monitor_handle = tokio::spawn(monitor.run(shutdown.child_token()));

        if config.orchestrator.recover_on_startup {
            match orchestrator.recover_running_executions().await {
                Ok(resumed) => info!(resumed, "Startup recovery complete"),
                // Not fatal: the engine can serve new work without it
                Err(e) => error!(error = %e, "Startup recovery failed"),
            }
        }

        info!("Plumber system started");
        Ok(Self {
            config,
            store,
            orchestrator,
            service,
            shutdown,
            monitor_handle: Some(monitor_handle),
        })
    }

    pub fn config(&self) -> &PlumberConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    pub fn service(&self) -> Arc<PlumberService> {
        self.service.clone()
    }

    pub fn orchestrator(&self) -> Arc<ExecutionOrchestrator> {
        self.orchestrator.clone()
    }

    pub fn router(&self) -> RpcRouter {
        RpcRouter::new(self.service.clone())
    }

    /// Token cancelled on shutdown, for components started by the embedder
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        self.monitor_handle.is_some()
    }

    /// Stop background work. Interrupted executions stay `running`.
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(handle) = self.monitor_handle.take() else {
            warn!("Plumber system already stopped");
            return Ok(());
        };

        info!("Shutting down plumber system");
        self.shutdown.cancel();
        self.orchestrator.shutdown().await;
        handle
            .await
            .map_err(|e| PlumberError::Internal(format!("liveness monitor panicked: {e}")))?;
        info!("Plumber system stopped");
        Ok(())
    }
}

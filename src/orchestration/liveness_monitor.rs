//! # Agent Liveness Monitor
//!
//! Periodic sweep that moves agents whose last heartbeat is older than the
//! configured window to `offline`. Agents that never sent a heartbeat are
//! left alone. A failed sweep is logged and retried on the next tick.

use crate::config::LivenessConfig;
use crate::error::{PlumberError, Result};
use crate::logging::log_agent_operation;
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AgentLivenessMonitor {
    store: Arc<dyn StateStore>,
    config: LivenessConfig,
}

impl AgentLivenessMonitor {
    pub fn new(store: Arc<dyn StateStore>, config: LivenessConfig) -> Self {
        Self { store, config }
    }

    /// Run a single sweep as of `now`, returning the agents marked offline
    #[instrument(skip(self))]
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let window = chrono::Duration::from_std(self.config.heartbeat_timeout())
            .map_err(|e| PlumberError::Configuration(format!("invalid heartbeat timeout: {e}")))?;
        let cutoff = now - window;

        let stale = self.store.mark_stale_agents_offline(cutoff).await?;
        for agent_id in &stale {
            log_agent_operation(
                "liveness_sweep",
                *agent_id,
                "offline",
                Some("heartbeat window exceeded"),
            );
        }
        debug!(marked_offline = stale.len(), %cutoff, "Liveness sweep complete");
        Ok(stale)
    }

    /// Sweep on every tick until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            sweep_interval_ms = self.config.sweep_interval_ms,
            heartbeat_timeout_ms = self.config.heartbeat_timeout_ms,
            "Agent liveness monitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Agent liveness monitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        error!(error = %e, "Liveness sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewAgent;
    use crate::state_machine::AgentStatus;
    use crate::store::InMemoryStateStore;

    #[tokio::test]
    async fn test_sweep_only_marks_agents_past_the_window() {
        let store = Arc::new(InMemoryStateStore::new());
        let fresh = store.create_agent(NewAgent::named("fresh")).await.unwrap();
        let stale = store.create_agent(NewAgent::named("stale")).await.unwrap();
        let silent = store.create_agent(NewAgent::named("silent")).await.unwrap();

        let now = Utc::now();
        store.heartbeat(fresh.id).await.unwrap();
        store.heartbeat(stale.id).await.unwrap();
        store.set_last_heartbeat(fresh.id, now - chrono::Duration::seconds(59)).unwrap();
        store.set_last_heartbeat(stale.id, now - chrono::Duration::seconds(61)).unwrap();
        store.set_agent_status(silent.id, AgentStatus::Online).await.unwrap();

        let monitor = AgentLivenessMonitor::new(store.clone(), LivenessConfig::default());
        let offline = monitor.sweep_once(now).await.unwrap();

        assert_eq!(offline, vec![stale.id]);
        assert!(store.get_agent(fresh.id).await.unwrap().is_online());
        assert!(!store.get_agent(stale.id).await.unwrap().is_online());
        assert!(store.get_agent(silent.id).await.unwrap().is_online());
    }

    #[tokio::test]
    async fn test_sweep_error_is_reported() {
        let store = Arc::new(InMemoryStateStore::new());
        store.set_available(false);
        let monitor = AgentLivenessMonitor::new(store, LivenessConfig::default());
        assert!(monitor.sweep_once(Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(InMemoryStateStore::new());
        let monitor = AgentLivenessMonitor::new(store, LivenessConfig::default());
        let token = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(token.clone()));
        token.cancel();
        handle.await.unwrap();
    }
}

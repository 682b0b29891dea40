//! # Structured Logging Module
//!
//! Environment-aware structured logging for the orchestration engine.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// `RUST_LOG` wins over the environment default; `PLUMBER_LOG_FORMAT=json`
/// switches the console output to JSON lines.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let json = std::env::var("PLUMBER_LOG_FORMAT").is_ok_and(|f| f == "json");

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // Tolerate a subscriber installed by the embedding application
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json_format = json,
            "Structured logging initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var("PLUMBER_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log structured data for execution-level operations
pub fn log_execution_operation(
    operation: &str,
    execution_id: Uuid,
    task_id: Uuid,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        execution_id = %execution_id,
        task_id = %task_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "EXECUTION_OPERATION"
    );
}

/// Log structured data for step operations
pub fn log_step_operation(
    operation: &str,
    execution_id: Uuid,
    step_id: Option<Uuid>,
    step_index: usize,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        execution_id = %execution_id,
        step_id = step_id.map(|id| id.to_string()),
        step_index = step_index,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "STEP_OPERATION"
    );
}

/// Log structured data for agent lifecycle events
pub fn log_agent_operation(operation: &str, agent_id: Uuid, status: &str, details: Option<&str>) {
    tracing::info!(
        operation = %operation,
        agent_id = %agent_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "AGENT_OPERATION"
    );
}

//! Error types for the Plumber engine.
//!
//! `StoreError` is what every [`StateStore`](crate::store::StateStore) operation
//! returns; `PlumberError` is the caller-facing taxonomy used by the scheduler,
//! the orchestrator and the operator/agent API.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("{entity} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        from: String,
        to: String,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound {
                entity: "row",
                id: "unknown".to_string(),
            },
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Serialization(err.to_string())
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlumberError {
    /// Malformed identifiers, missing fields, unparsable step lists
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("Agent {agent_id} is offline")]
    AgentOffline { agent_id: Uuid },
    #[error("Step {step_id} did not finish within {timeout:?}")]
    StepTimeout { step_id: Uuid, timeout: Duration },
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("Invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        from: String,
        to: String,
    },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlumberError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Only storage outages are worth retrying; everything else is deterministic.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }

    /// The request itself was refused; sending it again cannot succeed
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound { .. } | Self::InvalidTransition { .. }
        )
    }
}

impl From<StoreError> for PlumberError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => PlumberError::NotFound { entity, id },
            StoreError::Unavailable(msg) => PlumberError::StorageUnavailable(msg),
            StoreError::InvalidTransition {
                entity,
                id,
                from,
                to,
            } => PlumberError::InvalidTransition {
                entity,
                id,
                from,
                to,
            },
            StoreError::Serialization(msg) => PlumberError::Internal(msg),
        }
    }
}

impl From<serde_json::Error> for PlumberError {
    fn from(error: serde_json::Error) -> Self {
        PlumberError::Validation(format!("JSON serialization error: {error}"))
    }
}

pub type Result<T> = std::result::Result<T, PlumberError>;

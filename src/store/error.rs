//! Errors surfaced by the state store.

use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::domain::{RunStatus, StepStatus, SyncStatus};

/// Errors that can occur in the state store.
///
/// Unknown identifiers are not errors: lookups report them as `Ok(None)`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database file could not be created or opened (fatal)
    #[error("Failed to open state database {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Initial table creation failed (fatal)
    #[error("Failed to create schema: {0}")]
    Schema(#[source] rusqlite::Error),

    /// Unique or foreign-key constraint violated on write
    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The plan document does not have the expected shape
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Run {run_id} cannot transition {from} → {to}")]
    InvalidRunTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Step {step_id} cannot transition {from} → {to}")]
    InvalidStepTransition {
        step_id: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("Sync item {queue_id} is {status} and cannot be {action}")]
    InvalidSyncTransition {
        queue_id: i64,
        status: SyncStatus,
        action: &'static str,
    },

    /// A partial update contradicts the row it applies to
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),
}

impl StoreError {
    /// Check if this is a unique/foreign-key violation
    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, message) = &error {
            if failure.code == ErrorCode::ConstraintViolation {
                return Self::Constraint(
                    message.clone().unwrap_or_else(|| failure.to_string()),
                );
            }
        }
        Self::Database(error)
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

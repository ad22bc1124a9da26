//! Error types for the task orchestration core.

use uuid::Uuid;

use crate::task::TaskStatus;
use crate::workers::WorkerTier;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DatabaseError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Worker registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Recoverable: the caller is expected to fall back to an ad-hoc worker.
    #[error("Worker {id} not found")]
    NotFound { id: String },

    #[error("No ad-hoc base implementation registered for tier {tier}")]
    NoAdHocBase { tier: WorkerTier },
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Scheduler already started")]
    AlreadyStarted,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Protocol violation on task {task_id}: {reason}")]
    ProtocolViolation { task_id: Uuid, reason: String },
}

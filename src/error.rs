//! Error types for the job engine.

use uuid::Uuid;

use crate::jobs::JobStatus;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
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

/// Job-related errors surfaced by the queue.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Malformed input, rejected before anything is persisted.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    /// The job is leased and the caller did not ask to force the operation.
    #[error("Job {id} is leased by {owner}")]
    LeaseHeld { id: Uuid, owner: String },

    #[error("Job {id} is not leased by {agent_id}")]
    NotLeaseOwner { id: Uuid, agent_id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Task resolution and execution errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("No task registered for job name {name}")]
    Unregistered { name: String },

    #[error("Task {name} failed: {reason}")]
    Execution { name: String, reason: String },

    #[error("Invalid payload for task {name}: {reason}")]
    InvalidPayload { name: String, reason: String },
}

impl TaskError {
    /// Whether another attempt could succeed.
    ///
    /// Unknown task names and malformed payloads fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution { .. })
    }
}

/// Service registry and plugin errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Service {name} is already registered")]
    AlreadyRegistered { name: String },

    #[error("Service {name} is not registered")]
    NotRegistered { name: String },

    #[error("Service {name} is not a {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("Plugin {plugin} failed to initialize: {reason}")]
    PluginInit { plugin: String, reason: String },

    #[error("Plugin {plugin} failed executing {method}: {reason}")]
    PluginExecution {
        plugin: String,
        method: String,
        reason: String,
    },

    #[error("Plugin {plugin} has no method {method}")]
    UnknownMethod { plugin: String, method: String },

    #[error("Plugin {plugin} is not loaded")]
    UnknownPlugin { plugin: String },
}

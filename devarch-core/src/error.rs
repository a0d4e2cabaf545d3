//! Error types for DevArch.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for DevArch operations.
pub type Result<T> = std::result::Result<T, DevarchError>;

/// Main error type for DevArch.
#[derive(Error, Debug)]
pub enum DevarchError {
    // Input validation errors
    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    #[error("Key '{key}' uses reserved prefix '{prefix}' and cannot be overridden")]
    ReservedKey { key: String, prefix: String },

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    // Wiring errors
    #[error("Wiring cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    #[error(
        "Ambiguous wiring: {consumer} requires {contract}, candidates [{}]",
        candidates.join(", ")
    )]
    AmbiguousWiring { consumer: String, contract: String, candidates: Vec<String> },

    #[error("Missing provider: {consumer} requires {contract} but no instance in the stack exports it")]
    MissingProvider { consumer: String, contract: String },

    // Plan/apply errors
    #[error(
        "Plan for stack {stack_id} is stale: state changed since the plan was generated (changed: [{}])",
        changed_instances.join(", ")
    )]
    StalePlan { stack_id: String, changed_instances: Vec<String> },

    #[error("Timed out after {waited:?} waiting for the lock on stack {stack_id}")]
    LockTimeout { stack_id: String, waited: Duration },

    #[error("Apply of stack {stack_id} failed and was rolled back: {source}")]
    ApplyExecution {
        stack_id: String,
        #[source]
        source: Box<DevarchError>,
    },

    #[error("Plan for stack {stack_id} is blocked: {reason}")]
    PlanBlocked { stack_id: String, reason: String },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    // Lookup errors
    #[error("Stack not found: {stack}")]
    StackNotFound { stack: String },

    #[error("Stack {stack} is deleted")]
    StackDeleted { stack: String },

    #[error("Instance not found: {instance} in stack {stack}")]
    InstanceNotFound { stack: String, instance: String },

    #[error("Template not found: {template}")]
    TemplateNotFound { template: String },

    #[error("Name '{name}' is already in use: {reason}")]
    NameConflict { name: String, reason: String },

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database migration failed: {reason}")]
    MigrationFailed { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DevarchError {
    /// Create a Validation error from any displayable reason.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation { reason: reason.into() }
    }

    /// Whether retrying the same call later can succeed without re-planning.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Whether the error is caused by caller input rather than by the engine or datastore.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::ReservedKey { .. }
                | Self::InvalidName { .. }
                | Self::CycleDetected { .. }
                | Self::AmbiguousWiring { .. }
                | Self::MissingProvider { .. }
                | Self::PlanBlocked { .. }
                | Self::NameConflict { .. }
        )
    }
}

impl From<sqlx::Error> for DevarchError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for DevarchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

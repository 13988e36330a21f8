//! Error types for Hearth operations

use std::path::PathBuf;

use crate::worker::WorkerStatus;

/// Result type for Hearth operations
pub type Result<T> = std::result::Result<T, HearthError>;

/// Error types surfaced to callers of the supervisor.
///
/// Background failures (log appends, backup copies, tree members that refuse
/// to die) never show up here; they are logged through
/// [`crate::best_effort`] and the enclosing operation carries on.
#[derive(Debug, thiserror::Error)]
pub enum HearthError {
    /// Bad or missing deploy fields, unknown game type, missing executable
    #[error("Validation failed for {subject}: {reason}")]
    Validation { subject: String, reason: String },

    /// No worker with this ID is registered
    #[error("Worker not found: {worker_id}")]
    NotFound { worker_id: String },

    /// Command is not legal in the worker's current state
    #[error("Worker {worker_id} cannot {operation} while {status}")]
    InvalidState {
        worker_id: String,
        status: WorkerStatus,
        operation: &'static str,
    },

    /// Requested path escapes the worker's install directory
    #[error("Access denied for worker {worker_id}: {} is outside the install directory", path.display())]
    AccessDenied { worker_id: String, path: PathBuf },

    /// The OS refused to create the worker process
    #[error("Failed to spawn worker {worker_id}: {reason}")]
    Spawn { worker_id: String, reason: String },

    /// Primary I/O action failed
    #[error("I/O error for worker {worker_id} ({context}): {source}")]
    Io {
        worker_id: String,
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Persistence store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl HearthError {
    /// Build a validation error
    pub fn validation(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        HearthError::Validation {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    /// Build a not-found error
    pub fn not_found(worker_id: impl Into<String>) -> Self {
        HearthError::NotFound {
            worker_id: worker_id.into(),
        }
    }

    /// Wrap an I/O error from a primary action
    pub fn io(worker_id: impl Into<String>, context: impl Into<String>, source: std::io::Error) -> Self {
        HearthError::Io {
            worker_id: worker_id.into(),
            context: context.into(),
            source,
        }
    }
}

impl From<String> for HearthError {
    fn from(s: String) -> Self {
        HearthError::Other(s)
    }
}

impl From<&str> for HearthError {
    fn from(s: &str) -> Self {
        HearthError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for HearthError {
    fn from(err: anyhow::Error) -> Self {
        HearthError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_worker_id() {
        let err = HearthError::InvalidState {
            worker_id: "w-1".to_string(),
            status: WorkerStatus::Running,
            operation: "start",
        };
        assert_eq!(err.to_string(), "Worker w-1 cannot start while running");

        let err = HearthError::AccessDenied {
            worker_id: "w-2".to_string(),
            path: PathBuf::from("/etc/passwd"),
        };
        assert!(err.to_string().contains("w-2"));
        assert!(err.to_string().contains("/etc/passwd"));
    }
}

//! Error types for workflow-daemon

use thiserror::Error;
use workflow_types::WorkflowError;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A definition file could not be read or registered
    #[error("Definition {path}: {message}")]
    Definition { path: String, message: String },

    /// Inbound or outbound transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Engine error
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// Background task failure
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

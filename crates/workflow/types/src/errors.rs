//! Error types for workflow operations

use crate::{
    ExecutionId, TaskExecutionStatus, TaskId, WorkflowDefinitionId, WorkflowInstanceId,
};

/// Errors that can occur while registering or executing workflows
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow definition not found: {0}")]
    DefinitionNotFound(WorkflowDefinitionId),

    #[error("Workflow definition is invalid: {}", .0.join("; "))]
    InvalidDefinition(Vec<String>),

    #[error("Duplicate task id: {0}")]
    DuplicateTaskId(TaskId),

    #[error("Task {task} not found in workflow definition {definition}")]
    TaskNotInDefinition {
        definition: WorkflowDefinitionId,
        task: TaskId,
    },

    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(WorkflowInstanceId),

    #[error("Task {task} not found in workflow instance {instance}")]
    TaskNotFound {
        instance: WorkflowInstanceId,
        task: TaskId,
    },

    #[error("Stale update for task {task}: execution {received} is not the current execution")]
    StaleExecution { task: TaskId, received: ExecutionId },

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskExecutionStatus,
        to: TaskExecutionStatus,
    },

    #[error("Task {task} already dispatched as execution {execution}")]
    AlreadyDispatched { task: TaskId, execution: ExecutionId },

    #[error("Mandatory artifact '{artifact}' missing for task {task}")]
    MandatoryArtifactMissing { task: TaskId, artifact: String },

    #[error("Condition evaluation failed: {0}")]
    Condition(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Persistence error: {0}")]
    Store(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage service error: {0}")]
    StorageService(String),
}

/// Broad class of an error, deciding how callers react to it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed definition; rejected at registration
    Definition,
    /// Unknown ids or invalid transitions; the update can never succeed
    State,
    /// Collaborator failure; retry through redelivery
    Transient,
    /// Malformed condition; treated as false
    Condition,
    /// A mandatory artifact could not be resolved
    MandatoryArtifact,
}

impl WorkflowError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidDefinition(_)
            | Self::DuplicateTaskId(_)
            | Self::DefinitionNotFound(_)
            | Self::TaskNotInDefinition { .. } => ErrorCategory::Definition,
            Self::InstanceNotFound(_)
            | Self::TaskNotFound { .. }
            | Self::StaleExecution { .. }
            | Self::InvalidTransition { .. }
            | Self::AlreadyDispatched { .. }
            | Self::InvalidEvent(_) => ErrorCategory::State,
            Self::MandatoryArtifactMissing { .. } => ErrorCategory::MandatoryArtifact,
            Self::Condition(_) => ErrorCategory::Condition,
            Self::Store(_) | Self::Transport(_) | Self::StorageService(_) => {
                ErrorCategory::Transient
            }
        }
    }

    /// Whether redelivering the triggering message may succeed
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Result type alias for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

//! Store trait definitions

use async_trait::async_trait;
use workflow_types::{
    InstanceStatus, PayloadId, TaskExecution, TaskExecutionStatus, TaskId, WorkflowDefinition,
    WorkflowDefinitionId, WorkflowError, WorkflowInstance, WorkflowInstanceId,
};

/// Store-specific errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A conditional update lost against a concurrent writer
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        WorkflowError::Store(err.to_string())
    }
}

/// Lookup and registration of workflow definitions
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Latest revision of a definition
    async fn get_definition(
        &self,
        id: &WorkflowDefinitionId,
    ) -> StoreResult<Option<WorkflowDefinition>>;

    /// A specific revision, retired or not
    async fn get_revision(
        &self,
        id: &WorkflowDefinitionId,
        revision: u32,
    ) -> StoreResult<Option<WorkflowDefinition>>;

    /// Latest active revisions of the given definitions; unknown ids are skipped
    async fn get_by_ids(
        &self,
        ids: &[WorkflowDefinitionId],
    ) -> StoreResult<Vec<WorkflowDefinition>>;

    /// Latest active revisions whose trigger origin is one of `origins`
    async fn get_by_trigger_origin(
        &self,
        origins: &[String],
    ) -> StoreResult<Vec<WorkflowDefinition>>;

    /// Store a new revision, assigning the next revision number and
    /// retiring the previous one. Returns the assigned revision.
    async fn save_revision(&self, definition: WorkflowDefinition) -> StoreResult<u32>;

    /// Latest active revision of every definition
    async fn list_definitions(&self) -> StoreResult<Vec<WorkflowDefinition>>;
}

/// Persistence of workflow instances
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get_instance(&self, id: &WorkflowInstanceId)
        -> StoreResult<Option<WorkflowInstance>>;

    /// The instance for a (definition, payload) pair, if any
    async fn get_by_definition_and_payload(
        &self,
        definition_id: &WorkflowDefinitionId,
        payload_id: &PayloadId,
    ) -> StoreResult<Option<WorkflowInstance>>;

    /// Insert a new instance. Returns `false` without inserting when an
    /// instance already exists for the same (definition, payload) pair.
    async fn create_instance(&self, instance: WorkflowInstance) -> StoreResult<bool>;

    /// Compare-and-set a task's status
    async fn update_task_status(
        &self,
        instance_id: &WorkflowInstanceId,
        task_id: &TaskId,
        expected: TaskExecutionStatus,
        status: TaskExecutionStatus,
    ) -> StoreResult<()>;

    /// Replace a task execution record if its stored status is `expected`
    async fn update_task(
        &self,
        instance_id: &WorkflowInstanceId,
        task: TaskExecution,
        expected: TaskExecutionStatus,
    ) -> StoreResult<()>;

    async fn update_aggregate_status(
        &self,
        instance_id: &WorkflowInstanceId,
        status: InstanceStatus,
    ) -> StoreResult<()>;

    /// Add task executions. A task already present in `Created` is replaced;
    /// a task present in any other status is a conflict.
    async fn append_tasks(
        &self,
        instance_id: &WorkflowInstanceId,
        tasks: Vec<TaskExecution>,
    ) -> StoreResult<()>;

    async fn list_instances(&self) -> StoreResult<Vec<WorkflowInstance>>;
}

//! Workflow instances: one execution of a definition against one payload
//!
//! A WorkflowInstance exclusively owns its list of [`TaskExecution`]s. Task
//! executions refer back to the definition only by task id; the definition
//! revision the instance was created from is pinned on the instance.

use crate::{
    ArtifactPaths, ExecutionId, Metadata, PayloadId, TaskId, WorkflowDefinition,
    WorkflowDefinitionId, WorkflowInstanceId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Statuses ─────────────────────────────────────────────────────────

/// Aggregate status of a workflow instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// In progress
    #[default]
    Created,
    Succeeded,
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Lifecycle status of a task execution
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskExecutionStatus {
    #[default]
    Created,
    Dispatched,
    Accepted,
    Succeeded,
    Failed,
    Canceled,
    Exported,
}

impl TaskExecutionStatus {
    pub const ALL: [TaskExecutionStatus; 7] = [
        Self::Created,
        Self::Dispatched,
        Self::Accepted,
        Self::Succeeded,
        Self::Failed,
        Self::Canceled,
        Self::Exported,
    ];

    /// Sent to a backend and not yet finished
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Accepted)
    }

    /// Finished, successfully or not
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Canceled | Self::Exported
        )
    }
}

impl std::fmt::Display for TaskExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why a task execution failed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    #[default]
    None,
    Unknown,
    TimedOut,
    PluginError,
    ExternalServiceError,
    Rejected,
}

// ── Task Execution ───────────────────────────────────────────────────

/// One instantiation of a task node inside a workflow instance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    /// Unique per dispatch
    pub execution_id: ExecutionId,
    pub workflow_instance_id: WorkflowInstanceId,
    /// Task node id in the owning definition
    pub task_id: TaskId,
    pub task_type: String,
    pub status: TaskExecutionStatus,
    #[serde(default)]
    pub reason: FailureReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Plugin arguments with placeholders already resolved
    #[serde(default)]
    pub plugin_arguments: BTreeMap<String, String>,
    #[serde(default)]
    pub input_artifacts: ArtifactPaths,
    #[serde(default)]
    pub output_artifacts: ArtifactPaths,
    pub output_directory: String,
    /// The task whose completion created this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_task_id: Option<TaskId>,
    /// Metadata reported by the backend on success
    #[serde(default)]
    pub result_metadata: Metadata,
    #[serde(default)]
    pub execution_stats: BTreeMap<String, String>,
    pub timeout_minutes: f64,
    /// Succeeded, with an export request outstanding
    #[serde(default)]
    pub export_pending: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl TaskExecution {
    /// A fresh execution in `Created` with its output directory derived
    /// from the payload, instance and execution ids
    pub fn new(
        instance: &WorkflowInstance,
        task_id: TaskId,
        task_type: impl Into<String>,
        timeout_minutes: f64,
    ) -> Self {
        let execution_id = ExecutionId::generate();
        let output_directory = format!(
            "{}/workflows/{}/{}/",
            instance.payload_id, instance.id, execution_id
        );
        Self {
            execution_id,
            workflow_instance_id: instance.id.clone(),
            task_id,
            task_type: task_type.into(),
            status: TaskExecutionStatus::Created,
            reason: FailureReason::None,
            error_message: None,
            plugin_arguments: BTreeMap::new(),
            input_artifacts: ArtifactPaths::new(),
            output_artifacts: ArtifactPaths::new(),
            output_directory,
            previous_task_id: None,
            result_metadata: Metadata::new(),
            execution_stats: BTreeMap::new(),
            timeout_minutes,
            export_pending: false,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn with_previous(mut self, previous: Option<TaskId>) -> Self {
        self.previous_task_id = previous;
        self
    }

    /// Counts as outstanding for the aggregate status
    pub fn is_outstanding(&self) -> bool {
        !self.status.is_complete() || self.export_pending
    }

    /// Record a status change locally
    pub fn set_status(&mut self, status: TaskExecutionStatus) {
        self.status = status;
        if status.is_complete() && self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }
}

// ── Workflow Instance ────────────────────────────────────────────────

/// A running (or finished) execution of a workflow definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowInstanceId,
    pub definition_id: WorkflowDefinitionId,
    /// The revision this instance executes
    pub definition_revision: u32,
    pub workflow_name: String,
    pub payload_id: PayloadId,
    /// Origin title of the gateway the workflow is attached to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Bucket holding the payload and all task outputs
    pub bucket_id: String,
    pub start_time: DateTime<Utc>,
    pub status: InstanceStatus,
    #[serde(default)]
    pub tasks: Vec<TaskExecution>,
}

impl WorkflowInstance {
    pub fn new(
        definition: &WorkflowDefinition,
        payload_id: PayloadId,
        bucket_id: impl Into<String>,
    ) -> Self {
        Self {
            id: WorkflowInstanceId::generate(),
            definition_id: definition.id.clone(),
            definition_revision: definition.revision,
            workflow_name: definition.name.clone(),
            payload_id,
            origin: definition.gateway.origin.clone(),
            bucket_id: bucket_id.into(),
            start_time: Utc::now(),
            status: InstanceStatus::Created,
            tasks: Vec::new(),
        }
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&TaskExecution> {
        self.tasks.iter().find(|t| &t.task_id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &TaskId) -> Option<&mut TaskExecution> {
        self.tasks.iter_mut().find(|t| &t.task_id == task_id)
    }

    pub fn first_task(&self) -> Option<&TaskExecution> {
        self.tasks.first()
    }

    pub fn has_failed_task(&self) -> bool {
        self.tasks
            .iter()
            .any(|t| t.status == TaskExecutionStatus::Failed)
    }

    pub fn is_failed(&self) -> bool {
        self.status == InstanceStatus::Failed
    }

    /// Insert new executions, replacing any not-yet-dispatched execution of
    /// the same task node
    pub fn merge_tasks(&mut self, tasks: Vec<TaskExecution>) {
        for task in tasks {
            match self.tasks.iter_mut().find(|t| t.task_id == task.task_id) {
                Some(existing) => *existing = task,
                None => self.tasks.push(task),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskNode;

    fn make_instance() -> WorkflowInstance {
        let def = WorkflowDefinition::new("wf", "1").with_task(TaskNode::new("a", "argo"));
        WorkflowInstance::new(&def, PayloadId::new("payload-1"), "bucket-1")
    }

    #[test]
    fn test_output_directory_layout() {
        let inst = make_instance();
        let exec = TaskExecution::new(&inst, TaskId::new("a"), "argo", 60.0);
        assert_eq!(
            exec.output_directory,
            format!("payload-1/workflows/{}/{}/", inst.id, exec.execution_id)
        );
        assert_eq!(exec.status, TaskExecutionStatus::Created);
    }

    #[test]
    fn test_outstanding_tracks_pending_export() {
        let inst = make_instance();
        let mut exec = TaskExecution::new(&inst, TaskId::new("a"), "argo", 60.0);
        assert!(exec.is_outstanding());
        exec.set_status(TaskExecutionStatus::Succeeded);
        assert!(!exec.is_outstanding());
        assert!(exec.ended_at.is_some());
        exec.export_pending = true;
        assert!(exec.is_outstanding());
    }

    #[test]
    fn test_merge_tasks_replaces_same_task_id() {
        let mut inst = make_instance();
        let first = TaskExecution::new(&inst, TaskId::new("a"), "argo", 60.0);
        let replacement = TaskExecution::new(&inst, TaskId::new("a"), "argo", 60.0);
        let other = TaskExecution::new(&inst, TaskId::new("b"), "argo", 60.0);
        inst.merge_tasks(vec![first]);
        inst.merge_tasks(vec![replacement.clone(), other]);
        assert_eq!(inst.tasks.len(), 2);
        assert_eq!(
            inst.task(&TaskId::new("a")).unwrap().execution_id,
            replacement.execution_id
        );
    }

    #[test]
    fn test_status_predicates() {
        assert!(TaskExecutionStatus::Accepted.is_in_flight());
        assert!(!TaskExecutionStatus::Created.is_in_flight());
        assert!(TaskExecutionStatus::Exported.is_complete());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(!InstanceStatus::Created.is_terminal());
    }
}

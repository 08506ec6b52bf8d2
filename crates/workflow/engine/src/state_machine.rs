//! Task and instance status transitions
//!
//! Task executions move forward only:
//!
//! ```text
//! Created ─▶ Dispatched ─▶ Accepted ─▶ Succeeded ─▶ Exported
//!    │            │            │    └─▶ Failed
//!    │            │            └─▶ Canceled
//!    └────────────┴──▶ Succeeded | Failed | Canceled
//! ```
//!
//! A Succeeded task with an export outstanding may still move to Failed when
//! the export fails. Every other transition, including re-applying the
//! current status, is rejected.
//!
//! Instance status is derived from the task list: Failed as soon as any task
//! fails (and never leaves Failed), Succeeded once every task is finished
//! with nothing outstanding, Created otherwise.

use crate::store::InstanceStore;
use std::sync::Arc;
use workflow_types::{
    InstanceStatus, TaskExecution, TaskExecutionStatus, TaskId, WorkflowError, WorkflowInstance,
    WorkflowResult,
};

/// Whether `current → requested` is allowed, ignoring export state
pub fn validate_transition(current: TaskExecutionStatus, requested: TaskExecutionStatus) -> bool {
    use TaskExecutionStatus::*;
    matches!(
        (current, requested),
        (Created, Dispatched | Succeeded | Failed | Canceled)
            | (Dispatched, Accepted | Succeeded | Failed | Canceled)
            | (Accepted, Succeeded | Failed | Canceled)
            | (Succeeded, Exported)
    )
}

/// Whether `task` may move to `requested`
pub fn validate_task_transition(task: &TaskExecution, requested: TaskExecutionStatus) -> bool {
    if task.export_pending
        && task.status == TaskExecutionStatus::Succeeded
        && requested == TaskExecutionStatus::Failed
    {
        return true;
    }
    validate_transition(task.status, requested)
}

/// Aggregate status of `instance`, with `pending` standing in for the stored
/// execution of the same task when given
pub fn aggregate_status(
    instance: &WorkflowInstance,
    pending: Option<&TaskExecution>,
) -> InstanceStatus {
    if instance.status == InstanceStatus::Failed {
        return InstanceStatus::Failed;
    }

    let effective = |task: &TaskExecution| -> TaskExecution {
        match pending {
            Some(p) if p.task_id == task.task_id => p.clone(),
            _ => task.clone(),
        }
    };
    let mut tasks: Vec<TaskExecution> = instance.tasks.iter().map(effective).collect();
    if let Some(p) = pending {
        if instance.task(&p.task_id).is_none() {
            tasks.push(p.clone());
        }
    }

    if tasks.iter().any(|t| t.status == TaskExecutionStatus::Failed) {
        return InstanceStatus::Failed;
    }
    if !tasks.is_empty() && tasks.iter().all(|t| !t.is_outstanding()) {
        return InstanceStatus::Succeeded;
    }
    InstanceStatus::Created
}

/// Applies validated transitions through the instance store
#[derive(Clone)]
pub struct WorkflowInstanceStateMachine {
    store: Arc<dyn InstanceStore>,
}

impl WorkflowInstanceStateMachine {
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self { store }
    }

    /// Move one task to `status`, compare-and-set against its current status.
    /// The local copy of `instance` is updated on success.
    pub async fn apply_task_update(
        &self,
        instance: &mut WorkflowInstance,
        task_id: &TaskId,
        status: TaskExecutionStatus,
    ) -> WorkflowResult<()> {
        let task = instance
            .task(task_id)
            .ok_or_else(|| WorkflowError::TaskNotFound {
                instance: instance.id.clone(),
                task: task_id.clone(),
            })?;
        if !validate_task_transition(task, status) {
            return Err(WorkflowError::InvalidTransition {
                task: task_id.clone(),
                from: task.status,
                to: status,
            });
        }
        let expected = task.status;

        self.store
            .update_task_status(&instance.id, task_id, expected, status)
            .await?;

        if let Some(task) = instance.task_mut(task_id) {
            task.set_status(status);
        }
        tracing::debug!(
            workflow_instance_id = %instance.id,
            task_id = %task_id,
            from = %expected,
            to = %status,
            "Task status updated"
        );
        Ok(())
    }

    /// Persist a full task record whose stored status is `expected`
    pub async fn persist_task(
        &self,
        instance: &mut WorkflowInstance,
        task: TaskExecution,
        expected: TaskExecutionStatus,
    ) -> WorkflowResult<()> {
        if expected != task.status && !validate_transition(expected, task.status) {
            let export_failure = expected == TaskExecutionStatus::Succeeded
                && task.status == TaskExecutionStatus::Failed;
            if !export_failure {
                return Err(WorkflowError::InvalidTransition {
                    task: task.task_id.clone(),
                    from: expected,
                    to: task.status,
                });
            }
        }

        self.store
            .update_task(&instance.id, task.clone(), expected)
            .await?;
        instance.merge_tasks(vec![task]);
        Ok(())
    }

    /// Recompute the aggregate status from the local copy and persist it
    /// when it changed
    pub async fn refresh_aggregate(
        &self,
        instance: &mut WorkflowInstance,
        pending: Option<&TaskExecution>,
    ) -> WorkflowResult<InstanceStatus> {
        let status = aggregate_status(instance, pending);
        if status != instance.status {
            self.store
                .update_aggregate_status(&instance.id, status)
                .await?;
            tracing::info!(
                workflow_instance_id = %instance.id,
                from = %instance.status,
                to = %status,
                "Workflow instance status changed"
            );
            instance.status = status;
        }
        Ok(status)
    }

    /// Force the instance into Failed
    pub async fn fail_instance(&self, instance: &mut WorkflowInstance) -> WorkflowResult<()> {
        if instance.status != InstanceStatus::Failed {
            self.store
                .update_aggregate_status(&instance.id, InstanceStatus::Failed)
                .await?;
            tracing::warn!(workflow_instance_id = %instance.id, "Workflow instance failed");
            instance.status = InstanceStatus::Failed;
        }
        Ok(())
    }
}

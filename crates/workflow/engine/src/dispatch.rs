//! Dispatch coordination
//!
//! Turns a `Created` task execution into an outbound message. The message is
//! handed to the transport first and the task moves to `Dispatched` only
//! after the hand-off succeeded; a failed hand-off leaves the task in
//! `Created` so the triggering event can be redelivered safely.
//!
//! Storage credentials are issued once per (instance, bucket) and cached
//! until the instance finishes.

use crate::config::EngineConfig;
use crate::object_storage::CredentialIssuer;
use crate::state_machine::WorkflowInstanceStateMachine;
use crate::transport::{Publisher, TransportError};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use workflow_types::{
    ArtifactPaths, Credentials, ExportRequestEvent, JsonMessage, StorageInfo, TaskDispatchEvent,
    TaskExecutionStatus, TaskId, WorkflowError, WorkflowInstance, WorkflowInstanceId,
    WorkflowResult,
};

/// Argument naming a task whose output is being reviewed
pub const REVIEWED_TASK_ID_ARG: &str = "reviewed_task_id";
/// Argument added with the execution id of the reviewed task
pub const REVIEWED_EXECUTION_ID_ARG: &str = "reviewed_execution_id";

pub struct DispatchCoordinator {
    publisher: Arc<dyn Publisher>,
    credentials: Arc<dyn CredentialIssuer>,
    state: WorkflowInstanceStateMachine,
    config: EngineConfig,
    secrets: DashMap<WorkflowInstanceId, HashMap<String, Credentials>>,
}

impl DispatchCoordinator {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        credentials: Arc<dyn CredentialIssuer>,
        state: WorkflowInstanceStateMachine,
        config: EngineConfig,
    ) -> Self {
        Self {
            publisher,
            credentials,
            state,
            config,
            secrets: DashMap::new(),
        }
    }

    /// Publish a task dispatch request and mark the task `Dispatched`
    pub async fn dispatch(
        &self,
        instance: &mut WorkflowInstance,
        task_id: &TaskId,
        correlation_id: &str,
    ) -> WorkflowResult<TaskDispatchEvent> {
        let task = instance
            .task(task_id)
            .ok_or_else(|| WorkflowError::TaskNotFound {
                instance: instance.id.clone(),
                task: task_id.clone(),
            })?;
        if task.status != TaskExecutionStatus::Created {
            return Err(WorkflowError::AlreadyDispatched {
                task: task_id.clone(),
                execution: task.execution_id.clone(),
            });
        }

        let bucket = instance.bucket_id.clone();
        let credentials = self.credentials_for(&instance.id, &bucket).await?;
        let inputs = self.storage_infos(&task.input_artifacts, &bucket, &credentials);
        let outputs = self.storage_infos(&task.output_artifacts, &bucket, &credentials);

        let mut arguments = task.plugin_arguments.clone();
        if let Some(reviewed) = arguments.get(REVIEWED_TASK_ID_ARG).cloned() {
            if let Some(reviewed_task) = instance.task(&TaskId::new(reviewed)) {
                arguments.insert(
                    REVIEWED_EXECUTION_ID_ARG.to_string(),
                    reviewed_task.execution_id.to_string(),
                );
            }
        }

        let event = TaskDispatchEvent {
            workflow_instance_id: instance.id.clone(),
            task_id: task.task_id.clone(),
            execution_id: task.execution_id.clone(),
            payload_id: instance.payload_id.clone(),
            correlation_id: correlation_id.to_string(),
            task_plugin_type: task.task_type.clone(),
            arguments,
            inputs,
            outputs,
            intermediate_storage: StorageInfo {
                name: task.task_id.to_string(),
                endpoint: self.config.storage.endpoint.clone(),
                bucket: bucket.clone(),
                relative_root_path: task.output_directory.clone(),
                secured_connection: self.config.storage.secured_connection,
                credentials: Some(credentials),
            },
            timeout_minutes: task.timeout_minutes,
        };

        self.publish(&self.config.messaging.topics.task_dispatch, &event, correlation_id)
            .await?;
        self.state
            .apply_task_update(instance, task_id, TaskExecutionStatus::Dispatched)
            .await?;

        tracing::info!(
            workflow_instance_id = %event.workflow_instance_id,
            task_id = %event.task_id,
            execution_id = %event.execution_id,
            task_type = %event.task_plugin_type,
            "Task dispatched"
        );
        Ok(event)
    }

    /// Publish an export request. Status changes are left to the caller.
    pub async fn dispatch_export(
        &self,
        instance: &WorkflowInstance,
        task_id: &TaskId,
        destinations: Vec<String>,
        files: Vec<String>,
        correlation_id: &str,
    ) -> WorkflowResult<ExportRequestEvent> {
        let event = ExportRequestEvent {
            workflow_instance_id: instance.id.clone(),
            export_task_id: task_id.clone(),
            correlation_id: correlation_id.to_string(),
            destinations,
            files,
        };
        self.publish(&self.config.messaging.export_routing_key(), &event, correlation_id)
            .await?;

        tracing::info!(
            workflow_instance_id = %instance.id,
            task_id = %task_id,
            destinations = ?event.destinations,
            files = event.files.len(),
            "Export requested"
        );
        Ok(event)
    }

    /// Drop cached credentials of a finished instance
    pub fn evict(&self, instance_id: &WorkflowInstanceId) {
        if self.secrets.remove(instance_id).is_some() {
            tracing::debug!(workflow_instance_id = %instance_id, "Storage credentials evicted");
        }
    }

    /// Number of buckets with cached credentials for an instance
    pub fn cached_secret_count(&self, instance_id: &WorkflowInstanceId) -> usize {
        self.secrets
            .get(instance_id)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    async fn credentials_for(
        &self,
        instance_id: &WorkflowInstanceId,
        bucket: &str,
    ) -> WorkflowResult<Credentials> {
        if let Some(cached) = self
            .secrets
            .get(instance_id)
            .and_then(|entry| entry.get(bucket).cloned())
        {
            return Ok(cached);
        }

        let location = StorageInfo {
            endpoint: self.config.storage.endpoint.clone(),
            bucket: bucket.to_string(),
            secured_connection: self.config.storage.secured_connection,
            ..StorageInfo::default()
        };
        let issued = self
            .credentials
            .issue_access_secret(&location)
            .await
            .map_err(|e| WorkflowError::StorageService(e.to_string()))?;

        self.secrets
            .entry(instance_id.clone())
            .or_default()
            .insert(bucket.to_string(), issued.clone());
        Ok(issued)
    }

    fn storage_infos(
        &self,
        artifacts: &ArtifactPaths,
        bucket: &str,
        credentials: &Credentials,
    ) -> Vec<StorageInfo> {
        artifacts
            .iter()
            .map(|(name, path)| StorageInfo {
                name: name.clone(),
                endpoint: self.config.storage.endpoint.clone(),
                bucket: bucket.to_string(),
                relative_root_path: path.clone(),
                secured_connection: self.config.storage.secured_connection,
                credentials: Some(credentials.clone()),
            })
            .collect()
    }

    async fn publish<T: serde::Serialize>(
        &self,
        routing_key: &str,
        body: &T,
        correlation_id: &str,
    ) -> WorkflowResult<()> {
        let message = JsonMessage::new(body, correlation_id)
            .map_err(|e| TransportError::Encoding(e.to_string()))?;
        self.publisher.publish(routing_key, message).await?;
        Ok(())
    }
}

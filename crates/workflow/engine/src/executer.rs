//! Workflow executer service
//!
//! Handles the three inbound events:
//!
//! - payload ready: create one instance per matching definition and start
//!   its first task
//! - task update: apply the reported status, verify outputs, then resolve
//!   and dispatch downstream tasks
//! - export complete: finish the exporting task and continue the graph
//!
//! Downstream tasks are dispatched before the completing task's status is
//! persisted, so a failure part-way leaves the stored task where it was and
//! redelivering the event redoes the remaining work. Router tasks are
//! resolved in-engine with a worklist and persisted once everything below
//! them has been handed off.

use crate::artifact_mapper::ArtifactMapper;
use crate::config::EngineConfig;
use crate::context::{resolution_references, template_references, InstanceContext};
use crate::destination_resolver::TaskDestinationResolver;
use crate::dispatch::DispatchCoordinator;
use crate::object_storage::{
    CredentialIssuer, DicomMetadataSource, InMemoryObjectStorage, StorageService,
};
use crate::state_machine::{validate_task_transition, WorkflowInstanceStateMachine};
use crate::store::{DefinitionStore, InMemoryStore, InstanceStore};
use crate::transport::Publisher;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::Instrument;
use workflow_types::{
    ErrorCategory, ExportCompleteEvent, ExportStatus, FailureReason, FileExportStatus,
    InstanceStatus, PayloadReadyEvent, TaskExecution, TaskExecutionStatus, TaskId, TaskKind,
    TaskNode, TaskUpdateEvent, WorkflowDefinition, WorkflowError, WorkflowInstance,
    WorkflowInstanceId, WorkflowResult,
};

/// External collaborators of the executer
#[derive(Clone)]
pub struct EngineServices {
    pub definitions: Arc<dyn DefinitionStore>,
    pub instances: Arc<dyn InstanceStore>,
    pub storage: Arc<dyn StorageService>,
    pub credentials: Arc<dyn CredentialIssuer>,
    pub metadata: Arc<dyn DicomMetadataSource>,
    pub publisher: Arc<dyn Publisher>,
}

impl EngineServices {
    /// Wire every collaborator to in-memory implementations
    pub fn in_memory(
        store: InMemoryStore,
        objects: InMemoryObjectStorage,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let store = Arc::new(store);
        let objects = Arc::new(objects);
        Self {
            definitions: store.clone(),
            instances: store,
            storage: objects.clone(),
            credentials: objects.clone(),
            metadata: objects,
            publisher,
        }
    }
}

pub struct WorkflowExecuterService {
    definitions: Arc<dyn DefinitionStore>,
    instances: Arc<dyn InstanceStore>,
    storage: Arc<dyn StorageService>,
    metadata: Arc<dyn DicomMetadataSource>,
    state: WorkflowInstanceStateMachine,
    mapper: ArtifactMapper,
    resolver: TaskDestinationResolver,
    dispatcher: DispatchCoordinator,
}

impl WorkflowExecuterService {
    pub fn new(config: EngineConfig, services: EngineServices) -> Self {
        let state = WorkflowInstanceStateMachine::new(services.instances.clone());
        let mapper = ArtifactMapper::new(services.storage.clone());
        let resolver =
            TaskDestinationResolver::new(mapper.clone(), config.engine.task_timeout_minutes);
        let dispatcher = DispatchCoordinator::new(
            services.publisher,
            services.credentials,
            state.clone(),
            config,
        );
        Self {
            definitions: services.definitions,
            instances: services.instances,
            storage: services.storage,
            metadata: services.metadata,
            state,
            mapper,
            resolver,
            dispatcher,
        }
    }

    // ── Payloads ─────────────────────────────────────────────────────

    /// Create and start an instance for every definition the payload
    /// triggers. Returns the ids of instances created or resumed.
    pub async fn process_new_payload(
        &self,
        event: &PayloadReadyEvent,
    ) -> WorkflowResult<Vec<WorkflowInstanceId>> {
        let span = tracing::info_span!(
            "payload",
            payload_id = %event.payload_id,
            correlation_id = %event.correlation_id
        );
        async move {
            if event.payload_id.as_str().is_empty() || event.bucket.is_empty() {
                return Err(WorkflowError::InvalidEvent(
                    "payload event requires a payload id and a bucket".into(),
                ));
            }

            let definitions = if event.workflow_ids.is_empty() {
                let origins: Vec<String> = [&event.called_origin, &event.calling_origin]
                    .into_iter()
                    .filter(|o| !o.is_empty())
                    .cloned()
                    .collect();
                self.definitions.get_by_trigger_origin(&origins).await?
            } else {
                self.definitions.get_by_ids(&event.workflow_ids).await?
            };

            if definitions.is_empty() {
                tracing::info!("No workflow matches the payload");
                return Ok(Vec::new());
            }

            let outcomes = futures::future::join_all(
                definitions.iter().map(|def| self.start_instance(def, event)),
            )
            .await;

            let mut started = Vec::new();
            let mut retry = None;
            for (def, outcome) in definitions.iter().zip(outcomes) {
                match outcome {
                    Ok(Some(id)) => started.push(id),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(definition_id = %def.id, error = %e, "Workflow could not be started");
                        if e.is_retryable() && retry.is_none() {
                            retry = Some(e);
                        }
                    }
                }
            }
            match retry {
                Some(e) => Err(e),
                None => Ok(started),
            }
        }
        .instrument(span)
        .await
    }

    async fn start_instance(
        &self,
        definition: &WorkflowDefinition,
        event: &PayloadReadyEvent,
    ) -> WorkflowResult<Option<WorkflowInstanceId>> {
        if let Some(existing) = self
            .instances
            .get_by_definition_and_payload(&definition.id, &event.payload_id)
            .await?
        {
            return self.resume_instance(existing, &event.correlation_id).await;
        }

        let first = definition.first_task().ok_or_else(|| {
            WorkflowError::InvalidDefinition(vec![format!(
                "workflow {} has no tasks",
                definition.id
            )])
        })?;

        let mut instance =
            WorkflowInstance::new(definition, event.payload_id.clone(), event.bucket.clone());
        let execution = {
            let mut ctx = InstanceContext::new(&instance, definition);
            ctx.prefetch(&template_references(first), self.metadata.as_ref())
                .await?;
            self.resolver.create_execution(first, None, &ctx).await
        };
        match execution {
            Ok(execution) => instance.tasks.push(execution),
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                tracing::warn!(definition_id = %definition.id, error = %e, "First task could not be created");
                instance.status = InstanceStatus::Failed;
            }
        }

        if !self.instances.create_instance(instance.clone()).await? {
            tracing::debug!(definition_id = %definition.id, "Instance created concurrently");
            return Ok(None);
        }
        tracing::info!(
            workflow_instance_id = %instance.id,
            definition_id = %definition.id,
            revision = definition.revision,
            "Workflow instance created"
        );
        if instance.is_failed() {
            return Ok(Some(instance.id));
        }

        let correlation_id = event.correlation_id.as_str();
        match self
            .run_tasks(&mut instance, definition, vec![first.id.clone()], correlation_id)
            .await
        {
            Ok(()) => {}
            Err(e) if e.category() == ErrorCategory::MandatoryArtifact => {
                tracing::warn!(workflow_instance_id = %instance.id, error = %e, "Workflow failed on missing artifact");
                self.state.fail_instance(&mut instance).await?;
            }
            Err(e) => return Err(e),
        }
        self.refresh(&mut instance).await?;
        Ok(Some(instance.id))
    }

    /// An instance already exists for the payload: redo a first dispatch
    /// that never reached the transport, otherwise nothing to do
    async fn resume_instance(
        &self,
        mut instance: WorkflowInstance,
        correlation_id: &str,
    ) -> WorkflowResult<Option<WorkflowInstanceId>> {
        let first = match instance.first_task() {
            Some(t) if t.status == TaskExecutionStatus::Created && !instance.is_failed() => {
                t.task_id.clone()
            }
            _ => {
                tracing::debug!(workflow_instance_id = %instance.id, "Instance already exists for payload");
                return Ok(None);
            }
        };

        let definition = self.load_definition(&instance).await?;
        tracing::info!(workflow_instance_id = %instance.id, task_id = %first, "Resuming first dispatch");
        self.run_tasks(&mut instance, &definition, vec![first], correlation_id)
            .await?;
        self.refresh(&mut instance).await?;
        Ok(Some(instance.id))
    }

    // ── Task updates ─────────────────────────────────────────────────

    pub async fn process_task_update(&self, event: &TaskUpdateEvent) -> WorkflowResult<()> {
        let span = tracing::info_span!(
            "task_update",
            workflow_instance_id = %event.workflow_instance_id,
            task_id = %event.task_id,
            execution_id = %event.execution_id,
            status = %event.status,
            correlation_id = %event.correlation_id
        );
        async move {
            let mut instance = self.load_instance(&event.workflow_instance_id).await?;
            let task = instance
                .task(&event.task_id)
                .cloned()
                .ok_or_else(|| WorkflowError::TaskNotFound {
                    instance: instance.id.clone(),
                    task: event.task_id.clone(),
                })?;

            if task.execution_id != event.execution_id {
                return Err(WorkflowError::StaleExecution {
                    task: task.task_id,
                    received: event.execution_id.clone(),
                });
            }
            // Exported is only reached through export completion
            if event.status == TaskExecutionStatus::Exported
                || !validate_task_transition(&task, event.status)
            {
                tracing::warn!(from = %task.status, "Task update rejected");
                return Err(WorkflowError::InvalidTransition {
                    task: task.task_id,
                    from: task.status,
                    to: event.status,
                });
            }

            let definition = self.load_definition(&instance).await?;
            let node = definition
                .task(&event.task_id)
                .ok_or_else(|| WorkflowError::TaskNotInDefinition {
                    definition: definition.id.clone(),
                    task: event.task_id.clone(),
                })?;

            let expected = task.status;
            let mut updated = task;
            updated.reason = event.reason;
            if !event.message.is_empty() {
                updated.error_message = Some(event.message.clone());
            }
            updated.execution_stats.extend(event.execution_stats.clone());

            if event.status != TaskExecutionStatus::Succeeded {
                updated.set_status(event.status);
                return self.finish_task(&mut instance, updated, expected).await;
            }

            updated.result_metadata = event.metadata.clone();
            if instance.is_failed() {
                updated.set_status(TaskExecutionStatus::Succeeded);
                tracing::info!("Instance already failed, destinations not resolved");
                return self.finish_task(&mut instance, updated, expected).await;
            }

            let outcome = self
                .mapper
                .verify_outputs(&instance.bucket_id, node, &updated, &event.output_paths())
                .await?;
            updated.output_artifacts = outcome.verified;
            if !outcome.missing_mandatory.is_empty() {
                tracing::warn!(missing = ?outcome.missing_mandatory, "Mandatory outputs missing");
                updated.reason = FailureReason::PluginError;
                updated.error_message = Some(format!(
                    "Mandatory output artifact(s) missing: {}",
                    outcome.missing_mandatory.join(", ")
                ));
                updated.set_status(TaskExecutionStatus::Failed);
                return self.finish_task(&mut instance, updated, expected).await;
            }
            updated.set_status(TaskExecutionStatus::Succeeded);

            if !node.export_destinations.is_empty() {
                let files = self
                    .dicom_files(&instance.bucket_id, updated.output_artifacts.values())
                    .await?;
                if !files.is_empty() {
                    self.dispatcher
                        .dispatch_export(
                            &instance,
                            &node.id,
                            node.export_destination_names(),
                            files,
                            &event.correlation_id,
                        )
                        .await?;
                    updated.export_pending = true;
                    return self.finish_task(&mut instance, updated, expected).await;
                }
                tracing::debug!("No DICOM outputs to export");
            }

            self.advance(&mut instance, &definition, updated, expected, &event.correlation_id)
                .await
        }
        .instrument(span)
        .await
    }

    // ── Export completion ────────────────────────────────────────────

    pub async fn process_export_complete(&self, event: &ExportCompleteEvent) -> WorkflowResult<()> {
        let span = tracing::info_span!(
            "export_complete",
            workflow_instance_id = %event.workflow_instance_id,
            task_id = %event.export_task_id,
            status = ?event.status,
            correlation_id = %event.correlation_id
        );
        async move {
            let mut instance = self.load_instance(&event.workflow_instance_id).await?;
            let task = instance
                .task(&event.export_task_id)
                .cloned()
                .ok_or_else(|| WorkflowError::TaskNotFound {
                    instance: instance.id.clone(),
                    task: event.export_task_id.clone(),
                })?;
            let definition = self.load_definition(&instance).await?;
            let is_export_task = definition
                .task(&task.task_id)
                .is_some_and(|n| n.kind() == TaskKind::Export);

            let awaiting = (task.export_pending && task.status == TaskExecutionStatus::Succeeded)
                || (is_export_task && task.status.is_in_flight());
            let requested = match (event.status, task.export_pending) {
                (ExportStatus::Success, true) => TaskExecutionStatus::Exported,
                (ExportStatus::Success, false) => TaskExecutionStatus::Succeeded,
                _ => TaskExecutionStatus::Failed,
            };
            if !awaiting {
                return Err(WorkflowError::InvalidTransition {
                    task: task.task_id,
                    from: task.status,
                    to: requested,
                });
            }

            let expected = task.status;
            let mut updated = task;
            updated.export_pending = false;

            if requested == TaskExecutionStatus::Failed {
                let failed: Vec<&str> = event
                    .file_statuses
                    .iter()
                    .filter(|(_, s)| **s != FileExportStatus::Success)
                    .map(|(f, _)| f.as_str())
                    .collect();
                updated.reason = FailureReason::ExternalServiceError;
                updated.error_message = Some(format!(
                    "Export finished with status {:?}; {} file(s) failed",
                    event.status,
                    failed.len()
                ));
                updated.set_status(TaskExecutionStatus::Failed);
                tracing::warn!(failed_files = ?failed, "Export failed");
                return self.finish_task(&mut instance, updated, expected).await;
            }

            updated.set_status(requested);
            self.advance(&mut instance, &definition, updated, expected, &event.correlation_id)
                .await
        }
        .instrument(span)
        .await
    }

    // ── Shared steps ─────────────────────────────────────────────────

    /// Resolve and start the destinations of a finished task, then persist it
    async fn advance(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        updated: TaskExecution,
        expected: TaskExecutionStatus,
        correlation_id: &str,
    ) -> WorkflowResult<()> {
        let task_id = updated.task_id.clone();
        // Local only: conditions must see this task's new status and results
        instance.merge_tasks(vec![updated.clone()]);

        let started = match self.append_destinations(instance, definition, &task_id).await {
            Ok(next) => self.run_tasks(instance, definition, next, correlation_id).await,
            Err(e) => Err(e),
        };

        match started {
            Ok(()) => self.finish_task(instance, updated, expected).await,
            Err(e) if e.category() == ErrorCategory::MandatoryArtifact => {
                tracing::warn!(error = %e, "Workflow failed on missing artifact");
                self.state.fail_instance(instance).await?;
                self.state.persist_task(instance, updated, expected).await?;
                self.dispatcher.evict(&instance.id);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Start `tasks` in order. Routers complete immediately and feed their
    /// own destinations back into the worklist.
    async fn run_tasks(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        tasks: Vec<TaskId>,
        correlation_id: &str,
    ) -> WorkflowResult<()> {
        let mut queue: VecDeque<TaskId> = tasks.into();
        let mut routed = Vec::new();

        while let Some(task_id) = queue.pop_front() {
            let node = definition.task(&task_id).ok_or_else(|| {
                WorkflowError::TaskNotInDefinition {
                    definition: definition.id.clone(),
                    task: task_id.clone(),
                }
            })?;

            match node.kind() {
                TaskKind::Plugin => {
                    self.dispatcher
                        .dispatch(instance, &task_id, correlation_id)
                        .await?;
                }
                TaskKind::Export => {
                    self.start_export_task(instance, definition, node, correlation_id)
                        .await?;
                }
                TaskKind::Router => {
                    if let Some(task) = instance.task_mut(&task_id) {
                        task.set_status(TaskExecutionStatus::Succeeded);
                    }
                    let next = self
                        .append_destinations(instance, definition, &task_id)
                        .await?;
                    tracing::debug!(task_id = %task_id, destinations = next.len(), "Router resolved");
                    queue.extend(next);
                    routed.push(task_id);
                }
            }
        }

        for task_id in routed {
            self.instances
                .update_task_status(
                    &instance.id,
                    &task_id,
                    TaskExecutionStatus::Created,
                    TaskExecutionStatus::Succeeded,
                )
                .await?;
            tracing::info!(workflow_instance_id = %instance.id, task_id = %task_id, "Router task completed");
        }
        Ok(())
    }

    /// Resolve the destinations of `completed` and store the new executions
    async fn append_destinations(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        completed: &TaskId,
    ) -> WorkflowResult<Vec<TaskId>> {
        let node = definition.task(completed).ok_or_else(|| {
            WorkflowError::TaskNotInDefinition {
                definition: definition.id.clone(),
                task: completed.clone(),
            }
        })?;
        let references = resolution_references(definition, node);

        let next = {
            let mut ctx = InstanceContext::new(instance, definition);
            ctx.prefetch(&references, self.metadata.as_ref()).await?;
            self.resolver.resolve(definition, completed, &ctx).await?
        };
        if next.is_empty() {
            return Ok(Vec::new());
        }

        self.instances
            .append_tasks(&instance.id, next.clone())
            .await?;
        let ids = next.iter().map(|t| t.task_id.clone()).collect();
        instance.merge_tasks(next);
        Ok(ids)
    }

    async fn start_export_task(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        node: &TaskNode,
        correlation_id: &str,
    ) -> WorkflowResult<()> {
        let destinations = node.export_destination_names();
        let unregistered: Vec<&String> = destinations
            .iter()
            .filter(|d| !definition.allows_export_to(d))
            .collect();
        if destinations.is_empty() || !unregistered.is_empty() {
            let message = format!(
                "Export destinations not registered with the gateway: {:?}",
                unregistered
            );
            return self.reject_task(instance, &node.id, message).await;
        }

        let inputs: Vec<String> = instance
            .task(&node.id)
            .map(|t| t.input_artifacts.values().cloned().collect())
            .unwrap_or_default();
        let files = self.dicom_files(&instance.bucket_id, inputs.iter()).await?;
        if files.is_empty() {
            return self
                .reject_task(instance, &node.id, "No DICOM files to export".to_string())
                .await;
        }

        self.dispatcher
            .dispatch_export(instance, &node.id, destinations, files, correlation_id)
            .await?;
        self.state
            .apply_task_update(instance, &node.id, TaskExecutionStatus::Dispatched)
            .await
    }

    /// Fail a task that could not be handed to any backend
    async fn reject_task(
        &self,
        instance: &mut WorkflowInstance,
        task_id: &TaskId,
        message: String,
    ) -> WorkflowResult<()> {
        let mut task = instance
            .task(task_id)
            .cloned()
            .ok_or_else(|| WorkflowError::TaskNotFound {
                instance: instance.id.clone(),
                task: task_id.clone(),
            })?;
        let expected = task.status;
        tracing::warn!(workflow_instance_id = %instance.id, task_id = %task_id, reason = %message, "Task rejected");
        task.reason = FailureReason::Rejected;
        task.error_message = Some(message);
        task.set_status(TaskExecutionStatus::Failed);
        self.state.persist_task(instance, task, expected).await
    }

    /// Recompute the aggregate with the finished task, then persist the task
    async fn finish_task(
        &self,
        instance: &mut WorkflowInstance,
        updated: TaskExecution,
        expected: TaskExecutionStatus,
    ) -> WorkflowResult<()> {
        let status = self.state.refresh_aggregate(instance, Some(&updated)).await?;
        let (task_id, new_status) = (updated.task_id.clone(), updated.status);
        self.state.persist_task(instance, updated, expected).await?;
        tracing::info!(
            workflow_instance_id = %instance.id,
            task_id = %task_id,
            status = %new_status,
            instance_status = %status,
            "Task update applied"
        );
        if status.is_terminal() {
            self.dispatcher.evict(&instance.id);
        }
        Ok(())
    }

    async fn refresh(&self, instance: &mut WorkflowInstance) -> WorkflowResult<()> {
        let status = self.state.refresh_aggregate(instance, None).await?;
        if status.is_terminal() {
            self.dispatcher.evict(&instance.id);
        }
        Ok(())
    }

    /// DICOM files stored under any of `paths`, sorted and unique
    async fn dicom_files<'p>(
        &self,
        bucket: &str,
        paths: impl Iterator<Item = &'p String>,
    ) -> WorkflowResult<Vec<String>> {
        let mut files = BTreeSet::new();
        for path in paths {
            let objects = self
                .storage
                .list_objects(bucket, path)
                .await
                .map_err(|e| WorkflowError::StorageService(e.to_string()))?;
            files.extend(
                objects
                    .into_iter()
                    .filter(|o| o.to_ascii_lowercase().ends_with(".dcm")),
            );
        }
        Ok(files.into_iter().collect())
    }

    async fn load_instance(&self, id: &WorkflowInstanceId) -> WorkflowResult<WorkflowInstance> {
        self.instances
            .get_instance(id)
            .await?
            .ok_or_else(|| WorkflowError::InstanceNotFound(id.clone()))
    }

    async fn load_definition(
        &self,
        instance: &WorkflowInstance,
    ) -> WorkflowResult<WorkflowDefinition> {
        self.definitions
            .get_revision(&instance.definition_id, instance.definition_revision)
            .await?
            .ok_or_else(|| WorkflowError::DefinitionNotFound(instance.definition_id.clone()))
    }
}

//! In-memory store implementation

use super::traits::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use workflow_types::{
    InstanceStatus, PayloadId, TaskExecution, TaskExecutionStatus, TaskId, WorkflowDefinition,
    WorkflowDefinitionId, WorkflowInstance, WorkflowInstanceId,
};

/// In-memory store for development and testing
///
/// Every mutation happens under the write lock, which gives the
/// single-document atomicity the engine relies on.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    /// All revisions per definition id, oldest first
    definitions: Arc<RwLock<HashMap<WorkflowDefinitionId, Vec<WorkflowDefinition>>>>,
    instances: Arc<RwLock<HashMap<WorkflowInstanceId, WorkflowInstance>>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            definitions: Arc::new(RwLock::new(HashMap::new())),
            instances: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of stored instances
    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }
}

fn active(revisions: &[WorkflowDefinition]) -> Option<&WorkflowDefinition> {
    revisions.last().filter(|d| !d.is_retired())
}

fn task_mut<'a>(
    instances: &'a mut HashMap<WorkflowInstanceId, WorkflowInstance>,
    instance_id: &WorkflowInstanceId,
    task_id: &TaskId,
) -> StoreResult<&'a mut TaskExecution> {
    let instance = instances
        .get_mut(instance_id)
        .ok_or_else(|| StoreError::NotFound(format!("instance {}", instance_id)))?;
    instance
        .task_mut(task_id)
        .ok_or_else(|| StoreError::NotFound(format!("task {} in {}", task_id, instance_id)))
}

#[async_trait]
impl DefinitionStore for InMemoryStore {
    async fn get_definition(
        &self,
        id: &WorkflowDefinitionId,
    ) -> StoreResult<Option<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        Ok(definitions.get(id).and_then(|revs| revs.last()).cloned())
    }

    async fn get_revision(
        &self,
        id: &WorkflowDefinitionId,
        revision: u32,
    ) -> StoreResult<Option<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        Ok(definitions
            .get(id)
            .and_then(|revs| revs.iter().find(|d| d.revision == revision))
            .cloned())
    }

    async fn get_by_ids(
        &self,
        ids: &[WorkflowDefinitionId],
    ) -> StoreResult<Vec<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| definitions.get(id).and_then(|revs| active(revs)))
            .cloned()
            .collect())
    }

    async fn get_by_trigger_origin(
        &self,
        origins: &[String],
    ) -> StoreResult<Vec<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        let mut matched: Vec<WorkflowDefinition> = definitions
            .values()
            .filter_map(|revs| active(revs))
            .filter(|d| d.matches_origin(origins))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(matched)
    }

    async fn save_revision(&self, mut definition: WorkflowDefinition) -> StoreResult<u32> {
        let mut definitions = self.definitions.write().await;
        let revisions = definitions.entry(definition.id.clone()).or_default();

        let revision = revisions.last().map(|d| d.revision + 1).unwrap_or(1);
        if let Some(previous) = revisions.last_mut() {
            previous.retire();
        }

        definition.revision = revision;
        definition.retired_at = None;
        revisions.push(definition);
        Ok(revision)
    }

    async fn list_definitions(&self) -> StoreResult<Vec<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        Ok(definitions
            .values()
            .filter_map(|revs| active(revs))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl InstanceStore for InMemoryStore {
    async fn get_instance(
        &self,
        id: &WorkflowInstanceId,
    ) -> StoreResult<Option<WorkflowInstance>> {
        let instances = self.instances.read().await;
        Ok(instances.get(id).cloned())
    }

    async fn get_by_definition_and_payload(
        &self,
        definition_id: &WorkflowDefinitionId,
        payload_id: &PayloadId,
    ) -> StoreResult<Option<WorkflowInstance>> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .find(|i| &i.definition_id == definition_id && &i.payload_id == payload_id)
            .cloned())
    }

    async fn create_instance(&self, instance: WorkflowInstance) -> StoreResult<bool> {
        let mut instances = self.instances.write().await;
        let duplicate = instances.values().any(|i| {
            i.definition_id == instance.definition_id && i.payload_id == instance.payload_id
        });
        if duplicate {
            return Ok(false);
        }
        if instances.contains_key(&instance.id) {
            return Err(StoreError::Conflict(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        instances.insert(instance.id.clone(), instance);
        Ok(true)
    }

    async fn update_task_status(
        &self,
        instance_id: &WorkflowInstanceId,
        task_id: &TaskId,
        expected: TaskExecutionStatus,
        status: TaskExecutionStatus,
    ) -> StoreResult<()> {
        let mut instances = self.instances.write().await;
        let task = task_mut(&mut instances, instance_id, task_id)?;
        if task.status != expected {
            return Err(StoreError::Conflict(format!(
                "task {} is {}, expected {}",
                task_id, task.status, expected
            )));
        }
        task.set_status(status);
        Ok(())
    }

    async fn update_task(
        &self,
        instance_id: &WorkflowInstanceId,
        task: TaskExecution,
        expected: TaskExecutionStatus,
    ) -> StoreResult<()> {
        let mut instances = self.instances.write().await;
        let stored = task_mut(&mut instances, instance_id, &task.task_id)?;
        if stored.status != expected {
            return Err(StoreError::Conflict(format!(
                "task {} is {}, expected {}",
                task.task_id, stored.status, expected
            )));
        }
        *stored = task;
        Ok(())
    }

    async fn update_aggregate_status(
        &self,
        instance_id: &WorkflowInstanceId,
        status: InstanceStatus,
    ) -> StoreResult<()> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| StoreError::NotFound(format!("instance {}", instance_id)))?;
        instance.status = status;
        Ok(())
    }

    async fn append_tasks(
        &self,
        instance_id: &WorkflowInstanceId,
        tasks: Vec<TaskExecution>,
    ) -> StoreResult<()> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| StoreError::NotFound(format!("instance {}", instance_id)))?;

        if let Some(existing) = tasks.iter().find_map(|t| {
            instance
                .task(&t.task_id)
                .filter(|e| e.status != TaskExecutionStatus::Created)
        }) {
            return Err(StoreError::Conflict(format!(
                "task {} already {}",
                existing.task_id, existing.status
            )));
        }

        instance.merge_tasks(tasks);
        Ok(())
    }

    async fn list_instances(&self) -> StoreResult<Vec<WorkflowInstance>> {
        let instances = self.instances.read().await;
        Ok(instances.values().cloned().collect())
    }
}

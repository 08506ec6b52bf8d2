//! Definition registry: validates and stores workflow definitions
//!
//! Definitions are immutable once registered. Registering a definition with
//! an existing id stores a new revision and retires the previous one;
//! running instances keep executing the revision they were created from.

use crate::graph_validator::{GraphValidator, ValidationReport};
use crate::store::DefinitionStore;
use std::sync::Arc;
use workflow_types::{WorkflowDefinition, WorkflowDefinitionId, WorkflowError, WorkflowResult};

/// Registry of workflow definitions
#[derive(Clone)]
pub struct DefinitionRegistry {
    store: Arc<dyn DefinitionStore>,
    validator: GraphValidator,
}

impl DefinitionRegistry {
    /// Create a registry over a definition store
    pub fn new(store: Arc<dyn DefinitionStore>, validator: GraphValidator) -> Self {
        Self { store, validator }
    }

    /// Validate without registering
    pub fn validate(&self, definition: &WorkflowDefinition) -> ValidationReport {
        self.validator.validate(definition)
    }

    /// Register a workflow definition
    ///
    /// Validates the definition before storing. Returns the definition ID and
    /// the revision assigned to it.
    pub async fn register(
        &self,
        definition: WorkflowDefinition,
    ) -> WorkflowResult<(WorkflowDefinitionId, u32)> {
        let report = self.validator.validate(&definition);
        if !report.is_valid() {
            tracing::warn!(
                definition_id = %definition.id,
                name = %definition.name,
                errors = report.errors.len(),
                "Workflow definition rejected"
            );
            return Err(WorkflowError::InvalidDefinition(report.errors));
        }

        let id = definition.id.clone();
        let revision = self.store.save_revision(definition).await?;

        tracing::info!(definition_id = %id, revision, "Workflow definition registered");
        Ok((id, revision))
    }

    /// Latest revision of a definition
    pub async fn get(&self, id: &WorkflowDefinitionId) -> WorkflowResult<WorkflowDefinition> {
        self.store
            .get_definition(id)
            .await?
            .ok_or_else(|| WorkflowError::DefinitionNotFound(id.clone()))
    }

    /// A specific revision
    pub async fn get_revision(
        &self,
        id: &WorkflowDefinitionId,
        revision: u32,
    ) -> WorkflowResult<WorkflowDefinition> {
        self.store
            .get_revision(id, revision)
            .await?
            .ok_or_else(|| WorkflowError::DefinitionNotFound(id.clone()))
    }

    /// Latest active revision of every definition
    pub async fn list(&self) -> WorkflowResult<Vec<WorkflowDefinition>> {
        Ok(self.store.list_definitions().await?)
    }
}

//! Workflow definitions: the task graph of a workflow revision
//!
//! A WorkflowDefinition is an ordered list of task nodes. The first task is
//! the entry point; every other task is reached through a
//! [`TaskDestination`] of some other task.
//!
//! Definitions are immutable once registered. An update is registered as a
//! new revision and the previous revision is soft-retired.

use crate::{
    Artifact, ArtifactMap, ExportDestination, TaskDestination, TaskId, WorkflowDefinitionId,
    WorkflowError, WorkflowResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Task type handled inside the engine: resolves destinations, never dispatched
pub const ROUTER_TASK_TYPE: &str = "router";

/// Task type handled inside the engine: sends its inputs to export destinations
pub const EXPORT_TASK_TYPE: &str = "export";

// ── Workflow Definition ──────────────────────────────────────────────

/// One revision of a workflow's task graph
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Identifier shared by all revisions
    pub id: WorkflowDefinitionId,
    /// Revision number, assigned on registration
    #[serde(default = "default_revision")]
    pub revision: u32,
    /// Human-readable name
    pub name: String,
    /// Author-supplied version label
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// The gateway this workflow listens on and may export to
    #[serde(default)]
    pub gateway: TriggerGateway,
    /// Task nodes in declaration order; the first one is the entry point
    #[serde(default)]
    pub tasks: Vec<TaskNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_retention_days: Option<u32>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Set when a newer revision replaced this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,
}

fn default_revision() -> u32 {
    1
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: WorkflowDefinitionId::generate(),
            revision: 1,
            name: name.into(),
            version: version.into(),
            description: String::new(),
            gateway: TriggerGateway::default(),
            tasks: Vec::new(),
            data_retention_days: None,
            created_at: Utc::now(),
            retired_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = WorkflowDefinitionId::new(id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Trigger origin (AE title) this workflow listens on
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.gateway.origin = Some(origin.into());
        self
    }

    /// Allow exports to the named destination
    pub fn with_export_destination(mut self, name: impl Into<String>) -> Self {
        self.gateway.export_destinations.push(name.into());
        self
    }

    pub fn with_task(mut self, task: TaskNode) -> Self {
        self.tasks.push(task);
        self
    }

    /// Add a task, rejecting duplicate ids
    pub fn add_task(&mut self, task: TaskNode) -> WorkflowResult<()> {
        if self.tasks.iter().any(|t| t.id == task.id) {
            return Err(WorkflowError::DuplicateTaskId(task.id));
        }
        self.tasks.push(task);
        Ok(())
    }

    /// The entry task
    pub fn first_task(&self) -> Option<&TaskNode> {
        self.tasks.first()
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskNode> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn task_index(&self, id: &TaskId) -> Option<usize> {
        self.tasks.iter().position(|t| &t.id == id)
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task(id).is_some()
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.is_some()
    }

    pub fn retire(&mut self) {
        if self.retired_at.is_none() {
            self.retired_at = Some(Utc::now());
        }
    }

    /// Whether the workflow listens on any of the given origins
    pub fn matches_origin(&self, origins: &[String]) -> bool {
        match &self.gateway.origin {
            Some(origin) => origins.iter().any(|o| o == origin),
            None => false,
        }
    }

    /// Whether an export destination is allowed by the gateway
    pub fn allows_export_to(&self, destination: &str) -> bool {
        self.gateway
            .export_destinations
            .iter()
            .any(|d| d == destination)
    }
}

/// The gateway a workflow is attached to
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerGateway {
    /// Origin title (AE title) that triggers this workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Export destinations tasks may send results to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub export_destinations: Vec<String>,
}

// ── Task Node ────────────────────────────────────────────────────────

/// How the engine treats a task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    /// Resolved in-engine, never dispatched
    Router,
    /// Dispatched as an export request
    Export,
    /// Dispatched to an execution backend
    Plugin,
}

/// A node of the workflow graph
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: TaskId,
    #[serde(default)]
    pub description: String,
    /// Plugin type used to select the execution backend
    #[serde(rename = "type")]
    pub task_type: String,
    /// Plugin arguments; values may contain `{{ ... }}` placeholders
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "ArtifactMap::is_empty")]
    pub artifacts: ArtifactMap,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_destinations: Vec<TaskDestination>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub export_destinations: Vec<ExportDestination>,
    /// Execution timeout handed to the backend; `None` uses the engine default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<f64>,
}

impl TaskNode {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(id),
            description: String::new(),
            task_type: task_type.into(),
            args: BTreeMap::new(),
            artifacts: ArtifactMap::default(),
            task_destinations: Vec::new(),
            export_destinations: Vec::new(),
            timeout_minutes: None,
        }
    }

    pub fn router(id: impl Into<String>) -> Self {
        Self::new(id, ROUTER_TASK_TYPE)
    }

    pub fn export(id: impl Into<String>) -> Self {
        Self::new(id, EXPORT_TASK_TYPE)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn with_input(mut self, artifact: Artifact) -> Self {
        self.artifacts.input.push(artifact);
        self
    }

    pub fn with_output(mut self, artifact: Artifact) -> Self {
        self.artifacts.output.push(artifact);
        self
    }

    pub fn with_destination(mut self, destination: TaskDestination) -> Self {
        self.task_destinations.push(destination);
        self
    }

    /// Shorthand for an unconditional destination
    pub fn then(self, target: impl Into<String>) -> Self {
        self.with_destination(TaskDestination::new(target))
    }

    pub fn with_export_destination(mut self, name: impl Into<String>) -> Self {
        self.export_destinations.push(ExportDestination::new(name));
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: f64) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    pub fn kind(&self) -> TaskKind {
        if self.task_type.eq_ignore_ascii_case(ROUTER_TASK_TYPE) {
            TaskKind::Router
        } else if self.task_type.eq_ignore_ascii_case(EXPORT_TASK_TYPE) {
            TaskKind::Export
        } else {
            TaskKind::Plugin
        }
    }

    /// Declared output artifact by name
    pub fn output_artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.output.iter().find(|a| a.name == name)
    }

    pub fn export_destination_names(&self) -> Vec<String> {
        self.export_destinations
            .iter()
            .map(|d| d.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("Liver Segmentation", "1.0.0")
            .with_id("wf-1")
            .with_origin("MONAI")
            .with_export_destination("PACS")
            .with_task(TaskNode::new("seg", "argo").then("review"))
            .with_task(TaskNode::new("review", "aide_clinical_review"))
    }

    #[test]
    fn test_first_task_and_lookup() {
        let def = make_definition();
        assert_eq!(def.first_task().unwrap().id, TaskId::new("seg"));
        assert!(def.contains_task(&TaskId::new("review")));
        assert_eq!(def.task_index(&TaskId::new("review")), Some(1));
        assert!(def.task(&TaskId::new("missing")).is_none());
    }

    #[test]
    fn test_add_task_rejects_duplicates() {
        let mut def = make_definition();
        let err = def.add_task(TaskNode::new("seg", "argo")).unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateTaskId(_)));
        def.add_task(TaskNode::router("route")).unwrap();
        assert_eq!(def.tasks.len(), 3);
    }

    #[test]
    fn test_origin_and_export_matching() {
        let def = make_definition();
        assert!(def.matches_origin(&["OTHER".into(), "MONAI".into()]));
        assert!(!def.matches_origin(&["OTHER".into()]));
        assert!(def.allows_export_to("PACS"));
        assert!(!def.allows_export_to("ORTHANC"));
    }

    #[test]
    fn test_task_kind() {
        assert_eq!(TaskNode::router("r").kind(), TaskKind::Router);
        assert_eq!(TaskNode::new("e", "Export").kind(), TaskKind::Export);
        assert_eq!(TaskNode::new("p", "argo").kind(), TaskKind::Plugin);
    }

    #[test]
    fn test_retire_is_idempotent() {
        let mut def = make_definition();
        assert!(!def.is_retired());
        def.retire();
        let first = def.retired_at;
        def.retire();
        assert_eq!(def.retired_at, first);
    }

    #[test]
    fn test_deserialize_definition_json() {
        let json = r#"{
            "id": "wf-2",
            "name": "ct",
            "version": "1",
            "gateway": {"origin": "MONAI", "export_destinations": ["PACS"]},
            "tasks": [
                {"id": "a", "type": "argo",
                 "args": {"model": "{{ context.workflow.name }}"},
                 "artifacts": {"input": [{"name": "dicom", "value": "{{ context.input.dicom }}"}]},
                 "task_destinations": [{"name": "b", "conditions": ["'x' == 'x'"]}]},
                {"id": "b", "type": "router"}
            ]
        }"#;
        let def: WorkflowDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.revision, 1);
        assert_eq!(def.tasks.len(), 2);
        assert_eq!(def.tasks[0].artifacts.input[0].name, "dicom");
        assert!(def.tasks[0].task_destinations[0].has_conditions());
        assert_eq!(def.tasks[1].kind(), TaskKind::Router);
    }
}

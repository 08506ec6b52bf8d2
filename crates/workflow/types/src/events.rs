//! Wire events exchanged with the message transport
//!
//! All events are JSON with camelCase field names. Inbound events are
//! consumed from topics; outbound events are wrapped in a [`JsonMessage`]
//! envelope before publishing.

use crate::{
    ExecutionId, FailureReason, Metadata, PayloadId, TaskExecutionStatus, TaskId,
    WorkflowDefinitionId, WorkflowInstanceId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Application id stamped on every outbound message
pub const APPLICATION_ID: &str = "workflow-manager";

// ── Storage Coordinates ──────────────────────────────────────────────

/// Location of one artifact in object storage
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    pub name: String,
    #[serde(default)]
    pub endpoint: String,
    pub bucket: String,
    pub relative_root_path: String,
    #[serde(default)]
    pub secured_connection: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

/// Scoped access credentials for a storage location
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_key: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

// ── Inbound ──────────────────────────────────────────────────────────

/// A new payload has been stored and is ready for processing
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadReadyEvent {
    pub payload_id: PayloadId,
    pub bucket: String,
    pub correlation_id: String,
    #[serde(default)]
    pub calling_origin: String,
    #[serde(default)]
    pub called_origin: String,
    /// Explicit workflows to run; empty means match by origin
    #[serde(default)]
    pub workflow_ids: Vec<WorkflowDefinitionId>,
}

/// Status report for one task execution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdateEvent {
    pub workflow_instance_id: WorkflowInstanceId,
    pub task_id: TaskId,
    pub execution_id: ExecutionId,
    pub correlation_id: String,
    pub status: TaskExecutionStatus,
    #[serde(default)]
    pub reason: FailureReason,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub outputs: Vec<StorageInfo>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub execution_stats: BTreeMap<String, String>,
}

impl TaskUpdateEvent {
    /// Output artifacts as name → path
    pub fn output_paths(&self) -> BTreeMap<String, String> {
        self.outputs
            .iter()
            .map(|o| (o.name.clone(), o.relative_root_path.clone()))
            .collect()
    }
}

/// Overall outcome of an export request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportStatus {
    Success,
    Failure,
    PartialFailure,
    Unknown,
}

/// Outcome of exporting one file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileExportStatus {
    Success,
    ConfigurationError,
    ServiceError,
    DownloadError,
    UnsupportedDataType,
    Unknown,
}

/// The export agent finished (or gave up on) an export request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportCompleteEvent {
    pub workflow_instance_id: WorkflowInstanceId,
    pub export_task_id: TaskId,
    pub status: ExportStatus,
    #[serde(default)]
    pub file_statuses: BTreeMap<String, FileExportStatus>,
    #[serde(default)]
    pub correlation_id: String,
}

// ── Outbound ─────────────────────────────────────────────────────────

/// Request to run one task execution on a backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDispatchEvent {
    pub workflow_instance_id: WorkflowInstanceId,
    pub task_id: TaskId,
    pub execution_id: ExecutionId,
    pub payload_id: PayloadId,
    pub correlation_id: String,
    pub task_plugin_type: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
    #[serde(default)]
    pub inputs: Vec<StorageInfo>,
    #[serde(default)]
    pub outputs: Vec<StorageInfo>,
    pub intermediate_storage: StorageInfo,
    pub timeout_minutes: f64,
}

/// Request to send files to export destinations
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequestEvent {
    pub workflow_instance_id: WorkflowInstanceId,
    pub export_task_id: TaskId,
    pub correlation_id: String,
    pub destinations: Vec<String>,
    pub files: Vec<String>,
}

// ── Envelope ─────────────────────────────────────────────────────────

/// Transport envelope around a JSON body
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonMessage {
    pub message_id: String,
    pub application_id: String,
    pub correlation_id: String,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub body: serde_json::Value,
}

impl JsonMessage {
    pub fn new<T: Serialize>(
        body: &T,
        correlation_id: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            application_id: APPLICATION_ID.to_string(),
            correlation_id: correlation_id.into(),
            content_type: "application/json".to_string(),
            created_at: Utc::now(),
            body: serde_json::to_value(body)?,
        })
    }

    /// Decode the body into a concrete event
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.body.clone())
    }
}

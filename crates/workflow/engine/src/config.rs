//! Engine configuration
//!
//! Every field has a serde default so partial files and environment
//! overrides deserialize cleanly.

use crate::graph_validator::CycleCheck;
use serde::{Deserialize, Serialize};

/// Configuration consumed by the execution engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Topics and routing keys
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// Object storage coordinates handed to execution backends
    #[serde(default)]
    pub storage: StorageConfig,

    /// Execution behaviour
    #[serde(default)]
    pub engine: ExecutionConfig,
}

/// Messaging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    #[serde(default)]
    pub topics: TopicsConfig,

    /// Name of the export agent; export requests are routed to
    /// `{export_request_prefix}.{scu_agent_name}`
    #[serde(default = "default_scu_agent_name")]
    pub scu_agent_name: String,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            topics: TopicsConfig::default(),
            scu_agent_name: default_scu_agent_name(),
        }
    }
}

impl MessagingConfig {
    /// Routing key for export requests
    pub fn export_routing_key(&self) -> String {
        format!(
            "{}.{}",
            self.topics.export_request_prefix, self.scu_agent_name
        )
    }
}

/// Topic names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_workflow_request")]
    pub workflow_request: String,

    #[serde(default = "default_task_update")]
    pub task_update: String,

    #[serde(default = "default_export_complete")]
    pub export_complete: String,

    #[serde(default = "default_task_dispatch")]
    pub task_dispatch: String,

    #[serde(default = "default_export_request_prefix")]
    pub export_request_prefix: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            workflow_request: default_workflow_request(),
            task_update: default_task_update(),
            export_complete: default_export_complete(),
            task_dispatch: default_task_dispatch(),
            export_request_prefix: default_export_request_prefix(),
        }
    }
}

/// Backing store for definitions, instances and objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: StorageKind,

    /// Endpoint reported to execution backends
    #[serde(default = "default_storage_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub secured_connection: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Memory,
            endpoint: default_storage_endpoint(),
            secured_connection: false,
        }
    }
}

/// Execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Timeout handed to backends when a task declares none
    #[serde(default = "default_task_timeout")]
    pub task_timeout_minutes: f64,

    /// Cycle detection strategy used at registration
    #[serde(default)]
    pub cycle_check: CycleCheck,

    /// Longest path the validator walks before reporting a loop
    #[serde(default = "default_max_loop_depth")]
    pub max_loop_depth: usize,

    /// Units of work processed concurrently by the listener
    #[serde(default = "default_max_concurrent_units")]
    pub max_concurrent_units: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            task_timeout_minutes: default_task_timeout(),
            cycle_check: CycleCheck::default(),
            max_loop_depth: default_max_loop_depth(),
            max_concurrent_units: default_max_concurrent_units(),
        }
    }
}

// Default value helpers
fn default_scu_agent_name() -> String {
    "monaiscu".to_string()
}

fn default_workflow_request() -> String {
    "md.workflow.request".to_string()
}

fn default_task_update() -> String {
    "md.tasks.update".to_string()
}

fn default_export_complete() -> String {
    "md.export.complete".to_string()
}

fn default_task_dispatch() -> String {
    "md.tasks.dispatch".to_string()
}

fn default_export_request_prefix() -> String {
    "md.export.request".to_string()
}

fn default_storage_endpoint() -> String {
    "localhost:9000".to_string()
}

fn default_task_timeout() -> f64 {
    60.0
}

fn default_max_loop_depth() -> usize {
    100
}

fn default_max_concurrent_units() -> usize {
    16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.messaging.topics.task_update, "md.tasks.update");
        assert_eq!(config.engine.task_timeout_minutes, 60.0);
        assert_eq!(config.engine.cycle_check, CycleCheck::AllBranches);
        assert_eq!(config.storage.kind, StorageKind::Memory);
    }

    #[test]
    fn test_export_routing_key() {
        let config = MessagingConfig::default();
        assert_eq!(config.export_routing_key(), "md.export.request.monaiscu");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"engine": {"cycle_check": "first_branch"}, "messaging": {"scu_agent_name": "scu2"}}"#,
        )
        .unwrap();
        assert_eq!(config.engine.cycle_check, CycleCheck::FirstBranch);
        assert_eq!(config.engine.max_loop_depth, 100);
        assert_eq!(config.messaging.scu_agent_name, "scu2");
        assert_eq!(config.messaging.topics.export_complete, "md.export.complete");
    }
}

//! Execution backend seam
//!
//! A [`TaskRunner`] executes dispatch requests of one plugin type. The
//! [`TaskDispatchHandler`] looks up the runner for a request and turns its
//! answer into the [`TaskUpdateEvent`] the engine consumes.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use workflow_types::{
    FailureReason, StorageInfo, TaskDispatchEvent, TaskExecutionStatus, TaskUpdateEvent,
};

/// Runner errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunnerError {
    #[error("No runner registered for task type '{0}'")]
    UnknownTaskType(String),

    #[error("Runner failed: {0}")]
    Failed(String),
}

pub type RunnerResult<T> = Result<T, RunnerError>;

/// Status reported by a runner
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionStatus {
    pub status: TaskExecutionStatus,
    pub reason: FailureReason,
    pub message: String,
    pub stats: BTreeMap<String, String>,
}

impl ExecutionStatus {
    pub fn accepted() -> Self {
        Self::with_status(TaskExecutionStatus::Accepted)
    }

    pub fn succeeded() -> Self {
        Self::with_status(TaskExecutionStatus::Succeeded)
    }

    pub fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            status: TaskExecutionStatus::Failed,
            reason,
            message: message.into(),
            stats: BTreeMap::new(),
        }
    }

    fn with_status(status: TaskExecutionStatus) -> Self {
        Self {
            status,
            reason: FailureReason::None,
            message: String::new(),
            stats: BTreeMap::new(),
        }
    }
}

/// Executes dispatch requests of one plugin type
#[async_trait]
pub trait TaskRunner: Send + Sync {
    fn task_type(&self) -> &str;

    /// Start (or run) the requested execution
    async fn execute(&self, request: &TaskDispatchEvent) -> RunnerResult<ExecutionStatus>;

    /// Current status of a previously started execution
    async fn get_status(&self, request: &TaskDispatchEvent) -> RunnerResult<ExecutionStatus>;
}

/// Runners keyed by task type, case-insensitive
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn TaskRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.register(runner);
        self
    }

    /// Register a runner, returning the one it replaced
    pub fn register(&mut self, runner: Arc<dyn TaskRunner>) -> Option<Arc<dyn TaskRunner>> {
        self.runners
            .insert(runner.task_type().to_ascii_lowercase(), runner)
    }

    pub fn get(&self, task_type: &str) -> RunnerResult<Arc<dyn TaskRunner>> {
        self.runners
            .get(&task_type.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| RunnerError::UnknownTaskType(task_type.to_string()))
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.runners.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Runs dispatch requests and reports the outcome as a task update
#[derive(Clone)]
pub struct TaskDispatchHandler {
    registry: RunnerRegistry,
}

impl TaskDispatchHandler {
    pub fn new(registry: RunnerRegistry) -> Self {
        Self { registry }
    }

    pub async fn handle(&self, request: &TaskDispatchEvent) -> TaskUpdateEvent {
        let outcome = match self.registry.get(&request.task_plugin_type) {
            Ok(runner) => Self::run(runner.as_ref(), request).await,
            Err(e) => ExecutionStatus::failed(FailureReason::Rejected, e.to_string()),
        };

        tracing::info!(
            workflow_instance_id = %request.workflow_instance_id,
            task_id = %request.task_id,
            execution_id = %request.execution_id,
            status = %outcome.status,
            "Dispatch request handled"
        );

        let outputs = if outcome.status == TaskExecutionStatus::Succeeded {
            request
                .outputs
                .iter()
                .map(|o| StorageInfo {
                    credentials: None,
                    ..o.clone()
                })
                .collect()
        } else {
            Vec::new()
        };

        TaskUpdateEvent {
            workflow_instance_id: request.workflow_instance_id.clone(),
            task_id: request.task_id.clone(),
            execution_id: request.execution_id.clone(),
            correlation_id: request.correlation_id.clone(),
            status: outcome.status,
            reason: outcome.reason,
            message: outcome.message,
            outputs,
            metadata: Default::default(),
            execution_stats: outcome.stats,
        }
    }

    /// Start the execution; an accepted one is polled once so a runner that
    /// already finished reports its final status
    async fn run(runner: &dyn TaskRunner, request: &TaskDispatchEvent) -> ExecutionStatus {
        let started = match runner.execute(request).await {
            Ok(started) => started,
            Err(e) => return ExecutionStatus::failed(FailureReason::PluginError, e.to_string()),
        };
        if started.status != TaskExecutionStatus::Accepted {
            return started;
        }

        match runner.get_status(request).await {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(
                    task_id = %request.task_id,
                    execution_id = %request.execution_id,
                    error = %e,
                    "Runner status unavailable, reporting accepted"
                );
                started
            }
        }
    }
}

/// Completes every request at once; for local runs without a backend
#[derive(Clone, Debug)]
pub struct LoopbackRunner {
    task_type: String,
}

impl LoopbackRunner {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
        }
    }
}

#[async_trait]
impl TaskRunner for LoopbackRunner {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn execute(&self, request: &TaskDispatchEvent) -> RunnerResult<ExecutionStatus> {
        tracing::debug!(task_id = %request.task_id, "Loopback execution");
        let mut status = ExecutionStatus::succeeded();
        status
            .stats
            .insert("runner".to_string(), "loopback".to_string());
        Ok(status)
    }

    async fn get_status(&self, _request: &TaskDispatchEvent) -> RunnerResult<ExecutionStatus> {
        Ok(ExecutionStatus::succeeded())
    }
}

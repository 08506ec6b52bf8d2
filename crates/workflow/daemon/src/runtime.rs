//! Daemon wiring and lifecycle

use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::publisher::{LinePublisher, Loopback};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use workflow_engine::listener::{channel, EventReceiver, InboundMessage, ListenerSummary};
use workflow_engine::{
    DefinitionRegistry, EngineConfig, EngineServices, EventListener, EventSender, GraphValidator,
    InMemoryObjectStorage, InMemoryStore, LoopbackRunner, Publisher, RunnerRegistry,
    TaskDispatchHandler, WorkflowExecuterService,
};
use workflow_types::WorkflowDefinition;

/// Task types answered by the loopback runner
const LOOPBACK_TASK_TYPES: &[&str] = &["argo", "docker", "aide_clinical_review"];

/// The workflow executer daemon
pub struct Daemon {
    config: EngineConfig,
    registry: DefinitionRegistry,
    executer: Arc<WorkflowExecuterService>,
    sender: EventSender,
    receiver: EventReceiver,
}

impl Daemon {
    /// Wire in-memory collaborators and a JSON-lines publisher writing to stdout
    pub fn new(config: &DaemonConfig, loopback: bool) -> Self {
        Self::with_publisher(config, loopback, LinePublisher::stdout())
    }

    pub fn with_publisher(config: &DaemonConfig, loopback: bool, publisher: LinePublisher) -> Self {
        let mut engine_config = config.engine_config();
        if loopback && engine_config.engine.max_concurrent_units != 1 {
            // Loopback replies are queued before the dispatching unit records
            // the dispatch; one unit at a time keeps them behind it
            tracing::info!("Loopback mode: processing one unit of work at a time");
            engine_config.engine.max_concurrent_units = 1;
        }
        let capacity = engine_config.engine.max_concurrent_units.max(1) * 4;
        let (sender, receiver) = channel(capacity);
        let objects = InMemoryObjectStorage::assume_present();

        let publisher = if loopback {
            let runners = LOOPBACK_TASK_TYPES
                .iter()
                .fold(RunnerRegistry::new(), |registry, task_type| {
                    registry.with_runner(Arc::new(LoopbackRunner::new(*task_type)))
                });
            publisher.with_loopback(Loopback::new(
                TaskDispatchHandler::new(runners),
                sender.clone(),
                objects.clone(),
                &engine_config,
            ))
        } else {
            publisher
        };
        let publisher: Arc<dyn Publisher> = Arc::new(publisher);

        let services = EngineServices::in_memory(InMemoryStore::new(), objects, publisher);
        let registry = DefinitionRegistry::new(
            services.definitions.clone(),
            GraphValidator::from_config(&engine_config.engine),
        );
        let executer = Arc::new(WorkflowExecuterService::new(engine_config.clone(), services));

        Self {
            config: engine_config,
            registry,
            executer,
            sender,
            receiver,
        }
    }

    pub fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }

    /// Register every `*.json` definition in `dir`, in file name order
    pub async fn register_definitions(&self, dir: &Path) -> DaemonResult<usize> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in &paths {
            let shown = path.display().to_string();
            let contents = tokio::fs::read_to_string(path).await?;
            let definition: WorkflowDefinition =
                serde_json::from_str(&contents).map_err(|e| DaemonError::Definition {
                    path: shown.clone(),
                    message: e.to_string(),
                })?;
            let name = definition.name.clone();
            let (id, revision) = self.registry.register(definition).await.map_err(|e| {
                DaemonError::Definition {
                    path: shown.clone(),
                    message: e.to_string(),
                }
            })?;
            tracing::info!(path = %shown, definition_id = %id, revision, name = %name, "Definition loaded");
        }
        Ok(paths.len())
    }

    /// Feed events from `events` (a file, or stdin for `None` / `-`) through
    /// the listener until the input is drained and handled, or a shutdown
    /// signal arrives
    pub async fn run(self, events: Option<&str>) -> DaemonResult<ListenerSummary> {
        match events {
            None | Some("-") => {
                self.run_with(BufReader::new(tokio::io::stdin()), shutdown_signal())
                    .await
            }
            Some(path) => {
                let file = tokio::fs::File::open(path).await?;
                self.run_with(BufReader::new(file), shutdown_signal()).await
            }
        }
    }

    pub async fn run_with<R>(
        self,
        reader: R,
        signal: impl std::future::Future<Output = ()>,
    ) -> DaemonResult<ListenerSummary>
    where
        R: AsyncBufRead + Unpin,
    {
        let listener = Arc::new(EventListener::new(self.executer.clone(), &self.config));
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let listening = tokio::spawn(listener.run(self.receiver, async move {
            let _ = stop_rx.await;
        }));

        let fed = tokio::select! {
            fed = feed(reader, &self.sender) => fed,
            _ = signal => {
                tracing::info!("Shutdown requested before input was drained");
                Ok(0)
            }
        };
        let _ = stop_tx.send(());

        let summary = listening
            .await
            .map_err(|e| DaemonError::Runtime(e.to_string()))?;
        let fed = fed?;
        tracing::info!(
            events = fed,
            acked = summary.acked,
            rejected = summary.rejected,
            requeued = summary.requeued,
            "Workflow daemon stopped"
        );
        Ok(summary)
    }
}

/// Queue every line of `reader` as an inbound message and wait until all of
/// them, and every loopback reply they caused, are handled
async fn feed<R>(reader: R, sender: &EventSender) -> DaemonResult<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut count = 0;
    let mut line_number = 0;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let message: InboundMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(line = line_number, error = %e, "Skipping malformed event line");
                continue;
            }
        };
        sender
            .send(message)
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))?;
        count += 1;
    }
    sender.wait_idle().await;
    Ok(count)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_types::{PayloadId, PayloadReadyEvent};

    fn demo_definitions() -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/definitions")
    }

    fn payload_line(config: &EngineConfig, payload: &str) -> String {
        let event = PayloadReadyEvent {
            payload_id: PayloadId::new(payload),
            bucket: "bucket".into(),
            correlation_id: format!("corr-{payload}"),
            calling_origin: "SCANNER".into(),
            called_origin: "MONAI".into(),
            workflow_ids: Vec::new(),
        };
        let message =
            InboundMessage::from_event(&config.messaging.topics.workflow_request, &event).unwrap();
        serde_json::to_string(&message).unwrap()
    }

    fn quiet_daemon(loopback: bool) -> Daemon {
        Daemon::with_publisher(
            &DaemonConfig::default(),
            loopback,
            LinePublisher::new(Box::new(std::io::sink())),
        )
    }

    #[tokio::test]
    async fn test_registers_demo_definitions() {
        let daemon = quiet_daemon(false);
        let count = daemon
            .register_definitions(&demo_definitions())
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(daemon.registry().list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_definition_dir_fails() {
        let daemon = quiet_daemon(false);
        let err = daemon
            .register_definitions(Path::new("/nonexistent/definitions"))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Io(_)));
    }

    #[tokio::test]
    async fn test_loopback_runs_workflow_to_completion() {
        let daemon = quiet_daemon(true);
        daemon
            .register_definitions(&demo_definitions())
            .await
            .unwrap();
        let config = EngineConfig::default();
        let input = format!("{}\n\nnot json\n", payload_line(&config, "p1"));

        let summary = daemon
            .run_with(input.as_bytes(), std::future::pending::<()>())
            .await
            .unwrap();

        // payload, then one update per plugin task and one export completion
        assert_eq!(summary.rejected, 0);
        assert_eq!(summary.requeued, 0);
        assert_eq!(summary.acked, 4);
    }

    #[tokio::test]
    async fn test_without_loopback_only_payloads_are_handled() {
        let daemon = quiet_daemon(false);
        daemon
            .register_definitions(&demo_definitions())
            .await
            .unwrap();
        let config = EngineConfig::default();
        let input = format!(
            "{}\n{}\n",
            payload_line(&config, "p1"),
            payload_line(&config, "p2")
        );

        let summary = daemon
            .run_with(input.as_bytes(), std::future::pending::<()>())
            .await
            .unwrap();
        assert_eq!(summary.acked, 2);
    }
}

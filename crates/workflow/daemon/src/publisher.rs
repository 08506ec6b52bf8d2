//! Local transport
//!
//! Published messages are written as JSON lines. In loopback mode dispatch
//! and export requests are also answered in-process: dispatches run through
//! a [`TaskDispatchHandler`] and exports complete successfully, and each
//! answer is fed back into the listener's queue.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;
use workflow_engine::listener::InboundMessage;
use workflow_engine::transport::{TransportError, TransportResult};
use workflow_engine::{
    EngineConfig, EventSender, InMemoryObjectStorage, Publisher, TaskDispatchHandler,
    TopicsConfig,
};
use workflow_types::{
    ExportCompleteEvent, ExportRequestEvent, ExportStatus, FileExportStatus, JsonMessage,
    TaskDispatchEvent, TaskExecutionStatus,
};

/// One line of publisher output
#[derive(Serialize)]
struct OutboundLine<'a> {
    routing_key: &'a str,
    message: &'a JsonMessage,
}

/// Writes published messages as JSON lines
pub struct LinePublisher {
    out: Mutex<Box<dyn Write + Send>>,
    loopback: Option<Loopback>,
}

impl LinePublisher {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            loopback: None,
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn with_loopback(mut self, loopback: Loopback) -> Self {
        self.loopback = Some(loopback);
        self
    }

    fn write_line(&self, routing_key: &str, message: &JsonMessage) -> TransportResult<()> {
        let line = serde_json::to_string(&OutboundLine {
            routing_key,
            message,
        })
        .map_err(|e| TransportError::Encoding(e.to_string()))?;

        let mut out = self
            .out
            .lock()
            .map_err(|_| TransportError::Unavailable("output lock poisoned".into()))?;
        writeln!(out, "{}", line)
            .and_then(|_| out.flush())
            .map_err(|e| TransportError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl Publisher for LinePublisher {
    async fn publish(&self, routing_key: &str, message: JsonMessage) -> TransportResult<()> {
        self.write_line(routing_key, &message)?;
        if let Some(loopback) = &self.loopback {
            loopback.answer(routing_key, &message).await?;
        }
        Ok(())
    }
}

/// Answers dispatch and export requests without external services
pub struct Loopback {
    handler: TaskDispatchHandler,
    sender: EventSender,
    objects: InMemoryObjectStorage,
    topics: TopicsConfig,
    export_routing_key: String,
}

impl Loopback {
    pub fn new(
        handler: TaskDispatchHandler,
        sender: EventSender,
        objects: InMemoryObjectStorage,
        config: &EngineConfig,
    ) -> Self {
        Self {
            handler,
            sender,
            objects,
            topics: config.messaging.topics.clone(),
            export_routing_key: config.messaging.export_routing_key(),
        }
    }

    async fn answer(&self, routing_key: &str, message: &JsonMessage) -> TransportResult<()> {
        let reply = if routing_key == self.topics.task_dispatch {
            let request: TaskDispatchEvent = message
                .decode()
                .map_err(|e| TransportError::Encoding(e.to_string()))?;
            let update = self.handler.handle(&request).await;
            if update.status == TaskExecutionStatus::Succeeded {
                // Leave one DICOM file per output so exports have something to send
                for output in &update.outputs {
                    let path = format!("{}/{}.dcm", output.relative_root_path, request.execution_id);
                    self.objects.put_object(&output.bucket, &path).await;
                }
            }
            InboundMessage::from_event(&self.topics.task_update, &update)
        } else if routing_key == self.export_routing_key {
            let request: ExportRequestEvent = message
                .decode()
                .map_err(|e| TransportError::Encoding(e.to_string()))?;
            InboundMessage::from_event(&self.topics.export_complete, &export_success(request))
        } else {
            return Ok(());
        };

        let reply = reply.map_err(|e| TransportError::Encoding(e.to_string()))?;
        tracing::debug!(topic = %reply.topic, "Loopback reply queued");
        self.sender.send(reply).await
    }
}

fn export_success(request: ExportRequestEvent) -> ExportCompleteEvent {
    let file_statuses: BTreeMap<String, FileExportStatus> = request
        .files
        .into_iter()
        .map(|f| (f, FileExportStatus::Success))
        .collect();
    ExportCompleteEvent {
        workflow_instance_id: request.workflow_instance_id,
        export_task_id: request.export_task_id,
        status: ExportStatus::Success,
        file_statuses,
        correlation_id: request.correlation_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use workflow_engine::listener::channel;
    use workflow_engine::{LoopbackRunner, RunnerRegistry, StorageService};
    use workflow_types::{ExecutionId, PayloadId, StorageInfo, TaskId, WorkflowInstanceId};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn lines(&self) -> Vec<serde_json::Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    fn make_dispatch() -> TaskDispatchEvent {
        TaskDispatchEvent {
            workflow_instance_id: WorkflowInstanceId::new("wi-1"),
            task_id: TaskId::new("seg"),
            execution_id: ExecutionId::new("ex-1"),
            payload_id: PayloadId::new("p1"),
            correlation_id: "corr".into(),
            task_plugin_type: "argo".into(),
            arguments: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: vec![StorageInfo {
                name: "mask".into(),
                bucket: "bucket".into(),
                relative_root_path: "p1/wi-1/ex-1/mask".into(),
                ..StorageInfo::default()
            }],
            intermediate_storage: StorageInfo::default(),
            timeout_minutes: 60.0,
        }
    }

    #[tokio::test]
    async fn test_writes_json_lines() {
        let buffer = SharedBuffer::default();
        let publisher = LinePublisher::new(Box::new(buffer.clone()));
        let message = JsonMessage::new(&make_dispatch(), "corr").unwrap();

        publisher
            .publish("md.tasks.dispatch", message.clone())
            .await
            .unwrap();

        let lines = buffer.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["routing_key"], "md.tasks.dispatch");
        assert_eq!(lines[0]["message"]["correlationId"], "corr");
    }

    #[tokio::test]
    async fn test_loopback_answers_dispatch() {
        let config = EngineConfig::default();
        let objects = InMemoryObjectStorage::new();
        let (sender, mut receiver) = channel(4);
        let handler = TaskDispatchHandler::new(
            RunnerRegistry::new().with_runner(Arc::new(LoopbackRunner::new("argo"))),
        );
        let publisher = LinePublisher::new(Box::new(SharedBuffer::default())).with_loopback(
            Loopback::new(handler, sender.clone(), objects.clone(), &config),
        );

        let message = JsonMessage::new(&make_dispatch(), "corr").unwrap();
        publisher
            .publish(&config.messaging.topics.task_dispatch, message)
            .await
            .unwrap();

        assert_eq!(sender.pending(), 1);
        let reply = receiver.recv().await.unwrap();
        assert_eq!(reply.topic, config.messaging.topics.task_update);
        assert_eq!(reply.body["status"], "Succeeded");
        assert!(objects
            .list_objects("bucket", "p1/wi-1/ex-1/mask")
            .await
            .unwrap()
            .contains(&"p1/wi-1/ex-1/mask/ex-1.dcm".to_string()));
    }

    #[test]
    fn test_export_success_marks_every_file() {
        let complete = export_success(ExportRequestEvent {
            workflow_instance_id: WorkflowInstanceId::new("wi-1"),
            export_task_id: TaskId::new("send"),
            correlation_id: "corr".into(),
            destinations: vec!["PACS".into()],
            files: vec!["a.dcm".into(), "b.dcm".into()],
        });
        assert_eq!(complete.status, ExportStatus::Success);
        assert_eq!(complete.file_statuses.len(), 2);
        assert!(complete
            .file_statuses
            .values()
            .all(|s| *s == FileExportStatus::Success));
    }
}

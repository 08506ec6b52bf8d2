//! Event listener
//!
//! Decodes inbound messages by topic and hands them to the
//! [`WorkflowExecuterService`]. Units of work run concurrently up to a
//! configured limit; work on the same instance (or the same payload) is
//! serialized with a per-key lock.

use crate::config::{EngineConfig, TopicsConfig};
use crate::executer::WorkflowExecuterService;
use crate::transport::{Disposition, TransportError, TransportResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use workflow_types::{
    ExportCompleteEvent, JsonMessage, PayloadReadyEvent, TaskUpdateEvent, WorkflowError,
    WorkflowResult,
};

/// A message as received from a topic
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub topic: String,
    /// Either a bare event or a [`JsonMessage`] envelope around one
    pub body: serde_json::Value,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            body,
        }
    }

    pub fn from_event<T: Serialize>(topic: impl Into<String>, event: &T) -> serde_json::Result<Self> {
        Ok(Self::new(topic, serde_json::to_value(event)?))
    }
}

/// A decoded inbound event
#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    PayloadReady(PayloadReadyEvent),
    TaskUpdate(TaskUpdateEvent),
    ExportComplete(ExportCompleteEvent),
}

impl InboundEvent {
    pub fn decode(topics: &TopicsConfig, message: &InboundMessage) -> WorkflowResult<Self> {
        let body = match serde_json::from_value::<JsonMessage>(message.body.clone()) {
            Ok(envelope) => envelope.body,
            Err(_) => message.body.clone(),
        };
        let invalid = |e: serde_json::Error| {
            WorkflowError::InvalidEvent(format!("{} on topic {}", e, message.topic))
        };

        if message.topic == topics.workflow_request {
            serde_json::from_value(body).map(Self::PayloadReady).map_err(invalid)
        } else if message.topic == topics.task_update {
            serde_json::from_value(body).map(Self::TaskUpdate).map_err(invalid)
        } else if message.topic == topics.export_complete {
            serde_json::from_value(body).map(Self::ExportComplete).map_err(invalid)
        } else {
            Err(WorkflowError::InvalidEvent(format!(
                "unknown topic {}",
                message.topic
            )))
        }
    }

    /// Work sharing a key never runs concurrently
    pub fn serialization_key(&self) -> String {
        match self {
            Self::PayloadReady(e) => format!("payload:{}", e.payload_id),
            Self::TaskUpdate(e) => format!("instance:{}", e.workflow_instance_id),
            Self::ExportComplete(e) => format!("instance:{}", e.workflow_instance_id),
        }
    }
}

// ── Channel ──────────────────────────────────────────────────────────

/// Sending half of the listener's inbound queue
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<InboundMessage>,
    pending: Arc<AtomicUsize>,
}

impl EventSender {
    pub async fn send(&self, message: InboundMessage) -> TransportResult<()> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(message).await.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::Unavailable("listener stopped".into()));
        }
        Ok(())
    }

    /// Messages sent and not yet fully handled
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Resolve once every sent message has been handled
    pub async fn wait_idle(&self) {
        while self.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Receiving half of the listener's inbound queue
pub struct EventReceiver {
    rx: mpsc::Receiver<InboundMessage>,
    pending: Arc<AtomicUsize>,
}

impl EventReceiver {
    /// Next queued message; it stays pending until the listener handles it
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}

pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));
    (
        EventSender {
            tx,
            pending: pending.clone(),
        },
        EventReceiver { rx, pending },
    )
}

/// Dispositions counted over one listener run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenerSummary {
    pub acked: usize,
    pub rejected: usize,
    pub requeued: usize,
}

impl ListenerSummary {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Ack => self.acked += 1,
            Disposition::Reject => self.rejected += 1,
            Disposition::Requeue => self.requeued += 1,
        }
    }
}

// ── Listener ─────────────────────────────────────────────────────────

pub struct EventListener {
    executer: Arc<WorkflowExecuterService>,
    topics: TopicsConfig,
    permits: Arc<Semaphore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    in_progress: AtomicUsize,
}

impl EventListener {
    pub fn new(executer: Arc<WorkflowExecuterService>, config: &EngineConfig) -> Self {
        Self {
            executer,
            topics: config.messaging.topics.clone(),
            permits: Arc::new(Semaphore::new(config.engine.max_concurrent_units.max(1))),
            locks: DashMap::new(),
            in_progress: AtomicUsize::new(0),
        }
    }

    /// Process one message and report what the transport should do with it
    pub async fn handle(&self, message: InboundMessage) -> Disposition {
        let event = match InboundEvent::decode(&self.topics, &message) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "Message rejected");
                return Disposition::Reject;
            }
        };

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Disposition::Requeue,
        };

        let key = event.serialization_key();
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.process(event).await
        };
        drop(lock);
        self.locks.remove_if(&key, |_, l| Arc::strong_count(l) == 1);

        let disposition = Disposition::from_result(&result);
        match (&result, disposition) {
            (Ok(()), _) => {
                tracing::debug!(topic = %message.topic, key = %key, "Message processed");
            }
            (Err(e), Disposition::Requeue) => {
                tracing::warn!(topic = %message.topic, key = %key, error = %e, "Message will be redelivered");
            }
            (Err(e), _) => {
                tracing::warn!(topic = %message.topic, key = %key, error = %e, "Message rejected");
            }
        }
        disposition
    }

    async fn process(&self, event: InboundEvent) -> WorkflowResult<()> {
        match event {
            InboundEvent::PayloadReady(e) => self.executer.process_new_payload(&e).await.map(|_| ()),
            InboundEvent::TaskUpdate(e) => self.executer.process_task_update(&e).await,
            InboundEvent::ExportComplete(e) => self.executer.process_export_complete(&e).await,
        }
    }

    /// Units of work spawned by [`run`](Self::run) and not yet reaped
    pub fn units_in_progress(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Consume the queue until it closes or `shutdown` resolves, then wait
    /// for work in progress
    pub async fn run(
        self: Arc<Self>,
        mut receiver: EventReceiver,
        shutdown: impl Future<Output = ()>,
    ) -> ListenerSummary {
        tokio::pin!(shutdown);
        let mut units = JoinSet::new();
        let mut summary = ListenerSummary::default();

        loop {
            tokio::select! {
                Some(outcome) = units.join_next(), if !units.is_empty() => {
                    self.reap(&mut summary, outcome);
                }
                message = receiver.recv() => {
                    let Some(message) = message else { break };
                    let listener = self.clone();
                    let pending = receiver.pending.clone();
                    self.in_progress.fetch_add(1, Ordering::SeqCst);
                    units.spawn(async move {
                        let disposition = listener.handle(message).await;
                        pending.fetch_sub(1, Ordering::SeqCst);
                        disposition
                    });
                }
                _ = &mut shutdown => {
                    tracing::info!("Listener shutting down");
                    break;
                }
            }
        }

        while let Some(outcome) = units.join_next().await {
            self.reap(&mut summary, outcome);
        }
        tracing::info!(
            acked = summary.acked,
            rejected = summary.rejected,
            requeued = summary.requeued,
            "Listener stopped"
        );
        summary
    }

    fn reap(
        &self,
        summary: &mut ListenerSummary,
        outcome: Result<Disposition, tokio::task::JoinError>,
    ) {
        self.in_progress.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Ok(disposition) => summary.record(disposition),
            Err(e) => {
                tracing::error!(error = %e, "Unit of work panicked");
                summary.record(Disposition::Requeue);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_types::{ExecutionId, PayloadId, TaskExecutionStatus, TaskId, WorkflowInstanceId};

    fn make_update() -> TaskUpdateEvent {
        TaskUpdateEvent {
            workflow_instance_id: WorkflowInstanceId::new("wi-1"),
            task_id: TaskId::new("a"),
            execution_id: ExecutionId::new("ex-1"),
            correlation_id: "c".into(),
            status: TaskExecutionStatus::Accepted,
            reason: Default::default(),
            message: String::new(),
            outputs: Vec::new(),
            metadata: Default::default(),
            execution_stats: Default::default(),
        }
    }

    #[test]
    fn test_decode_by_topic() {
        let topics = TopicsConfig::default();
        let message = InboundMessage::from_event(&topics.task_update, &make_update()).unwrap();
        let event = InboundEvent::decode(&topics, &message).unwrap();
        assert_eq!(event, InboundEvent::TaskUpdate(make_update()));
        assert_eq!(event.serialization_key(), "instance:wi-1");
    }

    #[test]
    fn test_decode_envelope() {
        let topics = TopicsConfig::default();
        let envelope = JsonMessage::new(&make_update(), "c").unwrap();
        let message = InboundMessage::from_event(&topics.task_update, &envelope).unwrap();
        assert!(matches!(
            InboundEvent::decode(&topics, &message),
            Ok(InboundEvent::TaskUpdate(_))
        ));
    }

    #[test]
    fn test_decode_errors() {
        let topics = TopicsConfig::default();
        let wrong_topic = InboundMessage::new("md.unknown", serde_json::json!({}));
        assert!(matches!(
            InboundEvent::decode(&topics, &wrong_topic),
            Err(WorkflowError::InvalidEvent(_))
        ));

        let bad_body = InboundMessage::new(&topics.workflow_request, serde_json::json!({"x": 1}));
        assert!(InboundEvent::decode(&topics, &bad_body).is_err());
    }

    #[test]
    fn test_payload_key() {
        let event = InboundEvent::PayloadReady(PayloadReadyEvent {
            payload_id: PayloadId::new("p1"),
            bucket: "b".into(),
            correlation_id: "c".into(),
            calling_origin: String::new(),
            called_origin: String::new(),
            workflow_ids: Vec::new(),
        });
        assert_eq!(event.serialization_key(), "payload:p1");
    }

    #[tokio::test]
    async fn test_sender_tracks_pending() {
        let (tx, mut rx) = channel(4);
        tx.send(InboundMessage::new("t", serde_json::Value::Null))
            .await
            .unwrap();
        assert_eq!(tx.pending(), 1);
        assert!(rx.rx.recv().await.is_some());
        drop(rx);
        assert!(tx
            .send(InboundMessage::new("t", serde_json::Value::Null))
            .await
            .is_err());
        assert_eq!(tx.pending(), 1);
    }
}

//! Message transport seam
//!
//! The engine publishes [`JsonMessage`]s through a [`Publisher`] and reports
//! a [`Disposition`] for every inbound message. Delivery mechanics
//! (acknowledge, reject, requeue) belong to the transport itself.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use workflow_types::{ErrorCategory, JsonMessage, WorkflowError, WorkflowResult};

/// Transport errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Message could not be encoded: {0}")]
    Encoding(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

impl From<TransportError> for WorkflowError {
    fn from(err: TransportError) -> Self {
        WorkflowError::Transport(err.to_string())
    }
}

/// Outbound message publisher
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, routing_key: &str, message: JsonMessage) -> TransportResult<()>;
}

/// What the transport should do with an inbound message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove from the queue
    Ack,
    /// Can never succeed; drop without redelivery
    Reject,
    /// Transient failure; redeliver
    Requeue,
}

impl Disposition {
    pub fn from_result<T>(result: &WorkflowResult<T>) -> Self {
        match result {
            Ok(_) => Self::Ack,
            Err(err) => match err.category() {
                ErrorCategory::Transient => Self::Requeue,
                ErrorCategory::Definition
                | ErrorCategory::State
                | ErrorCategory::Condition
                | ErrorCategory::MandatoryArtifact => Self::Reject,
            },
        }
    }
}

/// Publisher that keeps every message in memory
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    messages: Arc<Mutex<Vec<(String, JsonMessage)>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// All published messages with their routing keys
    pub async fn published(&self) -> Vec<(String, JsonMessage)> {
        self.messages.lock().await.clone()
    }

    /// Messages published on one routing key
    pub async fn published_on(&self, routing_key: &str) -> Vec<JsonMessage> {
        self.messages
            .lock()
            .await
            .iter()
            .filter(|(key, _)| key == routing_key)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub async fn clear(&self) {
        self.messages.lock().await.clear();
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, routing_key: &str, message: JsonMessage) -> TransportResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("publisher set to fail".into()));
        }
        self.messages
            .lock()
            .await
            .push((routing_key.to_string(), message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_types::TaskId;

    #[test]
    fn test_disposition_mapping() {
        assert_eq!(Disposition::from_result(&Ok(())), Disposition::Ack);
        let transient: WorkflowResult<()> = Err(WorkflowError::Transport("down".into()));
        assert_eq!(Disposition::from_result(&transient), Disposition::Requeue);
        let state: WorkflowResult<()> = Err(WorkflowError::TaskNotFound {
            instance: "i".into(),
            task: TaskId::new("t"),
        });
        assert_eq!(Disposition::from_result(&state), Disposition::Reject);
    }

    #[tokio::test]
    async fn test_recording_publisher() {
        let publisher = RecordingPublisher::new();
        let message = JsonMessage::new(&serde_json::json!({"a": 1}), "c").unwrap();
        publisher.publish("topic.a", message.clone()).await.unwrap();
        publisher.publish("topic.b", message.clone()).await.unwrap();
        assert_eq!(publisher.published().await.len(), 2);
        assert_eq!(publisher.published_on("topic.a").await.len(), 1);

        publisher.set_failing(true);
        assert!(publisher.publish("topic.a", message).await.is_err());
        assert_eq!(publisher.published().await.len(), 2);
    }
}

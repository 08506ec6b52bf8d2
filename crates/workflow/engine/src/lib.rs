//! Workflow execution engine
//!
//! The engine turns payload arrivals into workflow instances and drives each
//! instance through its task graph as execution backends report back. It
//! never runs task work itself: it dispatches requests, waits for status
//! updates and decides what runs next.
//!
//! # Architecture
//!
//! The [`WorkflowExecuterService`] composes specialized components:
//!
//! - [`DefinitionRegistry`] with [`GraphValidator`]: validates and stores
//!   definition revisions
//! - [`TaskDestinationResolver`]: evaluates destination conditions and
//!   creates downstream executions
//! - [`ArtifactMapper`]: resolves and verifies artifact locations
//! - [`WorkflowInstanceStateMachine`]: guards task transitions and derives
//!   the instance status
//! - [`DispatchCoordinator`]: publishes dispatch and export requests
//!
//! The [`EventListener`] decodes inbound messages and serializes work per
//! instance. Persistence, object storage and messaging sit behind the traits
//! in [`store`], [`object_storage`] and [`transport`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use workflow_engine::{
//!     DefinitionRegistry, EngineConfig, EngineServices, GraphValidator, InMemoryObjectStorage,
//!     InMemoryStore, RecordingPublisher, WorkflowExecuterService,
//! };
//! use workflow_types::*;
//!
//! # async fn run() -> WorkflowResult<()> {
//! let publisher = RecordingPublisher::new();
//! let services = EngineServices::in_memory(
//!     InMemoryStore::new(),
//!     InMemoryObjectStorage::assume_present(),
//!     Arc::new(publisher.clone()),
//! );
//!
//! let registry = DefinitionRegistry::new(services.definitions.clone(), GraphValidator::new());
//! registry
//!     .register(
//!         WorkflowDefinition::new("Brain Segmentation", "1.0")
//!             .with_origin("MONAI")
//!             .with_task(TaskNode::new("seg", "argo").then("report"))
//!             .with_task(TaskNode::new("report", "argo")),
//!     )
//!     .await?;
//!
//! let executer = WorkflowExecuterService::new(EngineConfig::default(), services);
//! let started = executer
//!     .process_new_payload(&PayloadReadyEvent {
//!         payload_id: PayloadId::new("payload-1"),
//!         bucket: "bucket".into(),
//!         correlation_id: "corr-1".into(),
//!         calling_origin: String::new(),
//!         called_origin: "MONAI".into(),
//!         workflow_ids: Vec::new(),
//!     })
//!     .await?;
//! assert_eq!(started.len(), 1);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod artifact_mapper;
pub mod config;
pub mod context;
pub mod definition_registry;
pub mod destination_resolver;
pub mod dispatch;
pub mod executer;
pub mod graph_validator;
pub mod listener;
pub mod object_storage;
pub mod runner;
pub mod state_machine;
pub mod store;
pub mod transport;

// Re-export main types
pub use artifact_mapper::{ArtifactMapper, OutputVerification};
pub use config::{EngineConfig, ExecutionConfig, MessagingConfig, StorageConfig, TopicsConfig};
pub use context::InstanceContext;
pub use definition_registry::DefinitionRegistry;
pub use destination_resolver::TaskDestinationResolver;
pub use dispatch::DispatchCoordinator;
pub use executer::{EngineServices, WorkflowExecuterService};
pub use graph_validator::{CycleCheck, GraphValidator, ValidationReport};
pub use listener::{EventListener, EventReceiver, EventSender, InboundEvent, InboundMessage};
pub use object_storage::{
    CredentialIssuer, DicomMetadataSource, InMemoryObjectStorage, StorageService,
};
pub use runner::{LoopbackRunner, RunnerRegistry, TaskDispatchHandler, TaskRunner};
pub use state_machine::WorkflowInstanceStateMachine;
pub use store::{DefinitionStore, InMemoryStore, InstanceStore, StoreError};
pub use transport::{Disposition, Publisher, RecordingPublisher};

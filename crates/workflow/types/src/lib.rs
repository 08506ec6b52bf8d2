//! Workflow domain types
//!
//! A workflow is a directed graph of tasks. The engine creates one running
//! instance of that graph per input payload, dispatches each task to an
//! external execution backend and drives the instance to a terminal state
//! as asynchronous status updates arrive.
//!
//! # Key Concepts
//!
//! - **WorkflowDefinition**: an immutable revision of the task graph.
//!   Nodes are [`TaskNode`]s, edges are [`TaskDestination`]s that may carry
//!   boolean conditions.
//! - **WorkflowInstance**: one execution of a definition against one payload.
//!   At most one instance exists per (definition id, payload id).
//! - **TaskExecution**: one instantiation of a task node inside an instance,
//!   with its own lifecycle status and artifact locations.
//! - **Events**: the JSON messages exchanged with the transport, inbound
//!   ([`PayloadReadyEvent`], [`TaskUpdateEvent`], [`ExportCompleteEvent`]) and
//!   outbound ([`TaskDispatchEvent`], [`ExportRequestEvent`]).

#![deny(unsafe_code)]

mod artifact;
mod definition;
mod destination;
mod errors;
mod events;
mod ids;
mod instance;
mod metadata;

pub use artifact::*;
pub use definition::*;
pub use destination::*;
pub use errors::*;
pub use events::*;
pub use ids::*;
pub use instance::*;
pub use metadata::*;

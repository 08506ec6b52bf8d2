//! Workflow executer daemon
//!
//! Wires the execution engine to in-memory collaborators and a local
//! JSON-lines transport: inbound events are read one per line, published
//! messages are written one per line. With loopback enabled, dispatch and
//! export requests are answered in-process so a workflow runs end to end
//! without external services.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod publisher;
pub mod runtime;

pub use config::{DaemonConfig, LoggingConfig};
pub use error::{DaemonError, DaemonResult};
pub use publisher::{LinePublisher, Loopback};
pub use runtime::Daemon;

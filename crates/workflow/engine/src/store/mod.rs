//! Persistence collaborators for definitions and instances
//!
//! The engine only talks to the [`DefinitionStore`] and [`InstanceStore`]
//! traits. Per-instance atomicity is the store's job: task status changes
//! are compare-and-set against the expected current status.

mod memory;
mod traits;

pub use memory::InMemoryStore;
pub use traits::{DefinitionStore, InstanceStore, StoreError, StoreResult};

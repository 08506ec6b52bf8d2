//! Task destinations: the conditional edges of a workflow graph
//!
//! A destination names the task to create once its source task completes.
//! It may carry one or more condition expressions; all of them must hold
//! for the edge to be followed.

use crate::TaskId;
use serde::{Deserialize, Serialize};

/// A directed, optionally conditional edge to another task node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDestination {
    /// Target task id
    pub name: TaskId,
    /// Condition expressions, combined with AND
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
}

impl TaskDestination {
    /// An unconditional edge
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            name: TaskId::new(target),
            conditions: Vec::new(),
        }
    }

    /// Add a condition to the edge
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    /// True when at least one non-blank condition is declared
    pub fn has_conditions(&self) -> bool {
        self.conditions.iter().any(|c| !c.trim().is_empty())
    }

    /// All non-blank conditions as a single `(a) AND (b)` expression
    pub fn combined_condition(&self) -> String {
        self.conditions
            .iter()
            .filter(|c| !c.trim().is_empty())
            .map(|c| format!("({})", c.trim()))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

/// A named export destination (resolved by the export agent)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExportDestination {
    pub name: String,
}

impl ExportDestination {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

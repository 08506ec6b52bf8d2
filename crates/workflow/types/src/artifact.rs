//! Artifact declarations and resolved artifact locations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resolved artifacts: logical name → storage path (relative to the bucket)
pub type ArtifactPaths = BTreeMap<String, String>;

/// A declared input or output artifact of a task node
///
/// `value` is a source expression such as `{{ context.input.dicom }}` or
/// `{{ context.executions.seg.artifacts.mask }}/series`. An empty output
/// value defaults to the producing task's output directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_mandatory")]
    pub mandatory: bool,
}

fn default_mandatory() -> bool {
    true
}

impl Artifact {
    /// A mandatory artifact
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            mandatory: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }
}

/// Input and output artifact declarations of a task node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMap {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<Artifact>,
}

impl ArtifactMap {
    pub fn is_empty(&self) -> bool {
        self.input.is_empty() && self.output.is_empty()
    }
}

/// Join a storage prefix and a suffix without doubling the separator
pub fn join_storage_path(base: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        suffix.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mandatory_defaults_to_true() {
        let art: Artifact = serde_json::from_str(r#"{"name": "dicom"}"#).unwrap();
        assert!(art.mandatory);
        assert!(art.value.is_empty());
        assert!(!Artifact::new("a", "b").optional().mandatory);
    }

    #[test]
    fn test_join_storage_path() {
        assert_eq!(join_storage_path("p/workflows/i/e/", "mask"), "p/workflows/i/e/mask");
        assert_eq!(join_storage_path("p/dcm", "/series"), "p/dcm/series");
        assert_eq!(join_storage_path("p/dcm", ""), "p/dcm");
    }
}

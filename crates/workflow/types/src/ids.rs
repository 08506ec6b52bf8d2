//! String-backed identifiers

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First eight characters, for log lines
            pub fn short(&self) -> &str {
                match self.0.char_indices().nth(8) {
                    Some((idx, _)) => &self.0[..idx],
                    None => &self.0,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier shared by every revision of a workflow definition
    WorkflowDefinitionId
);

string_id!(
    /// Identifier of a task node, unique within its definition only
    TaskId
);

string_id!(
    /// Unique identifier of a running workflow instance
    WorkflowInstanceId
);

string_id!(
    /// Unique identifier of one dispatch of a task
    ExecutionId
);

string_id!(
    /// Identifier of the input payload that triggered an instance
    PayloadId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = WorkflowInstanceId::generate();
        let b = WorkflowInstanceId::generate();
        assert_ne!(a, b);
        assert_eq!(a.short().len(), 8);
    }

    #[test]
    fn test_short_id_handles_short_and_multibyte_values() {
        assert_eq!(TaskId::new("a").short(), "a");
        assert_eq!(TaskId::new("ééééééééé").short(), "éééééééé");
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = PayloadId::new("payload-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"payload-1\"");
        let back: PayloadId = serde_json::from_str("\"payload-1\"").unwrap();
        assert_eq!(back, id);
        assert_eq!(format!("{}", back), "payload-1");
    }
}

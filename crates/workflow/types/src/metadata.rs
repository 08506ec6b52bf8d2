//! Typed metadata values
//!
//! Task updates carry free-form result metadata. Values are kept as an
//! explicit tagged type so condition lookups can match on them exhaustively.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata map keyed by result name
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A single metadata value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged, from = "serde_json::Value")]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl MetadataValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view: numbers as-is, strings when they parse
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for MetadataValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(Self::Number)
                .unwrap_or_else(|| Self::String(n.to_string())),
            serde_json::Value::String(s) => Self::String(s),
            // Nested structures are kept as their JSON text.
            other => Self::String(other.to_string()),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl std::fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "{}", s),
        }
    }
}

// ── Patient Details ──────────────────────────────────────────────────

/// Patient attributes extracted from the payload's DICOM headers
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_sex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_dob: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_hospital_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_from_json_scalars() {
        let meta: Metadata =
            serde_json::from_str(r#"{"a": null, "b": true, "c": 3, "d": "x", "e": {"k": 1}}"#)
                .unwrap();
        assert_eq!(meta["a"], MetadataValue::Null);
        assert_eq!(meta["b"], MetadataValue::Bool(true));
        assert_eq!(meta["c"], MetadataValue::Number(3.0));
        assert_eq!(meta["d"], MetadataValue::String("x".into()));
        assert_eq!(meta["e"], MetadataValue::String(r#"{"k":1}"#.into()));
    }

    #[test]
    fn test_serialize_untagged() {
        let mut meta = Metadata::new();
        meta.insert("flag".into(), true.into());
        meta.insert("score".into(), 0.5.into());
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, r#"{"flag":true,"score":0.5}"#);
    }

    #[test]
    fn test_display_renders_integral_numbers_without_fraction() {
        assert_eq!(MetadataValue::Number(5.0).to_string(), "5");
        assert_eq!(MetadataValue::Number(2.5).to_string(), "2.5");
        assert_eq!(MetadataValue::Bool(false).to_string(), "false");
        assert_eq!(MetadataValue::Null.to_string(), "null");
    }

    #[test]
    fn test_numeric_view() {
        assert_eq!(MetadataValue::from("42").as_f64(), Some(42.0));
        assert_eq!(MetadataValue::from("abc").as_f64(), None);
        assert_eq!(MetadataValue::Bool(true).as_f64(), None);
    }
}

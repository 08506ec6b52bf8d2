//! Context references and values
//!
//! A `{{ ... }}` parameter names a value in one of the context namespaces:
//!
//! - `context.executions.<task>.<field>`: a task execution of the instance,
//!   including `result.<key>` metadata and `artifacts.<name>` outputs
//! - `context.dicom.series.any('gggg','eeee')` / `.all(...)`: DICOM tags of
//!   the triggering payload
//! - `context.input.patient_details.<field>` and `context.input.dicom`
//! - `context.workflow.name` / `context.workflow.description`
//!
//! Lookups never fail: a reference that resolves to nothing yields
//! [`Value::Undefined`].

use crate::errors::{DslError, DslResult};
use std::collections::HashMap;
use workflow_types::MetadataValue;

// ── References ───────────────────────────────────────────────────────

/// A parsed context path
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContextRef {
    Execution { task: String, field: ExecutionField },
    Dicom { scope: DicomScope, tag: DicomTag },
    Patient(PatientField),
    Workflow(WorkflowField),
    /// Storage location of the payload's DICOM files
    InputDicom,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionField {
    TaskId,
    Status,
    ExecutionId,
    OutputDir,
    TaskType,
    PreviousTaskId,
    ErrorMessage,
    StartTime,
    /// Metadata reported with the task's success
    Result(String),
    /// A verified output artifact
    Artifact(String),
}

/// How tag values from several DICOM files are combined
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DicomScope {
    /// First non-empty value of any file
    Any,
    /// The value shared by every file, empty when they disagree
    All,
}

/// A DICOM tag as group and element, four hex digits each
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DicomTag {
    pub group: String,
    pub element: String,
}

impl DicomTag {
    pub fn new(group: &str, element: &str) -> DslResult<Self> {
        let valid = |part: &str| part.len() == 4 && part.chars().all(|c| c.is_ascii_hexdigit());
        if !valid(group) || !valid(element) {
            return Err(DslError::InvalidTag(format!("{},{}", group, element)));
        }
        Ok(Self {
            group: group.to_ascii_uppercase(),
            element: element.to_ascii_uppercase(),
        })
    }

    /// Key used in DICOM JSON metadata, e.g. `00100040`
    pub fn key(&self) -> String {
        format!("{}{}", self.group, self.element)
    }
}

impl std::fmt::Display for DicomTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.group, self.element)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PatientField {
    Id,
    Name,
    Sex,
    Dob,
    Age,
    HospitalId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkflowField {
    Name,
    Description,
}

impl ContextRef {
    /// Parse the text between `{{` and `}}`
    pub fn parse(path: &str) -> DslResult<Self> {
        let path = path.trim();
        let unknown = || DslError::UnknownReference(path.to_string());

        let rest = strip_prefix_ignore_case(path, "context.").ok_or_else(unknown)?;

        if let Some(rest) = strip_prefix_ignore_case(rest, "executions.") {
            let (task, field) = rest.split_once('.').ok_or_else(unknown)?;
            if task.is_empty() {
                return Err(unknown());
            }
            let field = parse_execution_field(field).ok_or_else(unknown)?;
            return Ok(Self::Execution {
                task: task.to_string(),
                field,
            });
        }

        if let Some(rest) = strip_prefix_ignore_case(rest, "dicom.series.") {
            return parse_dicom(rest).and_then(|r| r.ok_or_else(unknown));
        }

        if let Some(field) = strip_prefix_ignore_case(rest, "input.patient_details.") {
            let field = match field.to_ascii_lowercase().as_str() {
                "id" => PatientField::Id,
                "name" => PatientField::Name,
                "sex" => PatientField::Sex,
                "dob" => PatientField::Dob,
                "age" => PatientField::Age,
                "hospital_id" => PatientField::HospitalId,
                _ => return Err(unknown()),
            };
            return Ok(Self::Patient(field));
        }

        match rest.to_ascii_lowercase().as_str() {
            "input.dicom" => Ok(Self::InputDicom),
            "workflow.name" => Ok(Self::Workflow(WorkflowField::Name)),
            "workflow.description" => Ok(Self::Workflow(WorkflowField::Description)),
            _ => Err(unknown()),
        }
    }
}

impl std::fmt::Display for ContextRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execution { task, field } => {
                write!(f, "context.executions.{}.", task)?;
                match field {
                    ExecutionField::TaskId => write!(f, "task_id"),
                    ExecutionField::Status => write!(f, "status"),
                    ExecutionField::ExecutionId => write!(f, "execution_id"),
                    ExecutionField::OutputDir => write!(f, "output_dir"),
                    ExecutionField::TaskType => write!(f, "task_type"),
                    ExecutionField::PreviousTaskId => write!(f, "previous_task_id"),
                    ExecutionField::ErrorMessage => write!(f, "error_msg"),
                    ExecutionField::StartTime => write!(f, "start_time"),
                    ExecutionField::Result(key) => write!(f, "result.{}", key),
                    ExecutionField::Artifact(name) => write!(f, "artifacts.{}", name),
                }
            }
            Self::Dicom { scope, tag } => {
                let scope = match scope {
                    DicomScope::Any => "any",
                    DicomScope::All => "all",
                };
                write!(
                    f,
                    "context.dicom.series.{}('{}','{}')",
                    scope, tag.group, tag.element
                )
            }
            Self::Patient(field) => {
                let name = match field {
                    PatientField::Id => "id",
                    PatientField::Name => "name",
                    PatientField::Sex => "sex",
                    PatientField::Dob => "dob",
                    PatientField::Age => "age",
                    PatientField::HospitalId => "hospital_id",
                };
                write!(f, "context.input.patient_details.{}", name)
            }
            Self::Workflow(WorkflowField::Name) => write!(f, "context.workflow.name"),
            Self::Workflow(WorkflowField::Description) => {
                write!(f, "context.workflow.description")
            }
            Self::InputDicom => write!(f, "context.input.dicom"),
        }
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        text.get(prefix.len()..)
    } else {
        None
    }
}

fn parse_execution_field(field: &str) -> Option<ExecutionField> {
    if let Some(key) = strip_prefix_ignore_case(field, "result") {
        return parse_key(key).map(ExecutionField::Result);
    }
    if let Some(name) = strip_prefix_ignore_case(field, "artifacts") {
        return parse_key(name).map(ExecutionField::Artifact);
    }
    let field = match field.to_ascii_lowercase().as_str() {
        "task_id" => ExecutionField::TaskId,
        "status" => ExecutionField::Status,
        "execution_id" => ExecutionField::ExecutionId,
        "output_dir" => ExecutionField::OutputDir,
        "task_type" => ExecutionField::TaskType,
        "previous_task_id" => ExecutionField::PreviousTaskId,
        "error_msg" => ExecutionField::ErrorMessage,
        "start_time" => ExecutionField::StartTime,
        _ => return None,
    };
    Some(field)
}

/// `.key`, `.'key'` or `['key']`
fn parse_key(text: &str) -> Option<String> {
    let key = if let Some(dotted) = text.strip_prefix('.') {
        dotted
    } else {
        text.strip_prefix('[')?.strip_suffix(']')?
    };
    let key = unquote(key.trim());
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

fn unquote(text: &str) -> &str {
    for quote in ['\'', '"'] {
        if let Some(inner) = text
            .strip_prefix(quote)
            .and_then(|t| t.strip_suffix(quote))
        {
            return inner;
        }
    }
    text
}

fn parse_dicom(text: &str) -> DslResult<Option<ContextRef>> {
    let (name, args) = match text.split_once('(') {
        Some(parts) => parts,
        None => return Ok(None),
    };
    let scope = match name.trim().to_ascii_lowercase().as_str() {
        "any" => DicomScope::Any,
        "all" => DicomScope::All,
        _ => return Ok(None),
    };
    let args = match args.trim_end().strip_suffix(')') {
        Some(args) => args,
        None => return Ok(None),
    };
    let (group, element) = args
        .split_once(',')
        .ok_or_else(|| DslError::InvalidTag(args.to_string()))?;
    let tag = DicomTag::new(unquote(group.trim()), unquote(element.trim()))?;
    Ok(Some(ContextRef::Dicom { scope, tag }))
}

// ── Values ───────────────────────────────────────────────────────────

/// A resolved operand
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// The reference resolved to nothing
    Undefined,
    /// The reference resolved to an explicit null
    Null,
    Text(String),
    Number(f64),
    Bool(bool),
    List(Vec<Value>),
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// Numeric view: numbers, and text that parses as a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn from_option(value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => Self::Text(v.into()),
            None => Self::Undefined,
        }
    }
}

impl From<&MetadataValue> for Value {
    fn from(value: &MetadataValue) -> Self {
        match value {
            MetadataValue::Null => Self::Null,
            MetadataValue::Bool(b) => Self::Bool(*b),
            MetadataValue::Number(n) => Self::Number(*n),
            MetadataValue::String(s) => Self::Text(s.clone()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Null => write!(f, "null"),
            Self::Text(s) => write!(f, "{}", s),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Self::Number(n) => write!(f, "{}", n),
            Self::Bool(b) => write!(f, "{}", b),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

// ── Context ──────────────────────────────────────────────────────────

/// Source of values for context references
pub trait ConditionContext {
    fn resolve(&self, reference: &ContextRef) -> Value;
}

/// A fixed set of reference values
#[derive(Clone, Debug, Default)]
pub struct StaticContext {
    values: HashMap<ContextRef, Value>,
}

impl StaticContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: ContextRef, value: Value) {
        self.values.insert(reference, value);
    }

    /// Builder form taking a path such as `context.workflow.name`
    pub fn with(mut self, path: &str, value: Value) -> DslResult<Self> {
        self.insert(ContextRef::parse(path)?, value);
        Ok(self)
    }
}

impl ConditionContext for StaticContext {
    fn resolve(&self, reference: &ContextRef) -> Value {
        self.values
            .get(reference)
            .cloned()
            .unwrap_or(Value::Undefined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_execution_fields() {
        let r = ContextRef::parse("context.executions.seg.status").unwrap();
        assert_eq!(
            r,
            ContextRef::Execution {
                task: "seg".into(),
                field: ExecutionField::Status
            }
        );
        let r = ContextRef::parse("CONTEXT.Executions.seg.output_dir").unwrap();
        assert!(matches!(
            r,
            ContextRef::Execution {
                field: ExecutionField::OutputDir,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_result_key_forms() {
        for path in [
            "context.executions.t1.result.Confidence",
            "context.executions.t1.result.'Confidence'",
            "context.executions.t1.result['Confidence']",
        ] {
            let r = ContextRef::parse(path).unwrap();
            assert_eq!(
                r,
                ContextRef::Execution {
                    task: "t1".into(),
                    field: ExecutionField::Result("Confidence".into())
                },
                "{}",
                path
            );
        }
    }

    #[test]
    fn test_parse_artifact_reference() {
        let r = ContextRef::parse("context.executions.seg.artifacts.mask").unwrap();
        assert_eq!(r.to_string(), "context.executions.seg.artifacts.mask");
    }

    #[test]
    fn test_parse_dicom_tag() {
        let r = ContextRef::parse("context.dicom.series.any('0010','0040')").unwrap();
        match r {
            ContextRef::Dicom { scope, tag } => {
                assert_eq!(scope, DicomScope::Any);
                assert_eq!(tag.key(), "00100040");
            }
            other => panic!("unexpected {:?}", other),
        }
        let r = ContextRef::parse("context.dicom.series.all( '0008' , '103e' )").unwrap();
        assert_eq!(r.to_string(), "context.dicom.series.all('0008','103E')");
    }

    #[test]
    fn test_invalid_dicom_tag() {
        let err = ContextRef::parse("context.dicom.series.any('10','0040')").unwrap_err();
        assert!(matches!(err, DslError::InvalidTag(_)));
    }

    #[test]
    fn test_parse_patient_and_workflow() {
        assert_eq!(
            ContextRef::parse("context.input.patient_details.sex").unwrap(),
            ContextRef::Patient(PatientField::Sex)
        );
        assert_eq!(
            ContextRef::parse("context.workflow.name").unwrap(),
            ContextRef::Workflow(WorkflowField::Name)
        );
        assert_eq!(
            ContextRef::parse("context.input.dicom").unwrap(),
            ContextRef::InputDicom
        );
    }

    #[test]
    fn test_unknown_references() {
        for path in [
            "workflow.name",
            "context.executions.seg",
            "context.executions.seg.nope",
            "context.executions.seg.result.",
            "context.input.patient_details.shoe_size",
            "context.dicom.series.first('0010','0040')",
        ] {
            assert!(
                matches!(ContextRef::parse(path), Err(DslError::UnknownReference(_))),
                "{}",
                path
            );
        }
    }

    #[test]
    fn test_value_display_and_number() {
        assert_eq!(Value::Number(3.0).to_string(), "3");
        assert_eq!(Value::Number(0.5).to_string(), "0.5");
        assert_eq!(Value::text(" 42 ").as_number(), Some(42.0));
        assert_eq!(Value::Bool(true).as_number(), None);
        assert_eq!(
            Value::List(vec![Value::text("a"), Value::Number(1.0)]).to_string(),
            "[a, 1]"
        );
    }

    #[test]
    fn test_static_context() {
        let ctx = StaticContext::new()
            .with("context.workflow.name", Value::text("ct"))
            .unwrap();
        assert_eq!(
            ctx.resolve(&ContextRef::Workflow(WorkflowField::Name)),
            Value::text("ct")
        );
        assert!(ctx.resolve(&ContextRef::InputDicom).is_undefined());
    }
}

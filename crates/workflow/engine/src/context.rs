//! Evaluation context over a live workflow instance
//!
//! [`InstanceContext`] answers the context references used by destination
//! conditions, plugin argument templates and artifact sources. Execution
//! fields come straight from the instance's task list. DICOM tag values and
//! patient details live in object storage, so the ones a resolution step
//! needs are fetched up front with [`InstanceContext::prefetch`].

use crate::object_storage::DicomMetadataSource;
use std::collections::{HashMap, HashSet};
use workflow_dsl::{
    ConditionContext, ContextRef, DicomScope, DicomTag, ExecutionField, Parser, PatientField,
    Segment, Template, Value, WorkflowField,
};
use workflow_types::{
    PatientDetails, TaskExecution, TaskNode, WorkflowDefinition, WorkflowError, WorkflowInstance,
    WorkflowResult,
};

/// Timestamp format of `context.executions.<task>.start_time`
pub const START_TIME_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// Context references over one instance and the definition revision it runs
pub struct InstanceContext<'a> {
    instance: &'a WorkflowInstance,
    definition: &'a WorkflowDefinition,
    dicom: HashMap<(DicomScope, DicomTag), Value>,
    patient: Option<PatientDetails>,
}

impl<'a> InstanceContext<'a> {
    pub fn new(instance: &'a WorkflowInstance, definition: &'a WorkflowDefinition) -> Self {
        Self {
            instance,
            definition,
            dicom: HashMap::new(),
            patient: None,
        }
    }

    pub fn instance(&self) -> &WorkflowInstance {
        self.instance
    }

    /// Load the DICOM and patient values behind `references`
    pub async fn prefetch<'r>(
        &mut self,
        references: impl IntoIterator<Item = &'r ContextRef>,
        source: &dyn DicomMetadataSource,
    ) -> WorkflowResult<()> {
        let bucket = self.instance.bucket_id.as_str();
        let payload = &self.instance.payload_id;
        let mut wants_patient = false;

        for reference in references {
            match reference {
                ContextRef::Dicom { scope, tag } => {
                    let key = (*scope, tag.clone());
                    if self.dicom.contains_key(&key) {
                        continue;
                    }
                    let values = source
                        .tag_values(bucket, payload, tag)
                        .await
                        .map_err(|e| WorkflowError::StorageService(e.to_string()))?;
                    self.dicom.insert(key, combine_tag_values(*scope, &values));
                }
                ContextRef::Patient(_) => wants_patient = true,
                _ => {}
            }
        }

        if wants_patient && self.patient.is_none() {
            let details = source
                .patient_details(bucket, payload)
                .await
                .map_err(|e| WorkflowError::StorageService(e.to_string()))?;
            self.patient = Some(details);
        }
        Ok(())
    }

    fn resolve_execution(&self, task: &TaskExecution, field: &ExecutionField) -> Value {
        match field {
            ExecutionField::TaskId => Value::text(task.task_id.as_str()),
            ExecutionField::Status => Value::text(task.status.to_string()),
            ExecutionField::ExecutionId => Value::text(task.execution_id.as_str()),
            ExecutionField::OutputDir => Value::text(task.output_directory.clone()),
            ExecutionField::TaskType => Value::text(task.task_type.clone()),
            ExecutionField::PreviousTaskId => {
                Value::from_option(task.previous_task_id.as_ref().map(|t| t.as_str()))
            }
            ExecutionField::ErrorMessage => Value::from_option(task.error_message.clone()),
            ExecutionField::StartTime => {
                Value::text(task.started_at.format(START_TIME_FORMAT).to_string())
            }
            ExecutionField::Result(key) => task
                .result_metadata
                .get(key)
                .map(Value::from)
                .unwrap_or(Value::Undefined),
            ExecutionField::Artifact(name) => {
                Value::from_option(task.output_artifacts.get(name).cloned())
            }
        }
    }

    fn resolve_patient(&self, field: PatientField) -> Value {
        let Some(patient) = &self.patient else {
            return Value::Undefined;
        };
        match field {
            PatientField::Id => Value::from_option(patient.patient_id.clone()),
            PatientField::Name => Value::from_option(patient.patient_name.clone()),
            PatientField::Sex => Value::from_option(patient.patient_sex.clone()),
            PatientField::Dob => {
                Value::from_option(patient.patient_dob.map(|d| d.format("%Y-%m-%d").to_string()))
            }
            PatientField::Age => Value::from_option(patient.patient_age.clone()),
            PatientField::HospitalId => Value::from_option(patient.patient_hospital_id.clone()),
        }
    }
}

impl ConditionContext for InstanceContext<'_> {
    fn resolve(&self, reference: &ContextRef) -> Value {
        match reference {
            ContextRef::Execution { task, field } => self
                .instance
                .tasks
                .iter()
                .find(|t| t.task_id.as_str() == task)
                .map(|t| self.resolve_execution(t, field))
                .unwrap_or(Value::Undefined),
            ContextRef::Dicom { scope, tag } => self
                .dicom
                .get(&(*scope, tag.clone()))
                .cloned()
                .unwrap_or(Value::Undefined),
            ContextRef::Patient(field) => self.resolve_patient(*field),
            ContextRef::Workflow(WorkflowField::Name) => Value::text(self.definition.name.clone()),
            ContextRef::Workflow(WorkflowField::Description) => {
                Value::text(self.definition.description.clone())
            }
            ContextRef::InputDicom => Value::text(format!("{}/dcm", self.instance.payload_id)),
        }
    }
}

/// `any`: first non-empty value. `all`: the value every file agrees on,
/// empty text when they differ.
fn combine_tag_values(scope: DicomScope, values: &[String]) -> Value {
    if values.is_empty() {
        return Value::Undefined;
    }
    match scope {
        DicomScope::Any => values
            .iter()
            .find(|v| !v.is_empty())
            .map(|v| Value::text(v.clone()))
            .unwrap_or(Value::Undefined),
        DicomScope::All => {
            let first = &values[0];
            if !first.is_empty() && values.iter().all(|v| v == first) {
                Value::text(first.clone())
            } else {
                Value::text("")
            }
        }
    }
}

// ── Reference collection ─────────────────────────────────────────────

/// References used by a node's destination conditions. Unparseable
/// conditions are skipped here and reported when evaluated.
pub fn condition_references(node: &TaskNode) -> Vec<ContextRef> {
    node.task_destinations
        .iter()
        .flat_map(|d| d.conditions.iter())
        .filter_map(|c| Parser::parse(c).ok())
        .flat_map(|expr| expr.references().into_iter().cloned().collect::<Vec<_>>())
        .collect()
}

/// References used by a node's argument and artifact templates
pub fn template_references(node: &TaskNode) -> Vec<ContextRef> {
    node.args
        .values()
        .chain(node.artifacts.input.iter().map(|a| &a.value))
        .chain(node.artifacts.output.iter().map(|a| &a.value))
        .filter_map(|text| Template::parse(text).ok())
        .flat_map(|t| {
            t.segments()
                .iter()
                .filter_map(|s| match s {
                    Segment::Reference(r) => Some(r.clone()),
                    Segment::Text(_) => None,
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Everything resolving the destinations of `completed` may look up
pub fn resolution_references(definition: &WorkflowDefinition, completed: &TaskNode) -> Vec<ContextRef> {
    let mut seen = HashSet::new();
    let mut refs = condition_references(completed);
    for dest in &completed.task_destinations {
        if seen.insert(&dest.name) {
            if let Some(target) = definition.task(&dest.name) {
                refs.extend(template_references(target));
            }
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_storage::InMemoryObjectStorage;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::collections::BTreeMap;
    use workflow_types::{MetadataValue, PayloadId, TaskDestination, TaskExecutionStatus, TaskId};

    fn make_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("brain-seg", "1")
            .with_description("segmentation")
            .with_task(TaskNode::new("seg", "argo").then("report"))
            .with_task(TaskNode::new("report", "argo"))
    }

    fn make_instance(def: &WorkflowDefinition) -> WorkflowInstance {
        let mut instance = WorkflowInstance::new(def, PayloadId::new("p1"), "bucket");
        let mut seg = TaskExecution::new(&instance, TaskId::new("seg"), "argo", 60.0);
        seg.set_status(TaskExecutionStatus::Succeeded);
        seg.started_at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        seg.result_metadata
            .insert("score".into(), MetadataValue::Number(0.92));
        seg.output_artifacts
            .insert("mask".into(), "p1/workflows/x/y/mask".into());
        instance.tasks.push(seg);
        instance
    }

    #[test]
    fn test_execution_fields() {
        let def = make_definition();
        let instance = make_instance(&def);
        let ctx = InstanceContext::new(&instance, &def);

        let resolve = |path: &str| ctx.resolve(&ContextRef::parse(path).unwrap());
        assert_eq!(resolve("context.executions.seg.status"), Value::text("Succeeded"));
        assert_eq!(resolve("context.executions.seg.result.score"), Value::Number(0.92));
        assert_eq!(
            resolve("context.executions.seg.artifacts.mask"),
            Value::text("p1/workflows/x/y/mask")
        );
        assert_eq!(
            resolve("context.executions.seg.start_time"),
            Value::text("05/03/2024 14:07:09")
        );
        assert_eq!(resolve("context.executions.seg.result.missing"), Value::Undefined);
        assert_eq!(resolve("context.executions.ghost.status"), Value::Undefined);
        assert_eq!(resolve("context.executions.seg.previous_task_id"), Value::Undefined);
        assert_eq!(resolve("context.workflow.name"), Value::text("brain-seg"));
        assert_eq!(resolve("context.input.dicom"), Value::text("p1/dcm"));
    }

    #[test]
    fn test_combine_tag_values() {
        let v = |s: &[&str]| s.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        assert_eq!(combine_tag_values(DicomScope::Any, &v(&["", "CT"])), Value::text("CT"));
        assert_eq!(combine_tag_values(DicomScope::All, &v(&["CT", "CT"])), Value::text("CT"));
        assert_eq!(combine_tag_values(DicomScope::All, &v(&["CT", "MR"])), Value::text(""));
        assert_eq!(combine_tag_values(DicomScope::All, &v(&["CT", ""])), Value::text(""));
        assert_eq!(combine_tag_values(DicomScope::Any, &v(&[])), Value::Undefined);
    }

    #[tokio::test]
    async fn test_prefetch_dicom_and_patient() {
        let def = make_definition();
        let instance = make_instance(&def);
        let storage = InMemoryObjectStorage::new();
        storage
            .put_dicom_json(
                "bucket",
                &instance.payload_id,
                BTreeMap::from([("00080060".to_string(), "MR".to_string())]),
            )
            .await;
        storage
            .set_patient_details(
                "bucket",
                &instance.payload_id,
                PatientDetails {
                    patient_sex: Some("F".into()),
                    patient_dob: NaiveDate::from_ymd_opt(1980, 1, 2),
                    ..PatientDetails::default()
                },
            )
            .await;

        let refs = vec![
            ContextRef::parse("context.dicom.series.any('0008','0060')").unwrap(),
            ContextRef::parse("context.input.patient_details.sex").unwrap(),
        ];
        let mut ctx = InstanceContext::new(&instance, &def);
        ctx.prefetch(&refs, &storage).await.unwrap();

        assert_eq!(ctx.resolve(&refs[0]), Value::text("MR"));
        assert_eq!(ctx.resolve(&refs[1]), Value::text("F"));
        assert_eq!(
            ctx.resolve(&ContextRef::parse("context.input.patient_details.dob").unwrap()),
            Value::text("1980-01-02")
        );
    }

    #[tokio::test]
    async fn test_prefetch_storage_failure_is_transient() {
        let def = make_definition();
        let instance = make_instance(&def);
        let storage = InMemoryObjectStorage::new();
        storage.set_unavailable(true);
        let refs = vec![ContextRef::parse("context.input.patient_details.id").unwrap()];
        let mut ctx = InstanceContext::new(&instance, &def);
        let err = ctx.prefetch(&refs, &storage).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_resolution_references() {
        let def = WorkflowDefinition::new("wf", "1")
            .with_task(
                TaskNode::new("a", "argo").with_destination(
                    TaskDestination::new("b")
                        .when("{{ context.dicom.series.all('0010','0040') }} == 'F'"),
                ),
            )
            .with_task(TaskNode::new("b", "argo").with_arg("in", "{{ context.input.dicom }}"));
        let refs = resolution_references(&def, def.task(&TaskId::new("a")).unwrap());
        assert_eq!(refs.len(), 2);
        assert!(refs.contains(&ContextRef::InputDicom));
    }
}

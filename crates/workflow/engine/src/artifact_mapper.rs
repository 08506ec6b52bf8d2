//! Artifact resolution
//!
//! Input artifacts are resolved from their source templates and checked
//! against object storage before a task is dispatched. Output artifacts are
//! assigned locations when the execution is created and verified when the
//! backend reports success.

use crate::context::InstanceContext;
use crate::object_storage::StorageService;
use std::sync::Arc;
use workflow_dsl::{ConditionContext, ContextRef, ExecutionField, Segment, Template, Value};
use workflow_types::{
    join_storage_path, ArtifactPaths, TaskExecution, TaskNode, WorkflowError, WorkflowResult,
};

/// Result of checking reported outputs against storage
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutputVerification {
    /// Outputs found in storage
    pub verified: ArtifactPaths,
    /// Declared mandatory outputs that are not in storage
    pub missing_mandatory: Vec<String>,
}

#[derive(Clone)]
pub struct ArtifactMapper {
    storage: Arc<dyn StorageService>,
}

impl ArtifactMapper {
    pub fn new(storage: Arc<dyn StorageService>) -> Self {
        Self { storage }
    }

    /// Resolve and verify a node's input artifacts. A missing mandatory
    /// input fails the whole mapping; a missing optional one is dropped.
    pub async fn map_inputs(
        &self,
        node: &TaskNode,
        ctx: &InstanceContext<'_>,
    ) -> WorkflowResult<ArtifactPaths> {
        let mut candidates = ArtifactPaths::new();
        for artifact in &node.artifacts.input {
            match resolve_source(&artifact.value, ctx)? {
                Some(path) => {
                    candidates.insert(artifact.name.clone(), path);
                }
                None if artifact.mandatory => {
                    return Err(WorkflowError::MandatoryArtifactMissing {
                        task: node.id.clone(),
                        artifact: artifact.name.clone(),
                    });
                }
                None => {
                    tracing::debug!(task_id = %node.id, artifact = %artifact.name, "Optional input unresolved");
                }
            }
        }
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let verified = self
            .storage
            .verify_objects_exist(&ctx.instance().bucket_id, &candidates)
            .await
            .map_err(|e| WorkflowError::StorageService(e.to_string()))?;

        for artifact in &node.artifacts.input {
            if candidates.contains_key(&artifact.name) && !verified.contains_key(&artifact.name) {
                if artifact.mandatory {
                    return Err(WorkflowError::MandatoryArtifactMissing {
                        task: node.id.clone(),
                        artifact: artifact.name.clone(),
                    });
                }
                tracing::debug!(task_id = %node.id, artifact = %artifact.name, "Optional input not in storage");
            }
        }
        Ok(verified)
    }

    /// Assign storage locations to a node's declared outputs. An empty
    /// source defaults to `<output directory>/<name>`.
    pub fn map_outputs(
        &self,
        node: &TaskNode,
        execution: &TaskExecution,
        ctx: &InstanceContext<'_>,
    ) -> WorkflowResult<ArtifactPaths> {
        let mut outputs = ArtifactPaths::new();
        for artifact in &node.artifacts.output {
            let value = artifact.value.trim();
            let path = if value.is_empty() {
                Some(join_storage_path(&execution.output_directory, &artifact.name))
            } else {
                let template = parse_template(value)?;
                match template.as_reference_with_suffix() {
                    Some((
                        ContextRef::Execution {
                            task,
                            field: ExecutionField::OutputDir,
                        },
                        suffix,
                    )) if task.as_str() == node.id.as_str() => {
                        Some(join_storage_path(&execution.output_directory, &suffix))
                    }
                    _ => resolve_source(value, ctx)?,
                }
            };

            match path {
                Some(path) => {
                    outputs.insert(artifact.name.clone(), path);
                }
                None if artifact.mandatory => {
                    return Err(WorkflowError::MandatoryArtifactMissing {
                        task: node.id.clone(),
                        artifact: artifact.name.clone(),
                    });
                }
                None => {}
            }
        }
        Ok(outputs)
    }

    /// Check the outputs of a finished execution. Reported locations take
    /// precedence over the ones assigned at creation.
    pub async fn verify_outputs(
        &self,
        bucket: &str,
        node: &TaskNode,
        execution: &TaskExecution,
        reported: &ArtifactPaths,
    ) -> WorkflowResult<OutputVerification> {
        let mut candidates = execution.output_artifacts.clone();
        candidates.extend(reported.iter().map(|(k, v)| (k.clone(), v.clone())));
        if candidates.is_empty() {
            return Ok(OutputVerification::default());
        }

        let verified = self
            .storage
            .verify_objects_exist(bucket, &candidates)
            .await
            .map_err(|e| WorkflowError::StorageService(e.to_string()))?;

        let missing_mandatory = node
            .artifacts
            .output
            .iter()
            .filter(|a| a.mandatory && !verified.contains_key(&a.name))
            .map(|a| a.name.clone())
            .collect();

        Ok(OutputVerification {
            verified,
            missing_mandatory,
        })
    }
}

fn parse_template(value: &str) -> WorkflowResult<Template> {
    Template::parse(value)
        .map_err(|e| WorkflowError::InvalidDefinition(vec![format!("{}: {}", value, e)]))
}

/// Resolve an artifact source to a storage path; `None` when any reference
/// in it has no value
fn resolve_source(value: &str, ctx: &dyn ConditionContext) -> WorkflowResult<Option<String>> {
    let template = parse_template(value)?;

    if let Some((reference, suffix)) = template.as_reference_with_suffix() {
        return Ok(match ctx.resolve(reference) {
            Value::Text(path) if !path.is_empty() => Some(join_storage_path(&path, &suffix)),
            _ => None,
        });
    }

    if !template.has_references() {
        let path = value.trim();
        return Ok((!path.is_empty()).then(|| path.to_string()));
    }

    for segment in template.segments() {
        if let Segment::Reference(r) = segment {
            if matches!(ctx.resolve(r), Value::Undefined | Value::Null) {
                return Ok(None);
            }
        }
    }
    Ok(Some(template.render(ctx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_storage::InMemoryObjectStorage;
    use workflow_types::{
        Artifact, PayloadId, TaskExecutionStatus, TaskId, WorkflowDefinition, WorkflowInstance,
    };

    fn make_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "1")
            .with_task(
                TaskNode::new("seg", "argo")
                    .with_input(Artifact::new("dicom", "{{ context.input.dicom }}"))
                    .with_output(Artifact::new("mask", ""))
                    .with_output(Artifact::new(
                        "report",
                        "{{ context.executions.seg.output_dir }}/report.pdf",
                    ))
                    .then("post"),
            )
            .with_task(
                TaskNode::new("post", "argo")
                    .with_input(Artifact::new("mask", "{{ context.executions.seg.artifacts.mask }}"))
                    .with_input(
                        Artifact::new("extra", "{{ context.executions.seg.artifacts.extra }}")
                            .optional(),
                    ),
            )
    }

    fn make_instance(def: &WorkflowDefinition) -> WorkflowInstance {
        let mut instance = WorkflowInstance::new(def, PayloadId::new("p1"), "bucket");
        let mut seg = TaskExecution::new(&instance, TaskId::new("seg"), "argo", 60.0);
        seg.set_status(TaskExecutionStatus::Succeeded);
        seg.output_artifacts
            .insert("mask".into(), "p1/out/mask".into());
        instance.tasks.push(seg);
        instance
    }

    #[tokio::test]
    async fn test_map_inputs_resolves_and_verifies() {
        let def = make_definition();
        let instance = make_instance(&def);
        let storage = InMemoryObjectStorage::new();
        storage.put_object("bucket", "p1/dcm/1.dcm").await;
        storage.put_object("bucket", "p1/out/mask/m.nii").await;
        let mapper = ArtifactMapper::new(Arc::new(storage));
        let ctx = InstanceContext::new(&instance, &def);

        let seg = mapper
            .map_inputs(def.task(&TaskId::new("seg")).unwrap(), &ctx)
            .await
            .unwrap();
        assert_eq!(seg.get("dicom").unwrap(), "p1/dcm");

        let post = mapper
            .map_inputs(def.task(&TaskId::new("post")).unwrap(), &ctx)
            .await
            .unwrap();
        assert_eq!(post.len(), 1);
        assert_eq!(post.get("mask").unwrap(), "p1/out/mask");
    }

    #[tokio::test]
    async fn test_missing_mandatory_input_fails() {
        let def = make_definition();
        let mut instance = make_instance(&def);
        instance.tasks[0].output_artifacts.clear();
        let mapper = ArtifactMapper::new(Arc::new(InMemoryObjectStorage::assume_present()));
        let ctx = InstanceContext::new(&instance, &def);

        let err = mapper
            .map_inputs(def.task(&TaskId::new("post")).unwrap(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::MandatoryArtifactMissing { ref artifact, .. } if artifact == "mask"
        ));
    }

    #[tokio::test]
    async fn test_mandatory_input_absent_from_storage_fails() {
        let def = make_definition();
        let instance = make_instance(&def);
        let mapper = ArtifactMapper::new(Arc::new(InMemoryObjectStorage::new()));
        let ctx = InstanceContext::new(&instance, &def);

        let err = mapper
            .map_inputs(def.task(&TaskId::new("seg")).unwrap(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::MandatoryArtifactMissing { .. }));
    }

    #[test]
    fn test_map_outputs_defaults_to_output_directory() {
        let def = make_definition();
        let instance = make_instance(&def);
        let mapper = ArtifactMapper::new(Arc::new(InMemoryObjectStorage::new()));
        let ctx = InstanceContext::new(&instance, &def);
        let exec = TaskExecution::new(&instance, TaskId::new("seg"), "argo", 60.0);

        let outputs = mapper
            .map_outputs(def.task(&TaskId::new("seg")).unwrap(), &exec, &ctx)
            .unwrap();
        assert_eq!(
            outputs.get("mask").unwrap(),
            &format!("{}mask", exec.output_directory)
        );
        assert_eq!(
            outputs.get("report").unwrap(),
            &format!("{}report.pdf", exec.output_directory)
        );
    }

    #[tokio::test]
    async fn test_verify_outputs_reports_missing_mandatory() {
        let def = make_definition();
        let instance = make_instance(&def);
        let storage = InMemoryObjectStorage::new();
        storage.put_object("bucket", "reported/mask/1.nii").await;
        let mapper = ArtifactMapper::new(Arc::new(storage));
        let node = def.task(&TaskId::new("seg")).unwrap();
        let exec = TaskExecution::new(&instance, TaskId::new("seg"), "argo", 60.0);

        let reported = ArtifactPaths::from([("mask".to_string(), "reported/mask".to_string())]);
        let outcome = mapper
            .verify_outputs("bucket", node, &exec, &reported)
            .await
            .unwrap();
        assert_eq!(outcome.verified.get("mask").unwrap(), "reported/mask");
        assert_eq!(outcome.missing_mandatory, vec!["report".to_string()]);
    }

    #[test]
    fn test_resolve_mixed_template() {
        let def = make_definition();
        let instance = make_instance(&def);
        let ctx = InstanceContext::new(&instance, &def);
        let path = resolve_source("static/{{ context.workflow.name }}/x", &ctx).unwrap();
        assert_eq!(path.as_deref(), Some("static/wf/x"));
        let path = resolve_source("static/{{ context.executions.nope.output_dir }}", &ctx).unwrap();
        assert_eq!(path, None);
        assert_eq!(resolve_source("plain/path", &ctx).unwrap().as_deref(), Some("plain/path"));
    }
}

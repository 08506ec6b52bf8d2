//! Destination resolution
//!
//! When a task completes, its destinations are evaluated in declared order.
//! A destination whose conditions hold (or that has none) yields a new
//! [`TaskExecution`] in `Created`. Targets already running or finished in
//! the instance are skipped, so converging branches dispatch a shared target
//! once. A condition that fails to evaluate counts as false.

use crate::artifact_mapper::ArtifactMapper;
use crate::context::InstanceContext;
use std::collections::{BTreeMap, HashSet};
use workflow_dsl::{ConditionEvaluator, Template};
use workflow_types::{
    TaskDestination, TaskExecution, TaskExecutionStatus, TaskId, TaskNode, WorkflowDefinition,
    WorkflowError, WorkflowResult,
};

#[derive(Clone)]
pub struct TaskDestinationResolver {
    evaluator: ConditionEvaluator,
    mapper: ArtifactMapper,
    default_timeout_minutes: f64,
}

impl TaskDestinationResolver {
    pub fn new(mapper: ArtifactMapper, default_timeout_minutes: f64) -> Self {
        Self {
            evaluator: ConditionEvaluator::new(),
            mapper,
            default_timeout_minutes,
        }
    }

    /// New executions for the destinations of `completed` that should run
    pub async fn resolve(
        &self,
        definition: &WorkflowDefinition,
        completed: &TaskId,
        ctx: &InstanceContext<'_>,
    ) -> WorkflowResult<Vec<TaskExecution>> {
        let instance = ctx.instance();
        let node = definition
            .task(completed)
            .ok_or_else(|| WorkflowError::TaskNotInDefinition {
                definition: definition.id.clone(),
                task: completed.clone(),
            })?;

        let mut seen: HashSet<&TaskId> = HashSet::new();
        let mut executions = Vec::new();

        for destination in &node.task_destinations {
            if seen.contains(&destination.name) {
                continue;
            }

            let selected = match self.conditions_hold(destination, ctx) {
                Ok(selected) => selected,
                Err(e) => {
                    tracing::warn!(
                        workflow_instance_id = %instance.id,
                        task_id = %completed,
                        destination = %destination.name,
                        error = %e,
                        "Destination condition could not be evaluated, treating as false"
                    );
                    false
                }
            };
            if !selected {
                tracing::debug!(
                    workflow_instance_id = %instance.id,
                    task_id = %completed,
                    destination = %destination.name,
                    "Destination condition not met"
                );
                continue;
            }
            seen.insert(&destination.name);

            if let Some(existing) = instance.task(&destination.name) {
                if existing.status != TaskExecutionStatus::Created {
                    tracing::debug!(
                        workflow_instance_id = %instance.id,
                        destination = %destination.name,
                        status = %existing.status,
                        "Destination already started, skipping"
                    );
                    continue;
                }
            }

            let target = definition.task(&destination.name).ok_or_else(|| {
                WorkflowError::TaskNotInDefinition {
                    definition: definition.id.clone(),
                    task: destination.name.clone(),
                }
            })?;
            executions.push(
                self.create_execution(target, Some(completed.clone()), ctx)
                    .await?,
            );
        }

        Ok(executions)
    }

    /// Whether every condition on `destination` holds
    pub fn conditions_hold(
        &self,
        destination: &TaskDestination,
        ctx: &InstanceContext<'_>,
    ) -> WorkflowResult<bool> {
        self.evaluator
            .evaluate_all(&destination.conditions, ctx)
            .map_err(|e| WorkflowError::Condition(format!("destination {}: {}", destination.name, e)))
    }

    /// A new execution of `node` with its arguments rendered and its
    /// artifacts mapped
    pub async fn create_execution(
        &self,
        node: &TaskNode,
        previous: Option<TaskId>,
        ctx: &InstanceContext<'_>,
    ) -> WorkflowResult<TaskExecution> {
        let timeout = node
            .timeout_minutes
            .unwrap_or(self.default_timeout_minutes);
        let mut execution = TaskExecution::new(ctx.instance(), node.id.clone(), &node.task_type, timeout)
            .with_previous(previous);

        execution.plugin_arguments = render_arguments(node, ctx)?;
        execution.input_artifacts = self.mapper.map_inputs(node, ctx).await?;
        execution.output_artifacts = self.mapper.map_outputs(node, &execution, ctx)?;
        Ok(execution)
    }
}

fn render_arguments(
    node: &TaskNode,
    ctx: &InstanceContext<'_>,
) -> WorkflowResult<BTreeMap<String, String>> {
    node.args
        .iter()
        .map(|(key, value)| {
            let template = Template::parse(value).map_err(|e| {
                WorkflowError::InvalidDefinition(vec![format!(
                    "argument \"{}\" of task \"{}\": {}",
                    key, node.id, e
                )])
            })?;
            Ok((key.clone(), template.render(ctx)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_storage::InMemoryObjectStorage;
    use proptest::prelude::*;
    use std::sync::Arc;
    use workflow_types::{
        Artifact, MetadataValue, PayloadId, TaskDestination, WorkflowInstance,
    };

    fn make_resolver() -> TaskDestinationResolver {
        let storage = Arc::new(InMemoryObjectStorage::assume_present());
        TaskDestinationResolver::new(ArtifactMapper::new(storage), 60.0)
    }

    fn make_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "1")
            .with_task(
                TaskNode::new("a", "argo")
                    .with_destination(
                        TaskDestination::new("b")
                            .when("{{ context.executions.a.result.score }} > 0.5"),
                    )
                    .with_destination(
                        TaskDestination::new("c")
                            .when("{{ context.executions.a.result.score }} <= 0.5"),
                    )
                    .with_destination(TaskDestination::new("d").when("'x' > 'y'"))
                    .then("b"),
            )
            .with_task(
                TaskNode::new("b", "argo")
                    .with_arg("source", "{{ context.executions.a.task_id }}")
                    .with_input(Artifact::new("dicom", "{{ context.input.dicom }}"))
                    .with_timeout_minutes(5.0),
            )
            .with_task(TaskNode::new("c", "argo"))
            .with_task(TaskNode::new("d", "argo"))
    }

    fn make_instance(def: &WorkflowDefinition, score: f64) -> WorkflowInstance {
        let mut instance = WorkflowInstance::new(def, PayloadId::new("p1"), "bucket");
        let mut a = TaskExecution::new(&instance, TaskId::new("a"), "argo", 60.0);
        a.set_status(TaskExecutionStatus::Succeeded);
        a.result_metadata
            .insert("score".into(), MetadataValue::Number(score));
        instance.tasks.push(a);
        instance
    }

    #[tokio::test]
    async fn test_conditions_select_destinations_once() {
        let def = make_definition();
        let instance = make_instance(&def, 0.9);
        let ctx = InstanceContext::new(&instance, &def);

        let next = make_resolver()
            .resolve(&def, &TaskId::new("a"), &ctx)
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
        let b = &next[0];
        assert_eq!(b.task_id, TaskId::new("b"));
        assert_eq!(b.previous_task_id, Some(TaskId::new("a")));
        assert_eq!(b.plugin_arguments.get("source").unwrap(), "a");
        assert_eq!(b.input_artifacts.get("dicom").unwrap(), "p1/dcm");
        assert_eq!(b.timeout_minutes, 5.0);
        assert_eq!(b.status, TaskExecutionStatus::Created);
    }

    #[tokio::test]
    async fn test_false_branch() {
        let def = make_definition();
        let instance = make_instance(&def, 0.2);
        let ctx = InstanceContext::new(&instance, &def);

        let next = make_resolver()
            .resolve(&def, &TaskId::new("a"), &ctx)
            .await
            .unwrap();
        let ids: Vec<&str> = next.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_started_targets_are_skipped() {
        let def = make_definition();
        let mut instance = make_instance(&def, 0.9);
        let mut b = TaskExecution::new(&instance, TaskId::new("b"), "argo", 60.0);
        b.set_status(TaskExecutionStatus::Dispatched);
        instance.tasks.push(b);
        let ctx = InstanceContext::new(&instance, &def);

        let next = make_resolver()
            .resolve(&def, &TaskId::new("a"), &ctx)
            .await
            .unwrap();
        assert!(next.is_empty());
    }

    proptest! {
        #[test]
        fn prop_converging_destinations_create_target_once(
            repeats in 1usize..5,
            existing in proptest::option::of(
                proptest::sample::select(TaskExecutionStatus::ALL.to_vec())
            ),
        ) {
            let source = (0..repeats).fold(TaskNode::new("a", "argo"), |node, _| node.then("x"));
            let def = WorkflowDefinition::new("wf", "1")
                .with_task(source)
                .with_task(TaskNode::new("x", "argo"));
            let mut instance = make_instance(&def, 0.0);
            if let Some(status) = existing {
                let mut x = TaskExecution::new(&instance, TaskId::new("x"), "argo", 60.0);
                x.set_status(status);
                instance.tasks.push(x);
            }
            let ctx = InstanceContext::new(&instance, &def);

            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let next = runtime
                .block_on(make_resolver().resolve(&def, &TaskId::new("a"), &ctx))
                .unwrap();
            let expected = usize::from(existing.map_or(true, |s| s == TaskExecutionStatus::Created));
            prop_assert_eq!(next.len(), expected);
        }
    }

    #[tokio::test]
    async fn test_malformed_condition_counts_as_false() {
        let def = WorkflowDefinition::new("wf", "1")
            .with_task(
                TaskNode::new("a", "argo")
                    .with_destination(TaskDestination::new("b").when("('a' == 'a'"))
                    .then("c"),
            )
            .with_task(TaskNode::new("b", "argo"))
            .with_task(TaskNode::new("c", "argo"));
        let instance = make_instance(&def, 0.9);
        let ctx = InstanceContext::new(&instance, &def);
        let resolver = make_resolver();

        let err = resolver
            .conditions_hold(&def.tasks[0].task_destinations[0], &ctx)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Condition(_)));
        assert_eq!(err.category(), workflow_types::ErrorCategory::Condition);
        assert!(!err.is_retryable());

        let next = resolver.resolve(&def, &TaskId::new("a"), &ctx).await.unwrap();
        let ids: Vec<&str> = next.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[tokio::test]
    async fn test_unknown_completed_task() {
        let def = make_definition();
        let instance = make_instance(&def, 0.9);
        let ctx = InstanceContext::new(&instance, &def);
        let err = make_resolver()
            .resolve(&def, &TaskId::new("zz"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::TaskNotInDefinition { .. }));
    }
}

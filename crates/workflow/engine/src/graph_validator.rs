//! Graph validation for workflow definitions
//!
//! Errors accumulate; no rule short-circuits another. A definition is valid
//! only when the report is empty.
//!
//! Cycle detection walks the destination graph with an explicit stack.
//! [`CycleCheck::AllBranches`] follows every destination of every node;
//! [`CycleCheck::FirstBranch`] follows only the first destination of each
//! node starting from the entry task, which accepts some cyclic graphs and
//! exists for compatibility with definitions validated that way.

use crate::config::ExecutionConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use workflow_dsl::{ContextRef, Parser, Template};
use workflow_types::{TaskId, WorkflowDefinition, WorkflowError, WorkflowResult};

/// Cycle detection strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleCheck {
    #[default]
    AllBranches,
    FirstBranch,
}

/// Accumulated validation errors
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn push(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn into_result(self) -> WorkflowResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(WorkflowError::InvalidDefinition(self.errors))
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

/// Validates workflow definitions before registration
#[derive(Clone, Debug)]
pub struct GraphValidator {
    cycle_check: CycleCheck,
    max_loop_depth: usize,
}

impl Default for GraphValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphValidator {
    pub fn new() -> Self {
        Self {
            cycle_check: CycleCheck::AllBranches,
            max_loop_depth: 100,
        }
    }

    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            cycle_check: config.cycle_check,
            max_loop_depth: config.max_loop_depth.max(1),
        }
    }

    pub fn with_cycle_check(mut self, cycle_check: CycleCheck) -> Self {
        self.cycle_check = cycle_check;
        self
    }

    pub fn with_max_loop_depth(mut self, depth: usize) -> Self {
        self.max_loop_depth = depth.max(1);
        self
    }

    /// Run every rule
    pub fn validate(&self, definition: &WorkflowDefinition) -> ValidationReport {
        let mut report = ValidationReport::default();
        self.check_header(definition, &mut report);
        self.check_tasks(definition, &mut report);
        self.check_graph(definition, &mut report);
        self.check_expressions(definition, &mut report);
        self.check_export_destinations(definition, &mut report);
        report
    }

    /// Destination references and cycles only
    pub fn validate_graph(&self, definition: &WorkflowDefinition) -> ValidationReport {
        let mut report = ValidationReport::default();
        self.check_graph(definition, &mut report);
        report
    }

    // ── Rules ────────────────────────────────────────────────────────

    fn check_header(&self, definition: &WorkflowDefinition, report: &mut ValidationReport) {
        if definition.name.trim().is_empty() {
            report.push("Missing Workflow Name.");
        }
        if definition.version.trim().is_empty() {
            report.push("Missing Workflow Version.");
        }
        if definition.tasks.is_empty() {
            report.push("Missing Workflow Tasks.");
        }
    }

    fn check_tasks(&self, definition: &WorkflowDefinition, report: &mut ValidationReport) {
        let mut seen = HashSet::new();
        for task in &definition.tasks {
            if !is_valid_task_id(task.id.as_str()) {
                report.push(format!(
                    "TaskId: \"{}\" contains invalid characters, only alphanumerics, '-' and '_' are allowed.",
                    task.id
                ));
            }
            if !seen.insert(&task.id) {
                report.push(format!("Found duplicate task id \"{}\".", task.id));
            }
            if task.task_type.trim().is_empty() {
                report.push(format!("Task: \"{}\" has no type.", task.id));
            }
        }

        let referenced: HashSet<&TaskId> = definition
            .tasks
            .iter()
            .flat_map(|t| t.task_destinations.iter().map(|d| &d.name))
            .collect();
        let orphans: Vec<&str> = definition
            .tasks
            .iter()
            .skip(1)
            .filter(|t| !referenced.contains(&t.id))
            .map(|t| t.id.as_str())
            .collect();
        if !orphans.is_empty() {
            report.push(format!(
                "Found Task(s) without any task destinations to it: {}",
                orphans.join(", ")
            ));
        }
    }

    fn check_graph(&self, definition: &WorkflowDefinition, report: &mut ValidationReport) {
        let mut index: HashMap<&TaskId, usize> = HashMap::new();
        for (i, task) in definition.tasks.iter().enumerate() {
            index.entry(&task.id).or_insert(i);
        }

        for task in &definition.tasks {
            for dest in &task.task_destinations {
                if !index.contains_key(&dest.name) {
                    report.push(format!(
                        "Task: \"{}\" has task destination: \"{}\" that could not be found.",
                        task.id, dest.name
                    ));
                }
            }
        }

        self.check_cycles(definition, &index, report);
    }

    fn check_cycles(
        &self,
        definition: &WorkflowDefinition,
        index: &HashMap<&TaskId, usize>,
        report: &mut ValidationReport,
    ) {
        let tasks = &definition.tasks;
        let mut marks = vec![Mark::Unvisited; tasks.len()];
        let roots: Vec<usize> = match self.cycle_check {
            CycleCheck::FirstBranch => (0..tasks.len().min(1)).collect(),
            CycleCheck::AllBranches => (0..tasks.len()).collect(),
        };

        for root in roots {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            // (node, next destination to follow)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::OnPath;

            while let Some(frame) = stack.last_mut() {
                let (node, next) = *frame;
                let destinations = &tasks[node].task_destinations;
                let limit = match self.cycle_check {
                    CycleCheck::FirstBranch => destinations.len().min(1),
                    CycleCheck::AllBranches => destinations.len(),
                };

                if next >= limit {
                    marks[node] = Mark::Done;
                    stack.pop();
                    continue;
                }
                frame.1 += 1;

                let target = match index.get(&destinations[next].name) {
                    Some(&t) => t,
                    None => continue,
                };

                match marks[target] {
                    Mark::OnPath => {
                        let mut path: Vec<&str> =
                            stack.iter().map(|(n, _)| tasks[*n].id.as_str()).collect();
                        path.push(tasks[target].id.as_str());
                        report.push(format!(
                            "Detected task convergence on path: {} => ∞",
                            path.join(" => ")
                        ));
                    }
                    Mark::Unvisited if stack.len() >= self.max_loop_depth => {
                        report.push(format!(
                            "Detected path longer than {} tasks starting at \"{}\".",
                            self.max_loop_depth, tasks[root].id
                        ));
                        return;
                    }
                    Mark::Unvisited => {
                        marks[target] = Mark::OnPath;
                        stack.push((target, 0));
                    }
                    Mark::Done => {}
                }
            }
        }
    }

    fn check_expressions(&self, definition: &WorkflowDefinition, report: &mut ValidationReport) {
        let task_ids: BTreeSet<&str> = definition.tasks.iter().map(|t| t.id.as_str()).collect();
        let check_refs = |owner: &TaskId, refs: &[&ContextRef], report: &mut ValidationReport| {
            for r in refs {
                if let ContextRef::Execution { task, .. } = r {
                    if !task_ids.contains(task.as_str()) {
                        report.push(format!(
                            "Task: \"{}\" references unknown task \"{}\" in \"{}\".",
                            owner, task, r
                        ));
                    }
                }
            }
        };

        for task in &definition.tasks {
            for dest in &task.task_destinations {
                for condition in dest.conditions.iter().filter(|c| !c.trim().is_empty()) {
                    match Parser::parse(condition) {
                        Ok(expr) => check_refs(&task.id, &expr.references(), report),
                        Err(e) => report.push(format!(
                            "Invalid condition \"{}\" on destination \"{}\" of task \"{}\": {}",
                            condition, dest.name, task.id, e
                        )),
                    }
                }
            }

            let templates = task
                .args
                .iter()
                .map(|(k, v)| (format!("argument \"{}\"", k), v))
                .chain(
                    task.artifacts
                        .input
                        .iter()
                        .chain(task.artifacts.output.iter())
                        .map(|a| (format!("artifact \"{}\"", a.name), &a.value)),
                );
            for (what, text) in templates {
                match Template::parse(text) {
                    Ok(template) => {
                        let refs: Vec<&ContextRef> = template
                            .segments()
                            .iter()
                            .filter_map(|s| match s {
                                workflow_dsl::Segment::Reference(r) => Some(r),
                                workflow_dsl::Segment::Text(_) => None,
                            })
                            .collect();
                        check_refs(&task.id, &refs, report);
                    }
                    Err(e) => report.push(format!(
                        "Invalid {} of task \"{}\": {}",
                        what, task.id, e
                    )),
                }
            }
        }
    }

    fn check_export_destinations(
        &self,
        definition: &WorkflowDefinition,
        report: &mut ValidationReport,
    ) {
        for task in &definition.tasks {
            for dest in &task.export_destinations {
                if !definition.allows_export_to(&dest.name) {
                    report.push(format!(
                        "Task: \"{}\" export destination: \"{}\" must be registered in the informatics gateway.",
                        task.id, dest.name
                    ));
                }
            }
        }
    }
}

fn is_valid_task_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_types::{Artifact, TaskDestination, TaskNode};

    fn make_linear() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "1")
            .with_task(TaskNode::new("a", "argo").then("b"))
            .with_task(TaskNode::new("b", "argo"))
    }

    #[test]
    fn test_valid_linear_definition() {
        let report = GraphValidator::new().validate(&make_linear());
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn test_dangling_destination_accumulates() {
        let def = WorkflowDefinition::new("wf", "1")
            .with_task(TaskNode::new("a", "argo").then("x").then("y"));
        let report = GraphValidator::new().validate_graph(&def);
        assert_eq!(report.errors.len(), 2);
        assert_eq!(
            report.errors[0],
            "Task: \"a\" has task destination: \"x\" that could not be found."
        );
    }

    #[test]
    fn test_direct_cycle_rejected() {
        let def = WorkflowDefinition::new("wf", "1")
            .with_task(TaskNode::new("a", "argo").then("b"))
            .with_task(TaskNode::new("b", "argo").then("a"));
        let report = GraphValidator::new().validate(&def);
        assert!(!report.is_valid());
        assert!(report
            .errors
            .contains(&"Detected task convergence on path: a => b => a => ∞".to_string()));
    }

    #[test]
    fn test_cycle_through_second_branch() {
        let def = WorkflowDefinition::new("wf", "1")
            .with_task(TaskNode::new("a", "argo").then("b").then("c"))
            .with_task(TaskNode::new("b", "argo"))
            .with_task(TaskNode::new("c", "argo").then("a"));

        let all = GraphValidator::new().validate_graph(&def);
        assert_eq!(all.errors.len(), 1);
        assert!(all.errors[0].contains("a => c => a"));

        let first = GraphValidator::new()
            .with_cycle_check(CycleCheck::FirstBranch)
            .validate_graph(&def);
        assert!(first.is_valid());
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let def = WorkflowDefinition::new("wf", "1")
            .with_task(TaskNode::new("a", "argo").then("b").then("c"))
            .with_task(TaskNode::new("b", "argo").then("d"))
            .with_task(TaskNode::new("c", "argo").then("d"))
            .with_task(TaskNode::new("d", "argo"));
        assert!(GraphValidator::new().validate(&def).is_valid());
    }

    #[test]
    fn test_self_loop() {
        let def =
            WorkflowDefinition::new("wf", "1").with_task(TaskNode::new("a", "argo").then("a"));
        let report = GraphValidator::new().validate_graph(&def);
        assert_eq!(
            report.errors,
            vec!["Detected task convergence on path: a => a => ∞".to_string()]
        );
    }

    #[test]
    fn test_max_loop_depth() {
        let mut def = WorkflowDefinition::new("wf", "1");
        for i in 0..5 {
            def = def.with_task(TaskNode::new(format!("t{}", i), "argo").then(format!("t{}", i + 1)));
        }
        def = def.with_task(TaskNode::new("t5", "argo"));
        let report = GraphValidator::new()
            .with_max_loop_depth(3)
            .validate_graph(&def);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("longer than 3"));
    }

    #[test]
    fn test_header_and_task_rules() {
        let def = WorkflowDefinition::new("", "")
            .with_task(TaskNode::new("a b", "argo").then("c"))
            .with_task(TaskNode::new("c", ""))
            .with_task(TaskNode::new("c", "argo"))
            .with_task(TaskNode::new("orphan", "argo"));
        let errors = GraphValidator::new().validate(&def).errors;
        assert!(errors.contains(&"Missing Workflow Name.".to_string()));
        assert!(errors.contains(&"Missing Workflow Version.".to_string()));
        assert!(errors.iter().any(|e| e.contains("invalid characters")));
        assert!(errors.iter().any(|e| e.contains("duplicate task id \"c\"")));
        assert!(errors.iter().any(|e| e.contains("has no type")));
        assert!(errors
            .iter()
            .any(|e| e == "Found Task(s) without any task destinations to it: orphan"));
    }

    #[test]
    fn test_invalid_condition_and_unknown_reference() {
        let def = WorkflowDefinition::new("wf", "1")
            .with_task(
                TaskNode::new("a", "argo")
                    .with_destination(TaskDestination::new("b").when("'a' = 'b'"))
                    .with_destination(
                        TaskDestination::new("b")
                            .when("{{ context.executions.ghost.status }} == 'Succeeded'"),
                    ),
            )
            .with_task(
                TaskNode::new("b", "argo")
                    .with_input(Artifact::new("in", "{{ context.executions.nope.artifacts.x }}")),
            );
        let errors = GraphValidator::new().validate(&def).errors;
        assert!(errors.iter().any(|e| e.starts_with("Invalid condition")));
        assert_eq!(
            errors
                .iter()
                .filter(|e| e.contains("references unknown task"))
                .count(),
            2
        );
    }

    #[test]
    fn test_export_destinations_must_be_registered() {
        let def = WorkflowDefinition::new("wf", "1")
            .with_export_destination("PACS")
            .with_task(
                TaskNode::new("a", "argo")
                    .with_export_destination("PACS")
                    .with_export_destination("ORTHANC"),
            );
        let errors = GraphValidator::new().validate(&def).errors;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("ORTHANC"));
    }

    #[test]
    fn test_report_into_result() {
        let report = ValidationReport {
            errors: vec!["x".into()],
        };
        assert!(matches!(
            report.into_result(),
            Err(WorkflowError::InvalidDefinition(e)) if e == vec!["x".to_string()]
        ));
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step dependency graph and ready-set computation.
//!
//! Edges come from `depends_on` plus two implicit sources: the sub-steps a
//! `parallel` step lists in `config.steps`, and the branches a `decision`
//! step lists in `config.if_true` / `config.if_false`. Both make the listed
//! steps depend on the fan-out node.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use super::condition;
use super::definition::{StepType, WorkflowDefinition};
use super::execution::{StepStatus, WorkflowExecution};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Gray,
    Black,
}

/// Adjacency lists keyed by step id.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// step -> steps it waits for
    dependencies: BTreeMap<String, BTreeSet<String>>,
    /// step -> steps waiting for it
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Build the graph for a definition, including implicit fan-out edges.
    ///
    /// References to unknown steps are kept so that validation can report
    /// them; they never produce cycles.
    pub fn from_definition(definition: &WorkflowDefinition) -> Self {
        let mut graph = Self::default();
        for step in &definition.steps {
            graph.dependencies.entry(step.id.clone()).or_default();
            graph.dependents.entry(step.id.clone()).or_default();
        }
        for step in &definition.steps {
            for dep in &step.depends_on {
                graph.add_edge(dep, &step.id);
            }
            for child in step.child_refs() {
                graph.add_edge(&step.id, &child);
            }
        }
        graph
    }

    /// `step` waits for `dependency`.
    pub fn add_edge(&mut self, dependency: &str, step: &str) {
        self.dependencies
            .entry(step.to_string())
            .or_default()
            .insert(dependency.to_string());
        self.dependents
            .entry(dependency.to_string())
            .or_default()
            .insert(step.to_string());
    }

    pub fn dependencies_of(&self, step_id: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(step_id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn dependents_of(&self, step_id: &str) -> impl Iterator<Item = &str> {
        self.dependents
            .get(step_id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Depth-first search with recursion-stack colouring.
    ///
    /// Returns the cycle path (first node repeated at the end) if one exists.
    pub fn detect_cycles(&self) -> Result<(), Vec<String>> {
        let mut colour: BTreeMap<&str, Colour> = self
            .dependencies
            .keys()
            .map(|k| (k.as_str(), Colour::White))
            .collect();
        let mut path = Vec::new();

        let roots: Vec<&str> = self.dependencies.keys().map(String::as_str).collect();
        for node in roots {
            if colour.get(node) == Some(&Colour::White) {
                self.visit(node, &mut colour, &mut path)?;
            }
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        colour: &mut BTreeMap<&'a str, Colour>,
        path: &mut Vec<&'a str>,
    ) -> Result<(), Vec<String>> {
        colour.insert(node, Colour::Gray);
        path.push(node);

        for next in self.dependencies_of(node) {
            match colour.get(next).copied() {
                Some(Colour::Gray) => {
                    let start = path.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(next.to_string());
                    return Err(cycle);
                }
                Some(Colour::White) => self.visit(next, colour, path)?,
                // unknown ids and finished nodes
                _ => {}
            }
        }

        path.pop();
        colour.insert(node, Colour::Black);
        Ok(())
    }

    /// Steps in an order where every step follows its dependencies.
    /// Ties are broken by step id.
    pub fn topological_order(&self) -> Result<Vec<String>, Vec<String>> {
        self.detect_cycles()?;

        let mut remaining: BTreeMap<&str, usize> = self
            .dependencies
            .iter()
            .map(|(id, deps)| {
                let known = deps
                    .iter()
                    .filter(|d| self.dependencies.contains_key(*d))
                    .count();
                (id.as_str(), known)
            })
            .collect();
        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(remaining.len());
        while let Some(id) = ready.pop_first() {
            order.push(id.to_string());
            for dependent in self.dependents_of(id) {
                if let Some(n) = remaining.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }
        Ok(order)
    }

    /// Human-readable cycle description.
    pub fn format_cycle(cycle: &[String]) -> String {
        format!("Circular dependency detected: {}", cycle.join(" → "))
    }
}

/// A pending step that can never run because a dependency failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedStep {
    pub step_id: String,
    /// The failed dependency.
    pub dependency: String,
}

/// A pending step that resolves as COMPLETED without running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedStep {
    pub step_id: String,
    pub reason: String,
}

/// Outcome of one resolution pass over an execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Pending steps whose dependencies are all resolved.
    pub ready: Vec<String>,
    /// Pending steps with a dependency that failed without continue-on-error.
    pub blocked: Vec<BlockedStep>,
    /// Pending steps to complete as skipped.
    pub skipped: Vec<SkippedStep>,
}

impl Resolution {
    /// Nothing to dispatch and nothing to resolve.
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.blocked.is_empty() && self.skipped.is_empty()
    }
}

/// Computes ready, blocked and skipped sets for an execution.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    graph: DependencyGraph,
}

impl DependencyResolver {
    pub fn new(definition: &WorkflowDefinition) -> Self {
        Self {
            graph: DependencyGraph::from_definition(definition),
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Classify every PENDING step of `execution`.
    ///
    /// A dependency is satisfied when it is COMPLETED, or FAILED on a step
    /// that continues on error. Steps are reported in definition order.
    pub fn resolve(&self, execution: &WorkflowExecution, variables: &Value) -> Resolution {
        let definition = &execution.definition;
        let mut resolution = Resolution::default();

        for record in execution
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
        {
            let Some(step) = definition.step(&record.step_id) else {
                continue;
            };

            let mut waiting = false;
            let mut blocked_on = None;
            let mut deps = 0usize;
            let mut skipped_deps = 0usize;
            let mut unchosen_by = None;

            for dep_id in self.graph.dependencies_of(&step.id) {
                let Some(dep) = execution.step(dep_id) else {
                    continue;
                };
                deps += 1;
                match dep.status {
                    StepStatus::Pending | StepStatus::Running => waiting = true,
                    StepStatus::Failed => {
                        let tolerated = definition
                            .step(dep_id)
                            .is_some_and(|d| d.continue_on_error);
                        if !tolerated && blocked_on.is_none() {
                            blocked_on = Some(dep_id.to_string());
                        }
                    }
                    StepStatus::Completed => {
                        if dep.skipped {
                            skipped_deps += 1;
                        } else if branch_not_taken(dep.output.as_ref(), &step.id) {
                            unchosen_by = Some(dep_id.to_string());
                        }
                    }
                }
            }

            if let Some(dependency) = blocked_on {
                resolution.blocked.push(BlockedStep {
                    step_id: step.id.clone(),
                    dependency,
                });
                continue;
            }
            if waiting {
                continue;
            }

            if let Some(decision) = unchosen_by {
                resolution.skipped.push(SkippedStep {
                    step_id: step.id.clone(),
                    reason: format!("branch not taken by '{}'", decision),
                });
            } else if deps > 0 && skipped_deps == deps {
                resolution.skipped.push(SkippedStep {
                    step_id: step.id.clone(),
                    reason: "all dependencies skipped".to_string(),
                });
            } else if step.step_type != StepType::Decision
                && step
                    .condition
                    .as_ref()
                    .is_some_and(|c| !condition::evaluate(c, variables))
            {
                resolution.skipped.push(SkippedStep {
                    step_id: step.id.clone(),
                    reason: "condition is false".to_string(),
                });
            } else {
                resolution.ready.push(step.id.clone());
            }
        }

        resolution
    }
}

/// A completed decision step lists the branch steps it did not select
/// under `output.skipped`.
fn branch_not_taken(output: Option<&Value>, step_id: &str) -> bool {
    output
        .and_then(|o| o.get("skipped"))
        .and_then(Value::as_array)
        .is_some_and(|ids| ids.iter().any(|id| id.as_str() == Some(step_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::WorkflowStep;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn shell(id: &str) -> WorkflowStep {
        WorkflowStep::new(id, StepType::Shell)
    }

    fn execution(steps: Vec<WorkflowStep>) -> WorkflowExecution {
        let def = WorkflowDefinition::new("t", steps);
        WorkflowExecution::new(&def, BTreeMap::new(), Utc::now())
    }

    fn finish(exec: &mut WorkflowExecution, id: &str, ok: bool) {
        let now = Utc::now();
        let step = exec.step_mut(id).unwrap();
        step.start(now, Value::Null);
        if ok {
            step.complete(now, json!({}));
        } else {
            step.fail(now, "boom");
        }
    }

    fn resolve(exec: &WorkflowExecution) -> Resolution {
        DependencyResolver::new(&exec.definition).resolve(exec, &exec.variables())
    }

    #[test]
    fn test_fan_out_after_root_completes() {
        let mut exec = execution(vec![
            shell("a"),
            shell("b").depends_on(["a"]),
            shell("c").depends_on(["a"]),
        ]);
        assert_eq!(resolve(&exec).ready, vec!["a"]);

        finish(&mut exec, "a", true);
        let res = resolve(&exec);
        assert_eq!(res.ready, vec!["b", "c"]);
        assert!(!res.ready.contains(&"a".to_string()));
    }

    #[test]
    fn test_running_dependency_keeps_dependent_waiting() {
        let mut exec = execution(vec![shell("a"), shell("b").depends_on(["a"])]);
        exec.step_mut("a").unwrap().start(Utc::now(), Value::Null);
        assert!(resolve(&exec).is_idle());
    }

    #[test]
    fn test_failed_dependency_blocks() {
        let mut exec = execution(vec![shell("a"), shell("b").depends_on(["a"])]);
        finish(&mut exec, "a", false);
        let res = resolve(&exec);
        assert!(res.ready.is_empty());
        assert_eq!(
            res.blocked,
            vec![BlockedStep {
                step_id: "b".into(),
                dependency: "a".into()
            }]
        );
    }

    #[test]
    fn test_continue_on_error_satisfies_dependency() {
        let mut exec = execution(vec![
            shell("a").continue_on_error(),
            shell("b").depends_on(["a"]),
        ]);
        finish(&mut exec, "a", false);
        assert_eq!(resolve(&exec).ready, vec!["b"]);
    }

    #[test]
    fn test_false_condition_skips() {
        let mut exec = execution(vec![
            shell("a"),
            shell("b").depends_on(["a"]).with_condition(json!("flags.deploy")),
        ]);
        finish(&mut exec, "a", true);
        let res = resolve(&exec);
        assert!(res.ready.is_empty());
        assert_eq!(res.skipped[0].step_id, "b");
    }

    #[test]
    fn test_skips_cascade_through_skipped_dependencies() {
        let mut exec = execution(vec![shell("a"), shell("b").depends_on(["a"])]);
        exec.step_mut("a").unwrap().skip(Utc::now(), "test");
        assert_eq!(resolve(&exec).skipped[0].step_id, "b");
    }

    #[test]
    fn test_unchosen_branch_skipped() {
        let mut exec = execution(vec![
            WorkflowStep::new("d", StepType::Decision)
                .with_config(json!({"if_true": "yes", "if_false": "no"})),
            shell("yes"),
            shell("no"),
        ]);
        let now = Utc::now();
        let d = exec.step_mut("d").unwrap();
        d.start(now, Value::Null);
        d.complete(now, json!({"result": true, "selected": ["yes"], "skipped": ["no"]}));

        let res = resolve(&exec);
        assert_eq!(res.ready, vec!["yes"]);
        assert_eq!(res.skipped[0].step_id, "no");
    }

    #[test]
    fn test_parallel_children_depend_on_group() {
        let exec = execution(vec![
            WorkflowStep::new("p", StepType::Parallel).with_config(json!({"steps": ["x", "y"]})),
            shell("x"),
            shell("y"),
        ]);
        assert_eq!(resolve(&exec).ready, vec!["p"]);
    }

    #[test]
    fn test_topological_order() {
        let def = WorkflowDefinition::new(
            "t",
            vec![
                shell("d").depends_on(["b", "c"]),
                shell("c").depends_on(["a"]),
                shell("b").depends_on(["a"]),
                shell("a"),
            ],
        );
        let order = DependencyGraph::from_definition(&def)
            .topological_order()
            .unwrap();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_cycle_path_reported() {
        let def = WorkflowDefinition::new(
            "t",
            vec![shell("a").depends_on(["b"]), shell("b").depends_on(["a"])],
        );
        let cycle = DependencyGraph::from_definition(&def)
            .detect_cycles()
            .unwrap_err();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 3);
        assert!(DependencyGraph::format_cycle(&cycle).contains("a → b → a"));
    }
}

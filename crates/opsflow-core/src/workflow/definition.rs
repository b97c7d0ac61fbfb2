// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions.
//!
//! A definition is a named, versioned DAG of [`WorkflowStep`]s. It carries no
//! execution state; executions take a snapshot of it when they are created.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};

use super::dependency::DependencyGraph;

/// Kind of a workflow step.
///
/// `parallel`, `decision` and `workflow` are handled by the orchestrator
/// itself. Every other kind is dispatched to a registered executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Shell,
    Http,
    Metric,
    Ai,
    Plugin,
    Task,
    Parallel,
    Decision,
    Workflow,
}

impl StepType {
    /// Wire name of this step type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Http => "http",
            Self::Metric => "metric",
            Self::Ai => "ai",
            Self::Plugin => "plugin",
            Self::Task => "task",
            Self::Parallel => "parallel",
            Self::Decision => "decision",
            Self::Workflow => "workflow",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of a workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the definition.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Step kind.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Opaque executor configuration.
    #[serde(default)]
    pub config: Value,
    /// Ids of steps that must resolve before this one runs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Predicate over execution variables. A false condition skips the step;
    /// for `decision` steps it selects the branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
    /// Per-attempt timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Retries after the first attempt. `None` inherits the definition's `max_retries`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Pause between attempts.
    #[serde(default)]
    pub retry_delay_ms: u64,
    /// Let dependents run even if this step fails.
    #[serde(default)]
    pub continue_on_error: bool,
}

impl WorkflowStep {
    /// Step with the given id and type; the name defaults to the id.
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type,
            config: Value::Null,
            depends_on: Vec::new(),
            condition: None,
            timeout_ms: None,
            retries: None,
            retry_delay_ms: 0,
            continue_on_error: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_condition(mut self, condition: Value) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retries(mut self, retries: u32, retry_delay_ms: u64) -> Self {
        self.retries = Some(retries);
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    /// Step ids named in `config[key]` (a string or an array of strings).
    pub(crate) fn config_refs(&self, key: &str) -> Vec<String> {
        match self.config.get(key) {
            Some(Value::String(id)) => vec![id.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Steps this node fans out to or selects between.
    pub(crate) fn child_refs(&self) -> Vec<String> {
        match self.step_type {
            StepType::Parallel => self.config_refs("steps"),
            StepType::Decision => {
                let mut refs = self.config_refs("if_true");
                refs.extend(self.config_refs("if_false"));
                refs
            }
            _ => Vec::new(),
        }
    }
}

/// A named, versioned DAG of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    /// Unique across definitions.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Starts at 1 and increases on every update.
    #[serde(default = "default_version")]
    pub version: i32,
    pub steps: Vec<WorkflowStep>,
    /// Defaults for execution variables; overridden by execution input.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Wall-clock bound for a whole execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Retry budget for steps that do not set their own.
    #[serde(default)]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> i32 {
    1
}

impl WorkflowDefinition {
    /// New unsaved definition. The id is assigned on registration.
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: name.into(),
            description: String::new(),
            version: 1,
            steps,
            variables: BTreeMap::new(),
            env: BTreeMap::new(),
            timeout_ms: None,
            max_retries: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Effective retry budget of a step.
    pub fn retries_for(&self, step: &WorkflowStep) -> u32 {
        step.retries.unwrap_or(self.max_retries)
    }

    /// Check structure and acyclicity.
    ///
    /// # Errors
    ///
    /// `ValidationError` for an empty name, no steps, empty or duplicate
    /// step ids, self-dependencies, references to unknown steps, or a
    /// dependency cycle.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::validation("name", "must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(CoreError::validation("steps", "workflow has no steps"));
        }

        let mut ids = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(CoreError::validation("steps.id", "step id must not be empty"));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(CoreError::validation(
                    "steps.id",
                    format!("duplicate step id '{}'", step.id),
                ));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(CoreError::validation(
                        "depends_on",
                        format!("step '{}' depends on itself", step.id),
                    ));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(CoreError::validation(
                        "depends_on",
                        format!("step '{}' depends on unknown step '{}'", step.id, dep),
                    ));
                }
            }
            for child in step.child_refs() {
                if child == step.id || !ids.contains(child.as_str()) {
                    return Err(CoreError::validation(
                        "config",
                        format!(
                            "{} step '{}' references unknown step '{}'",
                            step.step_type, step.id, child
                        ),
                    ));
                }
            }
        }

        let graph = DependencyGraph::from_definition(self);
        if let Err(cycle) = graph.detect_cycles() {
            return Err(CoreError::validation(
                "depends_on",
                DependencyGraph::format_cycle(&cycle),
            ));
        }

        Ok(())
    }

    /// Content hash of the definition, independent of id, version and timestamps.
    ///
    /// Map keys are serialized in sorted order so equal definitions always
    /// hash the same.
    pub fn fingerprint(&self) -> Result<String> {
        let mut doc = serde_json::to_value(self)?;
        if let Some(obj) = doc.as_object_mut() {
            for key in ["id", "version", "created_at", "updated_at"] {
                obj.remove(key);
            }
        }
        let canonical = serde_json::to_vec(&doc)?;
        Ok(format!("{:x}", Sha256::digest(&canonical)))
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow execution records.
//!
//! ```text
//!   PENDING ──start──► RUNNING ──┬──► COMPLETED
//!                       ▲   │    ├──► FAILED
//!               resume  │   │    └──► CANCELLED
//!                       │   ▼ pause
//!                       PAUSED
//! ```
//!
//! A [`WorkflowExecution`] owns one [`StepExecution`] per step of the
//! definition snapshot it was created from. Step records only move forward:
//! PENDING → RUNNING → {COMPLETED, FAILED}, or PENDING → COMPLETED (skipped)
//! and PENDING → FAILED (blocked).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CoreError, Result};

use super::definition::WorkflowDefinition;

/// Version tag written into every checkpoint blob.
pub const CHECKPOINT_FORMAT: u32 = 1;

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }

    /// COMPLETED, FAILED or CANCELLED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run record of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    pub step_name: String,
    pub status: StepStatus,
    /// Variables the step was dispatched with.
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failed attempts that were retried.
    #[serde(default)]
    pub retry_count: u32,
    /// COMPLETED without running (unchosen branch or false condition).
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// One line per attempt and per state change.
    #[serde(default)]
    pub logs: Vec<String>,
    /// Queue task a `task` step waits on. Kept across retries and recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl StepExecution {
    pub fn new(step_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            step_name: step_name.into(),
            status: StepStatus::Pending,
            input: Value::Null,
            output: None,
            error: None,
            retry_count: 0,
            skipped: false,
            started_at: None,
            completed_at: None,
            logs: Vec::new(),
            task_id: None,
        }
    }

    /// PENDING → RUNNING. Returns false if the step was not pending.
    pub fn start(&mut self, now: DateTime<Utc>, input: Value) -> bool {
        if self.status != StepStatus::Pending {
            return false;
        }
        self.status = StepStatus::Running;
        self.started_at = Some(now);
        self.input = input;
        self.logs.push(format!("{} started", now.to_rfc3339()));
        true
    }

    /// RUNNING → COMPLETED.
    pub fn complete(&mut self, now: DateTime<Utc>, output: Value) -> bool {
        if self.status != StepStatus::Running {
            return false;
        }
        self.status = StepStatus::Completed;
        self.output = Some(output);
        self.error = None;
        self.completed_at = Some(now);
        self.logs.push(format!("{} completed", now.to_rfc3339()));
        true
    }

    /// PENDING or RUNNING → FAILED.
    pub fn fail(&mut self, now: DateTime<Utc>, error: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let error = error.into();
        self.logs
            .push(format!("{} failed: {}", now.to_rfc3339(), error));
        self.status = StepStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(now);
        true
    }

    /// PENDING → COMPLETED without running.
    pub fn skip(&mut self, now: DateTime<Utc>, reason: &str) -> bool {
        if self.status != StepStatus::Pending {
            return false;
        }
        self.status = StepStatus::Completed;
        self.skipped = true;
        self.completed_at = Some(now);
        self.logs
            .push(format!("{} skipped: {}", now.to_rfc3339(), reason));
        true
    }

    /// Put a step that was RUNNING when the process died back to PENDING.
    pub(crate) fn reset_interrupted(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != StepStatus::Running {
            return false;
        }
        self.status = StepStatus::Pending;
        self.started_at = None;
        self.logs
            .push(format!("{} interrupted, rescheduled", now.to_rfc3339()));
        true
    }
}

/// One run of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    /// Name of the definition at creation time.
    pub workflow_name: String,
    pub workflow_version: i32,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub input: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Snapshot of the definition this execution runs.
    pub definition: WorkflowDefinition,
    pub steps: Vec<StepExecution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    /// Sub-workflow nesting level, 0 for top-level executions.
    #[serde(default)]
    pub depth: u32,
    /// Last persisted checkpoint, as loaded from the store.
    #[serde(skip)]
    pub checkpoint: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct CheckpointEnvelope<T> {
    format: u32,
    execution: T,
}

impl WorkflowExecution {
    /// New PENDING execution with one pending record per definition step.
    pub fn new(
        definition: &WorkflowDefinition,
        input: BTreeMap<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let steps = definition
            .steps
            .iter()
            .map(|s| StepExecution::new(s.id.clone(), s.name.clone()))
            .collect();

        Self {
            id: Uuid::now_v7().to_string(),
            workflow_id: definition.id.clone(),
            workflow_name: definition.name.clone(),
            workflow_version: definition.version,
            status: ExecutionStatus::Pending,
            input,
            output: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            definition: definition.clone(),
            steps,
            parent_execution_id: None,
            depth: 0,
            checkpoint: None,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepExecution> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Variables visible to steps and conditions.
    ///
    /// Definition `variables` overlaid with `input`, plus `env` and the
    /// outputs of completed steps under `steps.<id>`.
    pub fn variables(&self) -> Value {
        let mut vars: Map<String, Value> = self
            .definition
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in &self.input {
            vars.insert(k.clone(), v.clone());
        }

        let env: Map<String, Value> = self
            .definition
            .env
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        vars.insert("env".to_string(), Value::Object(env));

        let steps: Map<String, Value> = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed && !s.skipped)
            .map(|s| (s.step_id.clone(), s.output.clone().unwrap_or(Value::Null)))
            .collect();
        vars.insert("steps".to_string(), Value::Object(steps));

        Value::Object(vars)
    }

    /// Every step is COMPLETED or FAILED.
    pub fn all_steps_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    /// The FAILED step, not continuing on error, that decides the execution error.
    ///
    /// Steps that actually ran win over steps failed only because a
    /// dependency failed; ties go to definition order.
    pub fn blocking_failure(&self) -> Option<&StepExecution> {
        let blocking = |s: &&StepExecution| {
            s.status == StepStatus::Failed
                && !self
                    .definition
                    .step(&s.step_id)
                    .is_some_and(|d| d.continue_on_error)
        };
        self.steps
            .iter()
            .filter(blocking)
            .find(|s| s.started_at.is_some())
            .or_else(|| self.steps.iter().find(blocking))
    }

    /// Serialize the execution into a checkpoint blob.
    pub fn to_checkpoint(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&CheckpointEnvelope {
            format: CHECKPOINT_FORMAT,
            execution: self,
        })
        .map_err(|e| CoreError::Checkpoint {
            execution_id: self.id.clone(),
            reason: e.to_string(),
        })
    }

    /// Restore an execution from a checkpoint blob.
    pub fn from_checkpoint(execution_id: &str, bytes: &[u8]) -> Result<Self> {
        let envelope: CheckpointEnvelope<WorkflowExecution> = serde_json::from_slice(bytes)
            .map_err(|e| CoreError::Checkpoint {
                execution_id: execution_id.to_string(),
                reason: e.to_string(),
            })?;
        if envelope.format != CHECKPOINT_FORMAT {
            return Err(CoreError::Checkpoint {
                execution_id: execution_id.to_string(),
                reason: format!("unsupported checkpoint format {}", envelope.format),
            });
        }
        let mut execution = envelope.execution;
        execution.checkpoint = Some(bytes.to_vec());
        Ok(execution)
    }
}

/// Filter for listing executions. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<i64>,
    pub offset: i64,
}

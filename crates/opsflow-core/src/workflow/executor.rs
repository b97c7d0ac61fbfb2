// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step executor interface and the registry the orchestrator dispatches through.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::task::{NewTask, Task, TaskQueue, TaskStatus};

use super::definition::StepType;

/// Records the queue task a step waits on in the step's execution record.
#[async_trait]
pub trait TaskTracker: Send + Sync {
    /// Persist `task_id` before the step starts waiting on it.
    async fn track(&self, task_id: &str) -> Result<(), StepError>;
}

/// Per-attempt context handed to an executor.
#[derive(Clone)]
pub struct StepContext {
    pub execution_id: String,
    pub step_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Fires when the execution is cancelled or times out.
    pub cancellation: CancellationToken,
    /// Queue task recorded by an earlier attempt or before a crash.
    pub task_id: Option<String>,
    pub tracker: Option<Arc<dyn TaskTracker>>,
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("execution_id", &self.execution_id)
            .field("step_id", &self.step_id)
            .field("attempt", &self.attempt)
            .field("task_id", &self.task_id)
            .field("tracker", &self.tracker.as_ref().map(|_| "..."))
            .finish()
    }
}

impl StepContext {
    /// Context without a recorded task or tracker.
    pub fn new(
        execution_id: impl Into<String>,
        step_id: impl Into<String>,
        attempt: u32,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            step_id: step_id.into(),
            attempt,
            cancellation,
            task_id: None,
            tracker: None,
        }
    }
}

/// Failure reported by a step executor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    /// May succeed on retry.
    #[error("{0}")]
    Transient(String),
    /// Retrying will not help.
    #[error("{0}")]
    Permanent(String),
    #[error("step timed out after {0:?}")]
    Timeout(Duration),
    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    /// Whether the failure consumes a retry and is attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Executes steps of one kind.
///
/// Implementations must return promptly with [`StepError::Cancelled`] once
/// `ctx.cancellation` fires.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: &StepContext,
        config: &Value,
        variables: &Value,
    ) -> Result<Value, StepError>;

    /// Called once a step has failed for good so that outside work started
    /// for it can be settled. `ctx.task_id` is the last task the step recorded.
    async fn abandon(&self, _ctx: &StepContext, _config: &Value) {}
}

/// Executors keyed by step type.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<StepType, Arc<dyn StepExecutor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.executors.keys().map(StepType::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("ExecutorRegistry")
            .field("step_types", &kinds)
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executor for `step_type`.
    pub fn register(&mut self, step_type: StepType, executor: Arc<dyn StepExecutor>) -> &mut Self {
        self.executors.insert(step_type, executor);
        self
    }

    pub fn with(mut self, step_type: StepType, executor: Arc<dyn StepExecutor>) -> Self {
        self.register(step_type, executor);
        self
    }

    pub fn get(&self, step_type: StepType) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(&step_type).cloned()
    }
}

#[derive(Debug, Deserialize)]
struct TaskStepConfig {
    task_type: String,
    #[serde(default)]
    payload: BTreeMap<String, Value>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    max_retries: Option<i32>,
}

/// Runs a `task` step by enqueuing a task and waiting for it to finish.
///
/// Config: `{"task_type": "...", "payload": {...}, "priority": 0, "max_retries": 3}`.
/// A DEAD or FAILED task fails the step permanently.
///
/// The enqueued task id is recorded through [`StepContext::tracker`] before
/// polling starts. Later attempts and recovered executions poll the recorded
/// task instead of enqueuing a new one. A step that is abandoned removes its
/// task if no worker has claimed it yet and fails it otherwise.
pub struct TaskStepExecutor {
    queue: Arc<TaskQueue>,
    poll_interval: Duration,
}

impl TaskStepExecutor {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self {
            queue,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The task recorded for this step, if it still exists.
    async fn recorded(&self, ctx: &StepContext) -> Result<Option<Task>, StepError> {
        let Some(task_id) = ctx.task_id.as_deref() else {
            return Ok(None);
        };
        match self.queue.get(task_id).await {
            Ok(task) => {
                debug!(
                    execution_id = %ctx.execution_id,
                    step_id = %ctx.step_id,
                    task_id = %task.id,
                    status = %task.status,
                    "Task step resumed"
                );
                Ok(Some(task))
            }
            Err(CoreError::TaskNotFound { .. }) => Ok(None),
            Err(e) => Err(StepError::Transient(e.to_string())),
        }
    }

    async fn enqueue(&self, ctx: &StepContext, config: TaskStepConfig) -> Result<Task, StepError> {
        let mut new_task = NewTask::new(config.task_type).with_priority(config.priority);
        new_task.payload = config.payload;
        if let Some(max_retries) = config.max_retries {
            new_task = new_task.with_max_retries(max_retries);
        }

        let task = self.queue.create(new_task).await.map_err(|e| {
            if e.is_infrastructure() {
                StepError::Transient(e.to_string())
            } else {
                StepError::Permanent(e.to_string())
            }
        })?;

        if let Some(tracker) = &ctx.tracker
            && let Err(e) = tracker.track(&task.id).await
        {
            // an unrecorded task would run without anyone waiting for it
            if let Err(delete_err) = self.queue.delete(&task.id).await {
                warn!(task_id = %task.id, error = %delete_err, "Failed to remove untracked task");
            }
            return Err(e);
        }

        debug!(
            execution_id = %ctx.execution_id,
            step_id = %ctx.step_id,
            task_id = %task.id,
            "Task step enqueued"
        );
        Ok(task)
    }
}

#[async_trait]
impl StepExecutor for TaskStepExecutor {
    async fn execute(
        &self,
        ctx: &StepContext,
        config: &Value,
        _variables: &Value,
    ) -> Result<Value, StepError> {
        let config: TaskStepConfig = serde_json::from_value(config.clone())
            .map_err(|e| StepError::Permanent(format!("invalid task step config: {}", e)))?;

        let task = match self.recorded(ctx).await? {
            Some(task) => task,
            None => self.enqueue(ctx, config).await?,
        };

        let mut current = task;
        loop {
            match current.status {
                TaskStatus::Completed => {
                    return Ok(json!({
                        "task_id": current.id,
                        "status": current.status,
                        "retry_count": current.retry_count,
                    }));
                }
                TaskStatus::Dead | TaskStatus::Failed => {
                    return Err(StepError::Permanent(format!(
                        "task '{}' ended {}: {}",
                        current.id,
                        current.status,
                        current.error.as_deref().unwrap_or("no error recorded")
                    )));
                }
                TaskStatus::Pending | TaskStatus::Running => {}
            }

            tokio::select! {
                _ = ctx.cancellation.cancelled() => return Err(StepError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            current = self
                .queue
                .get(&current.id)
                .await
                .map_err(|e| StepError::Transient(e.to_string()))?;
        }
    }

    async fn abandon(&self, ctx: &StepContext, _config: &Value) {
        let Some(task_id) = ctx.task_id.as_deref() else {
            return;
        };
        let task = match self.queue.get(task_id).await {
            Ok(task) => task,
            Err(CoreError::TaskNotFound { .. }) => return,
            Err(e) => {
                warn!(task_id, error = %e, "Failed to load abandoned task");
                return;
            }
        };

        let settled = match task.status {
            TaskStatus::Pending => self.queue.delete(&task.id).await.map(|_| "removed"),
            TaskStatus::Running => self
                .queue
                .mark_failed_permanently(&task, "workflow step abandoned")
                .await
                .map(|_| "failed"),
            _ => return,
        };
        match settled {
            Ok(outcome) => info!(
                execution_id = %ctx.execution_id,
                step_id = %ctx.step_id,
                task_id,
                outcome,
                "Settled task of abandoned step"
            ),
            Err(e) => warn!(task_id, error = %e, "Failed to settle abandoned task"),
        }
    }
}

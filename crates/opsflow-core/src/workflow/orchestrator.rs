// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow orchestrator.
//!
//! [`WorkflowOrchestrator`] drives executions forward one cycle at a time:
//!
//! 1. resolve the ready, blocked and skipped sets
//! 2. apply blocked (FAILED) and skipped (COMPLETED-skipped) steps and loop
//! 3. with nothing ready and every step terminal, finalize the execution
//! 4. otherwise dispatch ready steps with bounded fan-out
//!
//! Every state change goes through a per-execution writer lock that reloads
//! the execution, applies the change and persists both the record and its
//! checkpoint. Control requests (cancel, pause) and step results therefore
//! never overwrite each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, Result};
use crate::persistence::{WorkflowDefinitionStore, WorkflowExecutionStore};

use super::condition;
use super::definition::{StepType, WorkflowDefinition, WorkflowStep};
use super::dependency::DependencyResolver;
use super::execution::{ExecutionFilter, ExecutionStatus, StepStatus, WorkflowExecution};
use super::executor::{ExecutorRegistry, StepContext, StepError, TaskTracker};

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Ready steps of one execution dispatched at the same time.
    pub max_parallel_steps: usize,
    /// Deepest allowed sub-workflow nesting.
    pub max_workflow_depth: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 4,
            max_workflow_depth: 8,
        }
    }
}

/// In-process control handle of an execution being driven.
#[derive(Debug)]
struct ExecutionControl {
    token: CancellationToken,
    timed_out: AtomicBool,
}

impl ExecutionControl {
    fn new(parent: Option<&CancellationToken>) -> Self {
        Self {
            token: parent.map(CancellationToken::child_token).unwrap_or_default(),
            timed_out: AtomicBool::new(false),
        }
    }
}

enum Cycle {
    /// State changed; another cycle may find more work.
    Progressed,
    /// Nothing more to do for now.
    Rested(WorkflowExecution),
}

struct StepRun {
    result: std::result::Result<Value, StepError>,
    retry_count: u32,
    logs: Vec<String>,
}

/// Writes the task a step waits on into the stored step record.
struct StepTaskSlot {
    executions: Arc<dyn WorkflowExecutionStore>,
    writer: Arc<tokio::sync::Mutex<()>>,
    execution_id: String,
    step_id: String,
    current: Mutex<Option<String>>,
}

impl StepTaskSlot {
    fn current(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl TaskTracker for StepTaskSlot {
    async fn track(&self, task_id: &str) -> std::result::Result<(), StepError> {
        let _guard = self.writer.lock().await;
        let mut execution = self
            .executions
            .get_execution(&self.execution_id)
            .await
            .map_err(step_error)?
            .ok_or_else(|| {
                StepError::Permanent(format!("execution '{}' disappeared", self.execution_id))
            })?;
        if let Some(step) = execution.step_mut(&self.step_id) {
            step.task_id = Some(task_id.to_string());
        }
        save_execution(self.executions.as_ref(), &mut execution)
            .await
            .map_err(step_error)?;

        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(task_id.to_string());
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SubWorkflowConfig {
    #[serde(default)]
    workflow: Option<String>,
    #[serde(default)]
    workflow_id: Option<String>,
    #[serde(default)]
    input: BTreeMap<String, Value>,
}

/// Drives workflow executions to completion.
pub struct WorkflowOrchestrator {
    definitions: Arc<dyn WorkflowDefinitionStore>,
    executions: Arc<dyn WorkflowExecutionStore>,
    executors: ExecutorRegistry,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    writers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    controls: Mutex<HashMap<String, Arc<ExecutionControl>>>,
}

impl std::fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("executors", &self.executors)
            .field("config", &self.config)
            .finish()
    }
}

impl WorkflowOrchestrator {
    /// Create an orchestrator with the system clock and default tuning.
    pub fn new(
        definitions: Arc<dyn WorkflowDefinitionStore>,
        executions: Arc<dyn WorkflowExecutionStore>,
        executors: ExecutorRegistry,
    ) -> Self {
        Self {
            definitions,
            executions,
            executors,
            clock: Arc::new(SystemClock),
            config: OrchestratorConfig::default(),
            writers: Mutex::new(HashMap::new()),
            controls: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the fan-out and nesting limits.
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(3)
    }

    // ========================================================================
    // Definitions
    // ========================================================================

    /// Validate and store a new definition at version 1.
    #[instrument(skip(self, definition), fields(workflow = %definition.name))]
    pub async fn register_definition(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition> {
        definition.validate()?;

        let now = self.now();
        if definition.id.is_empty() {
            definition.id = Uuid::now_v7().to_string();
        }
        definition.version = 1;
        definition.created_at = now;
        definition.updated_at = now;

        self.definitions.create_definition(&definition).await?;
        info!(workflow_id = %definition.id, steps = definition.steps.len(), "Workflow registered");
        Ok(definition)
    }

    /// Replace an existing definition and bump its version.
    ///
    /// Executions already created keep the snapshot they were started with.
    #[instrument(skip(self, definition), fields(workflow_id = %definition.id))]
    pub async fn update_definition(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition> {
        definition.validate()?;

        let existing = self
            .definitions
            .get_definition(&definition.id)
            .await?
            .ok_or_else(|| CoreError::WorkflowNotFound {
                workflow: definition.id.clone(),
            })?;

        definition.version = existing.version + 1;
        definition.created_at = existing.created_at;
        definition.updated_at = self.now();

        self.definitions.update_definition(&definition).await?;
        info!(version = definition.version, "Workflow updated");
        Ok(definition)
    }

    /// Look up a definition by id, then by name.
    pub async fn get_definition(&self, workflow: &str) -> Result<WorkflowDefinition> {
        if let Some(def) = self.definitions.get_definition(workflow).await? {
            return Ok(def);
        }
        self.definitions
            .get_definition_by_name(workflow)
            .await?
            .ok_or_else(|| CoreError::WorkflowNotFound {
                workflow: workflow.to_string(),
            })
    }

    // ========================================================================
    // Executions
    // ========================================================================

    /// Create a PENDING execution of `workflow` (id or name).
    #[instrument(skip(self, input))]
    pub async fn create_execution(
        &self,
        workflow: &str,
        input: BTreeMap<String, Value>,
    ) -> Result<WorkflowExecution> {
        let definition = self.get_definition(workflow).await?;
        let mut execution = WorkflowExecution::new(&definition, input, self.now());
        self.insert_execution(&mut execution).await?;
        info!(execution_id = %execution.id, workflow_id = %definition.id, "Execution created");
        Ok(execution)
    }

    async fn insert_execution(&self, execution: &mut WorkflowExecution) -> Result<()> {
        self.executions.create_execution(execution).await?;
        let blob = execution.to_checkpoint()?;
        self.executions.save_checkpoint(&execution.id, &blob).await?;
        execution.checkpoint = Some(blob);
        Ok(())
    }

    /// Fetch an execution.
    pub async fn get_execution(&self, execution_id: &str) -> Result<WorkflowExecution> {
        self.load(execution_id).await
    }

    /// List executions, newest first.
    pub async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>> {
        self.executions.list_executions(filter).await
    }

    /// PENDING → RUNNING.
    #[instrument(skip(self))]
    pub async fn start(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let now = self.now();
        let (execution, started) = self
            .mutate(execution_id, |e| {
                if e.status != ExecutionStatus::Pending {
                    return Err(e.status);
                }
                e.status = ExecutionStatus::Running;
                e.started_at = Some(now);
                Ok(())
            })
            .await?;

        started.map_err(|actual| CoreError::InvalidExecutionState {
            execution_id: execution_id.to_string(),
            expected: ExecutionStatus::Pending.to_string(),
            actual: actual.to_string(),
        })?;
        info!("Execution started");
        Ok(execution)
    }

    /// Create and run an execution until it rests.
    pub async fn execute(
        &self,
        workflow: &str,
        input: BTreeMap<String, Value>,
    ) -> Result<WorkflowExecution> {
        let execution = self.create_execution(workflow, input).await?;
        self.run(&execution.id).await
    }

    /// Drive an execution until it is terminal or PAUSED.
    ///
    /// A PENDING execution is started first. Terminal and paused executions
    /// are returned unchanged.
    #[instrument(skip(self))]
    pub async fn run(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let execution = self.load(execution_id).await?;
        match execution.status {
            ExecutionStatus::Pending => {
                self.start(execution_id).await?;
            }
            ExecutionStatus::Running => {}
            _ => return Ok(execution),
        }
        self.drive(execution_id.to_string(), None).await
    }

    /// Perform a single advance cycle.
    ///
    /// No-op for executions that are not RUNNING.
    #[instrument(skip(self))]
    pub async fn advance(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let execution = self.load(execution_id).await?;
        if execution.status != ExecutionStatus::Running {
            self.release(execution_id);
            return Ok(execution);
        }

        let control = self.control(execution_id, None);
        if control.token.is_cancelled() {
            let interrupted = self.interrupt(execution_id, &control).await;
            self.release(execution_id);
            return interrupted;
        }
        let execution = match self.cycle(execution, &control).await? {
            Cycle::Progressed => self.load(execution_id).await?,
            Cycle::Rested(execution) => execution,
        };
        if execution.status != ExecutionStatus::Running {
            self.release(execution_id);
        }
        Ok(execution)
    }

    /// Cancel an execution. Completed steps are kept; in-flight steps are
    /// signalled and fail.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: &str) -> Result<WorkflowExecution> {
        if let Some(control) = self.existing_control(execution_id) {
            control.token.cancel();
        }

        let now = self.now();
        let (execution, previous) = self
            .mutate(execution_id, |e| {
                let previous = e.status;
                if !previous.is_terminal() {
                    e.status = ExecutionStatus::Cancelled;
                    e.error = Some("execution cancelled".to_string());
                    finish_timing(e, now);
                }
                previous
            })
            .await?;
        self.release(execution_id);

        if previous.is_terminal() {
            return Err(CoreError::InvalidExecutionState {
                execution_id: execution_id.to_string(),
                expected: "pending, running or paused".to_string(),
                actual: previous.to_string(),
            });
        }
        info!("Execution cancelled");
        Ok(execution)
    }

    /// Stop dispatching new steps. In-flight steps finish normally.
    #[instrument(skip(self))]
    pub async fn pause(&self, execution_id: &str) -> Result<WorkflowExecution> {
        self.toggle(execution_id, ExecutionStatus::Running, ExecutionStatus::Paused)
            .await
    }

    /// Allow dispatch again. Call [`run`](Self::run) to continue driving.
    #[instrument(skip(self))]
    pub async fn resume(&self, execution_id: &str) -> Result<WorkflowExecution> {
        self.toggle(execution_id, ExecutionStatus::Paused, ExecutionStatus::Running)
            .await
    }

    async fn toggle(
        &self,
        execution_id: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<WorkflowExecution> {
        let (execution, actual) = self
            .mutate(execution_id, |e| {
                let actual = e.status;
                if actual == from {
                    e.status = to;
                }
                actual
            })
            .await?;

        if actual != from {
            return Err(CoreError::InvalidExecutionState {
                execution_id: execution_id.to_string(),
                expected: from.to_string(),
                actual: actual.to_string(),
            });
        }
        info!(status = %to, "Execution status changed");
        Ok(execution)
    }

    /// Resume an execution after a crash.
    ///
    /// Restores the last checkpoint, puts steps that were RUNNING back to
    /// PENDING and drives a RUNNING execution on. Only call this for
    /// executions no live orchestrator is driving.
    #[instrument(skip(self))]
    pub async fn recover(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let writer = self.writer(execution_id);
        let restored = {
            let _guard = writer.lock().await;
            let mut execution = match self.executions.load_checkpoint(execution_id).await? {
                Some(blob) => WorkflowExecution::from_checkpoint(execution_id, &blob)?,
                None => self.load(execution_id).await?,
            };

            let now = self.now();
            let mut reset = 0usize;
            for step in &mut execution.steps {
                if step.reset_interrupted(now) {
                    reset += 1;
                }
            }
            self.persist(&mut execution).await?;
            info!(reset_steps = reset, status = %execution.status, "Execution restored from checkpoint");
            execution
        };
        drop(writer);

        if restored.status == ExecutionStatus::Running {
            self.drive(execution_id.to_string(), None).await
        } else {
            self.release(execution_id);
            Ok(restored)
        }
    }

    // ========================================================================
    // Driving
    // ========================================================================

    fn drive(
        &self,
        execution_id: String,
        parent: Option<CancellationToken>,
    ) -> BoxFuture<'_, Result<WorkflowExecution>> {
        Box::pin(async move {
            let control = self.control(&execution_id, parent.as_ref());
            let result = self.drive_with_deadline(&execution_id, &control).await;
            self.release(&execution_id);
            result
        })
    }

    async fn drive_with_deadline(
        &self,
        execution_id: &str,
        control: &Arc<ExecutionControl>,
    ) -> Result<WorkflowExecution> {
        let execution = self.load(execution_id).await?;
        let remaining = execution.definition.timeout_ms.map(|limit| {
            let elapsed = execution
                .started_at
                .map(|s| (self.now() - s).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            Duration::from_millis(limit.saturating_sub(elapsed))
        });

        let drive = self.drive_loop(execution_id, control);
        tokio::pin!(drive);

        if let Some(remaining) = remaining {
            tokio::select! {
                result = &mut drive => return result,
                _ = tokio::time::sleep(remaining) => {
                    warn!(execution_id = %execution_id, "Execution timed out, cancelling in-flight steps");
                    control.timed_out.store(true, Ordering::SeqCst);
                    control.token.cancel();
                }
            }
        }
        drive.await
    }

    async fn drive_loop(
        &self,
        execution_id: &str,
        control: &Arc<ExecutionControl>,
    ) -> Result<WorkflowExecution> {
        loop {
            if control.token.is_cancelled() {
                return self.interrupt(execution_id, control).await;
            }
            let execution = self.load(execution_id).await?;
            if execution.status != ExecutionStatus::Running {
                return Ok(execution);
            }
            if let Cycle::Rested(execution) = self.cycle(execution, control).await? {
                return Ok(execution);
            }
        }
    }

    async fn cycle(
        &self,
        execution: WorkflowExecution,
        control: &Arc<ExecutionControl>,
    ) -> Result<Cycle> {
        let resolver = DependencyResolver::new(&execution.definition);
        let resolution = resolver.resolve(&execution, &execution.variables());

        if !resolution.blocked.is_empty() || !resolution.skipped.is_empty() {
            let now = self.now();
            self.mutate(&execution.id, |e| {
                for blocked in &resolution.blocked {
                    if let Some(step) = e.step_mut(&blocked.step_id) {
                        step.fail(now, format!("dependency '{}' failed", blocked.dependency));
                    }
                }
                for skipped in &resolution.skipped {
                    if let Some(step) = e.step_mut(&skipped.step_id) {
                        step.skip(now, &skipped.reason);
                    }
                }
            })
            .await?;
            debug!(
                execution_id = %execution.id,
                blocked = resolution.blocked.len(),
                skipped = resolution.skipped.len(),
                "Resolved steps without running them"
            );
            return Ok(Cycle::Progressed);
        }

        if resolution.ready.is_empty() {
            if execution.all_steps_terminal() {
                return self.finalize(&execution.id).await.map(Cycle::Rested);
            }
            if execution
                .steps
                .iter()
                .any(|s| s.status == StepStatus::Running)
            {
                return Ok(Cycle::Rested(execution));
            }

            let now = self.now();
            self.mutate(&execution.id, |e| {
                for step in e.steps.iter_mut().filter(|s| s.status == StepStatus::Pending) {
                    step.fail(now, "unreachable: dependencies can never be satisfied");
                }
            })
            .await?;
            warn!(execution_id = %execution.id, "Failed unreachable steps");
            return Ok(Cycle::Progressed);
        }

        let fan_out = self.config.max_parallel_steps.max(1);
        let results: Vec<Result<()>> = stream::iter(
            resolution
                .ready
                .into_iter()
                .map(|step_id| self.run_step(&execution.id, step_id, control)),
        )
        .buffer_unordered(fan_out)
        .collect()
        .await;

        for result in results {
            result?;
        }
        Ok(Cycle::Progressed)
    }

    async fn run_step(
        &self,
        execution_id: &str,
        step_id: String,
        control: &Arc<ExecutionControl>,
    ) -> Result<()> {
        if control.token.is_cancelled() {
            return Ok(());
        }

        let now = self.now();
        let (_, started) = self
            .mutate(execution_id, |e| {
                if e.status != ExecutionStatus::Running {
                    return None;
                }
                let variables = e.variables();
                let step = e.definition.step(&step_id)?.clone();
                let retries = e.definition.retries_for(&step);
                let depth = e.depth;
                let record = e.step_mut(&step_id)?;
                if !record.start(now, variables.clone()) {
                    return None;
                }
                let task_id = record.task_id.clone();
                Some((step, retries, depth, variables, task_id))
            })
            .await?;

        let Some((step, retries, depth, variables, task_id)) = started else {
            return Ok(());
        };
        debug!(execution_id = %execution_id, step_id = %step_id, step_type = %step.step_type, "Step started");

        let slot = Arc::new(StepTaskSlot {
            executions: self.executions.clone(),
            writer: self.writer(execution_id),
            execution_id: execution_id.to_string(),
            step_id: step_id.clone(),
            current: Mutex::new(task_id),
        });
        let run = self
            .run_attempts(&slot, depth, &step, retries, &variables, &control.token)
            .await;
        if run.result.is_err() {
            self.abandon(execution_id, &step, run.retry_count + 1, slot.current())
                .await;
        }
        drop(slot);

        let now = self.now();
        let succeeded = run.result.is_ok();
        let error_message = run.result.as_ref().err().map(ToString::to_string);
        self.mutate(execution_id, |e| {
            if let Some(record) = e.step_mut(&step_id) {
                record.retry_count = run.retry_count;
                record.logs.extend(run.logs);
                match run.result {
                    Ok(output) => record.complete(now, output),
                    Err(err) => record.fail(now, err.to_string()),
                };
            }
        })
        .await?;

        if succeeded {
            info!(execution_id = %execution_id, step_id = %step_id, retries = run.retry_count, "Step completed");
        } else {
            warn!(
                execution_id = %execution_id,
                step_id = %step_id,
                retries = run.retry_count,
                continue_on_error = step.continue_on_error,
                error = error_message.as_deref().unwrap_or_default(),
                "Step failed"
            );
        }
        Ok(())
    }

    /// Attempt a step until it succeeds, fails permanently or runs out of retries.
    async fn run_attempts(
        &self,
        slot: &Arc<StepTaskSlot>,
        depth: u32,
        step: &WorkflowStep,
        retries: u32,
        variables: &Value,
        cancellation: &CancellationToken,
    ) -> StepRun {
        let execution_id = slot.execution_id.as_str();
        let mut logs = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let ctx = StepContext {
                execution_id: execution_id.to_string(),
                step_id: step.id.clone(),
                attempt,
                cancellation: cancellation.child_token(),
                task_id: slot.current(),
                tracker: Some(slot.clone()),
            };

            let result = self.dispatch(depth, step, &ctx, variables).await;
            let err = match result {
                Ok(output) => {
                    return StepRun {
                        result: Ok(output),
                        retry_count: attempt - 1,
                        logs,
                    };
                }
                Err(err) => err,
            };

            logs.push(format!(
                "{} attempt {} failed: {}",
                self.now().to_rfc3339(),
                attempt,
                err
            ));

            if !err.is_retryable() || attempt > retries {
                return StepRun {
                    result: Err(err),
                    retry_count: attempt - 1,
                    logs,
                };
            }

            debug!(
                execution_id = %execution_id,
                step_id = %step.id,
                attempt,
                retries,
                "Retrying step"
            );
            if step.retry_delay_ms > 0 {
                tokio::select! {
                    _ = cancellation.cancelled() => {
                        return StepRun {
                            result: Err(StepError::Cancelled),
                            retry_count: attempt,
                            logs,
                        };
                    }
                    _ = tokio::time::sleep(Duration::from_millis(step.retry_delay_ms)) => {}
                }
            }
        }
    }

    /// Let the executor settle outside work of a step that failed for good.
    async fn abandon(
        &self,
        execution_id: &str,
        step: &WorkflowStep,
        attempt: u32,
        task_id: Option<String>,
    ) {
        if task_id.is_none() {
            return;
        }
        let Some(executor) = self.executors.get(step.step_type) else {
            return;
        };
        let mut ctx = StepContext::new(
            execution_id,
            step.id.clone(),
            attempt,
            CancellationToken::new(),
        );
        ctx.task_id = task_id;
        executor.abandon(&ctx, &step.config).await;
    }

    /// One attempt, bounded by the step timeout and the cancellation signal.
    async fn dispatch(
        &self,
        depth: u32,
        step: &WorkflowStep,
        ctx: &StepContext,
        variables: &Value,
    ) -> std::result::Result<Value, StepError> {
        // sub-workflows settle their own execution on timeout or cancellation
        if step.step_type == StepType::Workflow {
            return self.run_sub_workflow(depth, step, ctx).await;
        }

        let attempt = async {
            match step.timeout_ms {
                Some(ms) => {
                    let limit = Duration::from_millis(ms);
                    tokio::time::timeout(limit, self.dispatch_kind(step, ctx, variables))
                        .await
                        .unwrap_or(Err(StepError::Timeout(limit)))
                }
                None => self.dispatch_kind(step, ctx, variables).await,
            }
        };

        tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => Err(StepError::Cancelled),
            result = attempt => result,
        }
    }

    async fn dispatch_kind(
        &self,
        step: &WorkflowStep,
        ctx: &StepContext,
        variables: &Value,
    ) -> std::result::Result<Value, StepError> {
        match step.step_type {
            StepType::Parallel => Ok(json!({ "steps": step.child_refs() })),
            StepType::Decision => Ok(decide(step, variables)),
            StepType::Workflow => Err(StepError::Permanent(
                "workflow steps are dispatched directly".to_string(),
            )),
            kind => {
                let executor = self.executors.get(kind).ok_or_else(|| {
                    StepError::Permanent(format!("no executor registered for step type '{}'", kind))
                })?;
                executor.execute(ctx, &step.config, variables).await
            }
        }
    }

    async fn run_sub_workflow(
        &self,
        depth: u32,
        step: &WorkflowStep,
        ctx: &StepContext,
    ) -> std::result::Result<Value, StepError> {
        if depth + 1 > self.config.max_workflow_depth {
            return Err(StepError::Permanent(format!(
                "sub-workflow nesting exceeds {} levels",
                self.config.max_workflow_depth
            )));
        }

        let config: SubWorkflowConfig = serde_json::from_value(step.config.clone())
            .map_err(|e| StepError::Permanent(format!("invalid workflow step config: {}", e)))?;
        let workflow = config
            .workflow_id
            .or(config.workflow)
            .ok_or_else(|| StepError::Permanent("workflow step needs 'workflow' or 'workflow_id'".to_string()))?;

        let definition = self.get_definition(&workflow).await.map_err(step_error)?;
        let mut child = WorkflowExecution::new(&definition, config.input, self.now());
        child.parent_execution_id = Some(ctx.execution_id.clone());
        child.depth = depth + 1;
        child.status = ExecutionStatus::Running;
        child.started_at = Some(child.created_at);
        self.insert_execution(&mut child).await.map_err(step_error)?;

        info!(
            execution_id = %ctx.execution_id,
            step_id = %step.id,
            child_execution_id = %child.id,
            "Sub-workflow started"
        );

        let child_token = ctx.cancellation.child_token();
        let drive = self.drive(child.id.clone(), Some(child_token.clone()));
        tokio::pin!(drive);

        let mut timed_out = None;
        if let Some(ms) = step.timeout_ms {
            let limit = Duration::from_millis(ms);
            tokio::select! {
                result = &mut drive => {
                    return sub_workflow_result(result.map_err(step_error)?);
                }
                _ = tokio::time::sleep(limit) => {
                    child_token.cancel();
                    timed_out = Some(limit);
                }
            }
        }

        let finished = drive.await.map_err(step_error)?;
        match timed_out {
            Some(limit) => Err(StepError::Timeout(limit)),
            None => sub_workflow_result(finished),
        }
    }

    /// Terminal status for an execution whose steps are all resolved.
    async fn finalize(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let now = self.now();
        let (execution, changed) = self
            .mutate(execution_id, |e| {
                if e.status.is_terminal() {
                    return false;
                }
                if let Some(failed) = e.blocking_failure() {
                    let message = format!(
                        "step '{}' failed: {}",
                        failed.step_id,
                        failed.error.as_deref().unwrap_or("unknown error")
                    );
                    e.status = ExecutionStatus::Failed;
                    e.error = Some(message);
                } else {
                    let outputs: Map<String, Value> = e
                        .steps
                        .iter()
                        .filter(|s| s.status == StepStatus::Completed && !s.skipped)
                        .map(|s| (s.step_id.clone(), s.output.clone().unwrap_or(Value::Null)))
                        .collect();
                    e.status = ExecutionStatus::Completed;
                    e.output = Some(Value::Object(outputs));
                }
                finish_timing(e, now);
                true
            })
            .await?;

        if changed {
            match execution.status {
                ExecutionStatus::Completed => {
                    info!(execution_id = %execution_id, duration_ms = ?execution.duration_ms, "Execution completed")
                }
                _ => error!(
                    execution_id = %execution_id,
                    error = execution.error.as_deref().unwrap_or_default(),
                    "Execution failed"
                ),
            }
        }
        Ok(execution)
    }

    /// Settle an execution whose control token fired.
    async fn interrupt(
        &self,
        execution_id: &str,
        control: &ExecutionControl,
    ) -> Result<WorkflowExecution> {
        let timed_out = control.timed_out.load(Ordering::SeqCst);
        let now = self.now();
        let (execution, _) = self
            .mutate(execution_id, |e| {
                if e.status.is_terminal() {
                    return;
                }
                if timed_out {
                    let limit = e.definition.timeout_ms.unwrap_or_default();
                    for step in e.steps.iter_mut().filter(|s| s.status == StepStatus::Running) {
                        step.fail(now, "workflow timed out");
                    }
                    e.status = ExecutionStatus::Failed;
                    e.error = Some(format!("workflow timed out after {}ms", limit));
                } else {
                    e.status = ExecutionStatus::Cancelled;
                    e.error = Some("execution cancelled".to_string());
                }
                finish_timing(e, now);
            })
            .await?;
        Ok(execution)
    }

    // ========================================================================
    // State access
    // ========================================================================

    async fn load(&self, execution_id: &str) -> Result<WorkflowExecution> {
        self.executions
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| CoreError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })
    }

    async fn persist(&self, execution: &mut WorkflowExecution) -> Result<()> {
        save_execution(self.executions.as_ref(), execution).await
    }

    /// Reload, change and persist an execution under its writer lock.
    async fn mutate<F, R>(&self, execution_id: &str, f: F) -> Result<(WorkflowExecution, R)>
    where
        F: FnOnce(&mut WorkflowExecution) -> R,
    {
        let writer = self.writer(execution_id);
        let _guard = writer.lock().await;

        let mut execution = self.load(execution_id).await?;
        let result = f(&mut execution);
        self.persist(&mut execution).await?;
        Ok((execution, result))
    }

    fn writer(&self, execution_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        writers.entry(execution_id.to_string()).or_default().clone()
    }

    fn control(
        &self,
        execution_id: &str,
        parent: Option<&CancellationToken>,
    ) -> Arc<ExecutionControl> {
        let mut controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
        controls
            .entry(execution_id.to_string())
            .or_insert_with(|| Arc::new(ExecutionControl::new(parent)))
            .clone()
    }

    fn existing_control(&self, execution_id: &str) -> Option<Arc<ExecutionControl>> {
        let controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
        controls.get(execution_id).cloned()
    }

    /// Executions holding a control or writer entry.
    #[cfg(test)]
    fn tracked_executions(&self) -> (usize, usize) {
        let controls = self.controls.lock().unwrap_or_else(|e| e.into_inner()).len();
        let writers = self.writers.lock().unwrap_or_else(|e| e.into_inner()).len();
        (controls, writers)
    }

    fn release(&self, execution_id: &str) {
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(execution_id);
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        if writers
            .get(execution_id)
            .is_some_and(|w| Arc::strong_count(w) == 1)
        {
            writers.remove(execution_id);
        }
    }
}

/// Write the record and its checkpoint, keeping the blob on `execution`.
async fn save_execution(
    store: &dyn WorkflowExecutionStore,
    execution: &mut WorkflowExecution,
) -> Result<()> {
    store.update_execution(execution).await?;
    let blob = execution.to_checkpoint()?;
    store.save_checkpoint(&execution.id, &blob).await?;
    execution.checkpoint = Some(blob);
    Ok(())
}

fn finish_timing(execution: &mut WorkflowExecution, now: DateTime<Utc>) {
    execution.completed_at = Some(now);
    execution.duration_ms = execution
        .started_at
        .map(|started| (now - started).num_milliseconds());
}

/// Evaluate a decision step. A missing condition selects the true branch.
fn decide(step: &WorkflowStep, variables: &Value) -> Value {
    let condition = step
        .condition
        .as_ref()
        .or_else(|| step.config.get("condition"));
    let result = condition.is_none_or(|c| condition::evaluate(c, variables));

    let (branch, selected, skipped) = if result {
        ("if_true", step.config_refs("if_true"), step.config_refs("if_false"))
    } else {
        ("if_false", step.config_refs("if_false"), step.config_refs("if_true"))
    };
    let skipped: Vec<String> = skipped
        .into_iter()
        .filter(|id| !selected.contains(id))
        .collect();

    json!({
        "result": result,
        "branch": branch,
        "selected": selected,
        "skipped": skipped,
    })
}

fn sub_workflow_result(finished: WorkflowExecution) -> std::result::Result<Value, StepError> {
    match finished.status {
        ExecutionStatus::Completed => Ok(json!({
            "execution_id": finished.id,
            "status": finished.status,
            "output": finished.output,
        })),
        status => Err(StepError::Permanent(format!(
            "sub-workflow '{}' ended {}: {}",
            finished.id,
            status,
            finished.error.as_deref().unwrap_or("no error recorded")
        ))),
    }
}

fn step_error(err: CoreError) -> StepError {
    if err.is_infrastructure() {
        StepError::Transient(err.to_string())
    } else {
        StepError::Permanent(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decide_selects_branch() {
        let step = WorkflowStep::new("d", StepType::Decision)
            .with_condition(json!("healthy"))
            .with_config(json!({"if_true": ["ok"], "if_false": ["page", "ticket"]}));

        let out = decide(&step, &json!({"healthy": false}));
        assert_eq!(out["result"], json!(false));
        assert_eq!(out["branch"], json!("if_false"));
        assert_eq!(out["selected"], json!(["page", "ticket"]));
        assert_eq!(out["skipped"], json!(["ok"]));

        let out = decide(&step, &json!({"healthy": true}));
        assert_eq!(out["skipped"], json!(["page", "ticket"]));
    }

    #[test]
    fn test_decide_without_condition_takes_true_branch() {
        let step = WorkflowStep::new("d", StepType::Decision)
            .with_config(json!({"if_true": "a", "if_false": "b"}));
        assert_eq!(decide(&step, &Value::Null)["selected"], json!(["a"]));
    }

    struct Echo;

    #[async_trait]
    impl crate::workflow::executor::StepExecutor for Echo {
        async fn execute(
            &self,
            _ctx: &StepContext,
            config: &Value,
            _variables: &Value,
        ) -> std::result::Result<Value, StepError> {
            Ok(config.clone())
        }
    }

    async fn orchestrator_with_pipeline() -> WorkflowOrchestrator {
        let store = Arc::new(crate::persistence::MemoryPersistence::new());
        let mut executors = ExecutorRegistry::new();
        executors.register(StepType::Shell, Arc::new(Echo));
        let orchestrator = WorkflowOrchestrator::new(store.clone(), store, executors);
        orchestrator
            .register_definition(WorkflowDefinition::new(
                "pipeline",
                vec![
                    WorkflowStep::new("extract", StepType::Shell),
                    WorkflowStep::new("load", StepType::Shell).depends_on(["extract"]),
                ],
            ))
            .await
            .unwrap();
        orchestrator
    }

    #[tokio::test]
    async fn test_cancel_after_single_advance_forgets_execution() {
        let orchestrator = orchestrator_with_pipeline().await;
        let execution = orchestrator
            .create_execution("pipeline", BTreeMap::new())
            .await
            .unwrap();
        orchestrator.start(&execution.id).await.unwrap();

        let advanced = orchestrator.advance(&execution.id).await.unwrap();
        assert_eq!(advanced.status, ExecutionStatus::Running);
        assert_eq!(orchestrator.tracked_executions(), (1, 1));

        let cancelled = orchestrator.cancel(&execution.id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert_eq!(orchestrator.tracked_executions(), (0, 0));
    }

    #[tokio::test]
    async fn test_advance_to_completion_forgets_execution() {
        let orchestrator = orchestrator_with_pipeline().await;
        let execution = orchestrator
            .create_execution("pipeline", BTreeMap::new())
            .await
            .unwrap();
        orchestrator.start(&execution.id).await.unwrap();

        let mut current = orchestrator.advance(&execution.id).await.unwrap();
        for _ in 0..4 {
            if current.status != ExecutionStatus::Running {
                break;
            }
            current = orchestrator.advance(&execution.id).await.unwrap();
        }
        assert_eq!(current.status, ExecutionStatus::Completed);
        assert_eq!(orchestrator.tracked_executions(), (0, 0));

        orchestrator.advance(&execution.id).await.unwrap();
        assert_eq!(orchestrator.tracked_executions(), (0, 0));
    }

    #[tokio::test]
    async fn test_recover_forgets_finished_execution() {
        let orchestrator = orchestrator_with_pipeline().await;
        let execution = orchestrator
            .execute("pipeline", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);

        let recovered = orchestrator.recover(&execution.id).await.unwrap();
        assert_eq!(recovered.status, ExecutionStatus::Completed);
        assert_eq!(orchestrator.tracked_executions(), (0, 0));
    }

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_parallel_steps, 4);
        assert_eq!(config.max_workflow_depth, 8);
    }
}

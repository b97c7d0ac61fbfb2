// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for the opsflow-core integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use serde_json::Value;

use opsflow_core::clock::ManualClock;
use opsflow_core::persistence::{MemoryPersistence, SqlitePersistence, TaskStore};
use opsflow_core::task::TaskQueue;
use opsflow_core::workflow::{
    ExecutionStatus, ExecutorRegistry, StepContext, StepError, StepExecutor, StepType,
    WorkflowExecution, WorkflowOrchestrator,
};

/// Store backends every queue property is checked against.
#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    Sqlite,
}

pub const BACKENDS: [Backend; 2] = [Backend::Memory, Backend::Sqlite];

pub async fn sqlite_store() -> Arc<SqlitePersistence> {
    Arc::new(
        SqlitePersistence::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should open"),
    )
}

pub async fn task_store(backend: Backend) -> Arc<dyn TaskStore> {
    match backend {
        Backend::Memory => Arc::new(MemoryPersistence::new()),
        Backend::Sqlite => sqlite_store().await,
    }
}

/// Queue over `backend` driven by a manual clock at millisecond precision.
pub async fn manual_queue(backend: Backend) -> (TaskQueue, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now().trunc_subsecs(3)));
    let queue = TaskQueue::new(task_store(backend).await).with_clock(clock.clone());
    (queue, clock)
}

/// Step executor whose behaviour is scripted by the step config.
///
/// | Key | Effect |
/// |-----|--------|
/// | `output` | value returned on success (default `{"ok": true}`) |
/// | `fail` | `"transient"` or `"permanent"` |
/// | `fail_times` | only the first N attempts fail (default: all) |
/// | `sleep_ms` | delay before answering |
/// | `block` | never answer; returns `Cancelled` once cancelled |
#[derive(Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<(String, u32)>>,
    variables: Mutex<BTreeMap<String, Value>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(step_id, attempt)` in invocation order.
    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn attempts(&self, step_id: &str) -> usize {
        self.calls().iter().filter(|(id, _)| id == step_id).count()
    }

    pub fn position(&self, step_id: &str) -> Option<usize> {
        self.calls().iter().position(|(id, _)| id == step_id)
    }

    /// Variables seen by the last attempt of `step_id`.
    pub fn variables_seen(&self, step_id: &str) -> Option<Value> {
        self.variables.lock().unwrap().get(step_id).cloned()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        ctx: &StepContext,
        config: &Value,
        variables: &Value,
    ) -> Result<Value, StepError> {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.step_id.clone(), ctx.attempt));
        self.variables
            .lock()
            .unwrap()
            .insert(ctx.step_id.clone(), variables.clone());

        if config.get("block").and_then(Value::as_bool).unwrap_or(false) {
            ctx.cancellation.cancelled().await;
            return Err(StepError::Cancelled);
        }

        if let Some(ms) = config.get("sleep_ms").and_then(Value::as_u64) {
            tokio::select! {
                _ = ctx.cancellation.cancelled() => return Err(StepError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            }
        }

        let fail_times = config
            .get("fail_times")
            .and_then(Value::as_u64)
            .unwrap_or(u64::MAX);
        if u64::from(ctx.attempt) <= fail_times {
            match config.get("fail").and_then(Value::as_str) {
                Some("transient") => {
                    return Err(StepError::Transient(format!(
                        "{} attempt {} flaked",
                        ctx.step_id, ctx.attempt
                    )));
                }
                Some("permanent") => {
                    return Err(StepError::Permanent(format!("{} is broken", ctx.step_id)));
                }
                _ => {}
            }
        }

        Ok(config
            .get("output")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({"ok": true})))
    }
}

/// Registry routing the plain step kinds to `executor`.
pub fn registry(executor: Arc<ScriptedExecutor>) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    for kind in [
        StepType::Shell,
        StepType::Http,
        StepType::Metric,
        StepType::Ai,
        StepType::Plugin,
    ] {
        registry.register(kind, executor.clone());
    }
    registry
}

/// Orchestrator over a fresh in-memory store with a scripted executor.
pub fn memory_orchestrator() -> (Arc<WorkflowOrchestrator>, Arc<ScriptedExecutor>) {
    let store = Arc::new(MemoryPersistence::new());
    let executor = ScriptedExecutor::new();
    let orchestrator = WorkflowOrchestrator::new(store.clone(), store, registry(executor.clone()));
    (Arc::new(orchestrator), executor)
}

/// Poll until `check` holds for the stored execution, or panic after 5s.
pub async fn wait_for_execution<F>(
    orchestrator: &WorkflowOrchestrator,
    execution_id: &str,
    check: F,
) -> WorkflowExecution
where
    F: Fn(&WorkflowExecution) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let execution = orchestrator.get_execution(execution_id).await.unwrap();
        if check(&execution) {
            return execution;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "execution {} never reached the expected state (status {})",
            execution_id,
            execution.status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn is_terminal(execution: &WorkflowExecution) -> bool {
    execution.status.is_terminal()
}

pub fn is_running(execution: &WorkflowExecution) -> bool {
    execution.status == ExecutionStatus::Running
}

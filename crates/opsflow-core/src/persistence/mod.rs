// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for opsflow-core.
//!
//! The queue and the orchestrator only talk to the traits defined here.
//! Two backends ship with the crate:
//!
//! - [`SqlitePersistence`]: durable storage through sqlx
//! - [`MemoryPersistence`]: process-local storage for tests and embedding

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::CoreError;
use crate::task::{Task, TaskFilter, TaskType};
use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::execution::{ExecutionFilter, WorkflowExecution};

/// Durable task storage.
///
/// Every method except [`claim_next`](TaskStore::claim_next) may be a plain
/// read or write: the worker holding a lease is the only writer of that task.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task.
    async fn create_task(&self, task: &Task) -> Result<(), CoreError>;

    /// Fetch a task by id.
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, CoreError>;

    /// Overwrite a task. Fails with `TaskNotFound` if it does not exist.
    async fn update_task(&self, task: &Task) -> Result<(), CoreError>;

    /// Delete a task. Returns false if it did not exist.
    async fn delete_task(&self, task_id: &str) -> Result<bool, CoreError>;

    /// List tasks ordered by `priority DESC, run_at ASC, id ASC`.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, CoreError>;

    /// Atomically select the best due PENDING task and lease it.
    ///
    /// The candidate is the first task with `status = pending` and
    /// `run_at <= now` in `priority DESC, run_at ASC, id ASC` order, restricted
    /// to `task_types` unless that slice is empty. In the same atomic step it
    /// becomes RUNNING with `locked_until = now + lease`. Two concurrent
    /// callers never receive the same task.
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        task_types: &[TaskType],
    ) -> Result<Option<Task>, CoreError>;

    /// Reset every RUNNING task whose lease ended before `now` to PENDING.
    ///
    /// Returns the number of tasks reclaimed.
    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, CoreError>;
}

/// Storage for workflow definitions.
#[async_trait]
pub trait WorkflowDefinitionStore: Send + Sync {
    /// Insert a definition. Fails with `WorkflowAlreadyExists` on a name clash.
    async fn create_definition(&self, definition: &WorkflowDefinition) -> Result<(), CoreError>;

    /// Fetch a definition by id.
    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, CoreError>;

    /// Fetch a definition by its unique name.
    async fn get_definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, CoreError>;

    /// Overwrite a definition. Fails with `WorkflowNotFound` if it does not exist.
    async fn update_definition(&self, definition: &WorkflowDefinition) -> Result<(), CoreError>;

    /// Delete a definition. Executions that reference it are kept.
    async fn delete_definition(&self, id: &str) -> Result<bool, CoreError>;

    /// All definitions ordered by name.
    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, CoreError>;
}

/// Storage for workflow executions and their checkpoints.
#[async_trait]
pub trait WorkflowExecutionStore: Send + Sync {
    /// Insert a new execution.
    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), CoreError>;

    /// Fetch an execution, including its last checkpoint blob.
    async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>, CoreError>;

    /// Overwrite an execution's state. The checkpoint blob is left untouched.
    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), CoreError>;

    /// Delete an execution and its checkpoint.
    async fn delete_execution(&self, id: &str) -> Result<bool, CoreError>;

    /// List executions, newest first.
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, CoreError>;

    /// Most recently created execution of a workflow.
    async fn get_latest_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowExecution>, CoreError>;

    /// Replace the checkpoint blob of an execution.
    async fn save_checkpoint(&self, execution_id: &str, state: &[u8]) -> Result<(), CoreError>;

    /// Read the checkpoint blob of an execution.
    async fn load_checkpoint(&self, execution_id: &str) -> Result<Option<Vec<u8>>, CoreError>;
}

/// Claim ordering shared by the backends: `priority DESC, run_at ASC, id ASC`.
pub(crate) fn claim_order(a: &Task, b: &Task) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.run_at.cmp(&b.run_at))
        .then_with(|| a.id.cmp(&b.id))
}

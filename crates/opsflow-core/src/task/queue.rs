// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task queue policy layer.
//!
//! [`TaskQueue`] owns ordering, leasing, retry backoff and dead-lettering.
//! It is stateless apart from its collaborators; all state lives in the
//! [`TaskStore`].
//!
//! Store errors are returned unchanged and never count as a task failure.
//! Methods that transition a task take it by reference and return the
//! updated copy only after the write succeeded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, Result};
use crate::persistence::TaskStore;

use super::backoff::BackoffPolicy;
use super::{NewTask, Task, TaskFilter, TaskStatus, TaskType};

/// Persistent priority queue with leases, retries and a dead-letter state.
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("store", &"...")
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl TaskQueue {
    /// Create a queue over `store` using the system clock and linear backoff.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the retry backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// The active backoff policy.
    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    // Stores may keep millisecond precision only.
    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(3)
    }

    /// Persist a new PENDING task.
    ///
    /// # Errors
    ///
    /// `ValidationError` if `max_retries` is negative.
    #[instrument(skip(self, new_task), fields(task_type = %new_task.task_type))]
    pub async fn create(&self, new_task: NewTask) -> Result<Task> {
        if new_task.max_retries < 0 {
            return Err(CoreError::validation(
                "max_retries",
                format!("must be >= 0, got {}", new_task.max_retries),
            ));
        }
        if new_task.task_type.as_str().is_empty() {
            return Err(CoreError::validation("type", "must not be empty"));
        }

        let now = self.now();
        let run_at = new_task
            .run_at
            .map(|at| at.trunc_subsecs(3).max(now))
            .unwrap_or(now);

        let task = Task {
            id: Uuid::now_v7().to_string(),
            task_type: new_task.task_type,
            payload: new_task.payload,
            status: TaskStatus::Pending,
            priority: new_task.priority,
            max_retries: new_task.max_retries,
            retry_count: 0,
            run_at,
            locked_until: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        };

        self.store.create_task(&task).await?;
        debug!(task_id = %task.id, priority = task.priority, "Task created");
        Ok(task)
    }

    /// Fetch a task.
    pub async fn get(&self, task_id: &str) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Claim the best due task of any type.
    pub async fn claim_next(&self, lease: Duration) -> Result<Option<Task>> {
        self.claim_next_of(lease, &[]).await
    }

    /// Claim the best due task whose type is in `task_types` (empty = any).
    ///
    /// Returns `Ok(None)` when nothing is eligible.
    pub async fn claim_next_of(
        &self,
        lease: Duration,
        task_types: &[TaskType],
    ) -> Result<Option<Task>> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| CoreError::validation("lease", e.to_string()))?;
        if lease <= chrono::Duration::zero() {
            return Err(CoreError::validation("lease", "must be greater than zero"));
        }

        let claimed = self.store.claim_next(self.now(), lease, task_types).await?;
        if let Some(ref task) = claimed {
            debug!(
                task_id = %task.id,
                task_type = %task.task_type,
                locked_until = ?task.locked_until,
                "Task claimed"
            );
        }
        Ok(claimed)
    }

    /// Mark a task as successfully finished.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn mark_completed(&self, task: &Task) -> Result<Task> {
        let now = self.now();
        let mut updated = task.clone();
        updated.status = TaskStatus::Completed;
        updated.locked_until = None;
        updated.completed_at = Some(now);
        updated.updated_at = now;

        self.store.update_task(&updated).await?;
        debug!("Task completed");
        Ok(updated)
    }

    /// Record a retryable failure.
    ///
    /// Increments `retry_count`. While it stays below `max_retries` the task
    /// returns to PENDING with `run_at` pushed out by the backoff policy;
    /// otherwise it goes DEAD.
    #[instrument(skip(self, task, error), fields(task_id = %task.id))]
    pub async fn mark_failed(&self, task: &Task, error: &str) -> Result<Task> {
        let now = self.now();
        let mut updated = task.clone();
        updated.retry_count = task.retry_count.saturating_add(1);
        updated.locked_until = None;
        updated.updated_at = now;
        updated.error = Some(error.to_string());

        if updated.retry_count < updated.max_retries {
            let delay = self.backoff.delay(updated.retry_count.max(0) as u32);
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
            let next_run = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
            updated.status = TaskStatus::Pending;
            // run_at never moves backwards across consecutive failures
            updated.run_at = next_run.max(task.run_at);

            self.store.update_task(&updated).await?;
            info!(
                retry_count = updated.retry_count,
                max_retries = updated.max_retries,
                run_at = %updated.run_at,
                error = %error,
                "Task failed, retry scheduled"
            );
        } else {
            updated.status = TaskStatus::Dead;
            updated.completed_at = Some(now);

            self.store.update_task(&updated).await?;
            warn!(
                retry_count = updated.retry_count,
                error = %error,
                "Task retries exhausted, moved to dead-letter"
            );
        }

        Ok(updated)
    }

    /// Record a non-retryable failure. The task goes FAILED without consuming a retry.
    #[instrument(skip(self, task, error), fields(task_id = %task.id))]
    pub async fn mark_failed_permanently(&self, task: &Task, error: &str) -> Result<Task> {
        let now = self.now();
        let mut updated = task.clone();
        updated.status = TaskStatus::Failed;
        updated.locked_until = None;
        updated.completed_at = Some(now);
        updated.updated_at = now;
        updated.error = Some(error.to_string());

        self.store.update_task(&updated).await?;
        warn!(error = %error, "Task failed permanently");
        Ok(updated)
    }

    /// Give a claimed task back without counting a failure.
    ///
    /// Used when a worker is cancelled mid-flight.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn release(&self, task: &Task) -> Result<Task> {
        let now = self.now();
        let mut updated = task.clone();
        updated.status = TaskStatus::Pending;
        updated.locked_until = None;
        updated.updated_at = now;

        self.store.update_task(&updated).await?;
        debug!("Task released");
        Ok(updated)
    }

    /// Reclaim every RUNNING task whose lease has expired.
    pub async fn release_expired(&self) -> Result<u64> {
        let released = self.store.release_expired(self.now()).await?;
        if released > 0 {
            info!(count = released, "Reclaimed tasks with expired leases");
        }
        Ok(released)
    }

    /// Put a DEAD or FAILED task back into the queue with a fresh retry budget.
    ///
    /// The last error message is kept for history.
    #[instrument(skip(self))]
    pub async fn retry_dead(&self, task_id: &str) -> Result<Task> {
        let task = self.get(task_id).await?;
        if !matches!(task.status, TaskStatus::Dead | TaskStatus::Failed) {
            return Err(CoreError::validation(
                "status",
                format!(
                    "only dead or failed tasks can be retried, task '{}' is {}",
                    task_id, task.status
                ),
            ));
        }

        let now = self.now();
        let mut updated = task;
        updated.status = TaskStatus::Pending;
        updated.retry_count = 0;
        updated.run_at = now;
        updated.completed_at = None;
        updated.locked_until = None;
        updated.updated_at = now;

        self.store.update_task(&updated).await?;
        info!("Task requeued from dead-letter");
        Ok(updated)
    }

    /// List tasks in claim order.
    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.store.list_tasks(filter).await
    }

    /// Delete a task.
    pub async fn delete(&self, task_id: &str) -> Result<bool> {
        self.store.delete_task(task_id).await
    }

    /// Delete COMPLETED tasks that finished more than `older_than` ago.
    ///
    /// DEAD and FAILED tasks are kept for inspection.
    pub async fn purge_completed(&self, older_than: Duration) -> Result<u64> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| CoreError::validation("older_than", e.to_string()))?;
        let cutoff = self.now() - age;

        let completed = self
            .store
            .list_tasks(&TaskFilter::with_status(TaskStatus::Completed))
            .await?;

        let mut purged = 0;
        for task in completed {
            if task.completed_at.is_some_and(|at| at < cutoff)
                && self.store.delete_task(&task.id).await?
            {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(count = purged, cutoff = %cutoff, "Purged completed tasks");
        }
        Ok(purged)
    }
}

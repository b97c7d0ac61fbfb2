// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool and lease reaper.
//!
//! Each worker repeatedly claims the best due task whose type has a
//! registered handler, runs the handler bounded by the lease duration and
//! records the outcome. An idle worker backs off from `poll_interval` up to
//! `max_poll_interval`.
//!
//! On shutdown the in-flight handler is dropped and its task released back
//! to PENDING. If the process dies instead, [`LeaseReaper`] reclaims the task
//! once its lease expires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;

use super::queue::TaskQueue;
use super::{Task, TaskType};

/// Outcome of a failed handler run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskHandlerError {
    /// Consumes a retry; the task is rescheduled with backoff.
    #[error("{0}")]
    Retryable(String),
    /// The task goes FAILED immediately.
    #[error("{0}")]
    Permanent(String),
}

/// Processes tasks of one type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task. `cancel` fires when the pool shuts down.
    async fn handle(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> std::result::Result<(), TaskHandlerError>;
}

/// Handlers keyed by task type.
#[derive(Default, Clone)]
pub struct TaskHandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for TaskHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler>,
    ) -> &mut Self {
        self.handlers.insert(task_type.into(), handler);
        self
    }

    pub fn with(mut self, task_type: impl Into<TaskType>, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(task_type, handler);
        self
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Registered types, sorted.
    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Lease taken on every claim; also bounds a handler run.
    pub lease_duration: Duration,
    /// Idle sleep after an empty claim.
    pub poll_interval: Duration,
    /// Cap for the doubling idle sleep.
    pub max_poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lease_duration: Duration::from_secs(300),
            poll_interval: Duration::from_millis(1000),
            max_poll_interval: Duration::from_millis(10_000),
        }
    }
}

impl From<&Config> for WorkerPoolConfig {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers,
            lease_duration: config.lease_duration,
            poll_interval: config.poll_interval,
            max_poll_interval: config.max_poll_interval,
        }
    }
}

/// Fixed-size pool of queue consumers.
pub struct TaskWorkerPool {
    queue: Arc<TaskQueue>,
    handlers: Arc<TaskHandlerRegistry>,
    config: WorkerPoolConfig,
    shutdown: CancellationToken,
}

impl TaskWorkerPool {
    pub fn new(
        queue: Arc<TaskQueue>,
        handlers: TaskHandlerRegistry,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            handlers: Arc::new(handlers),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops every worker when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the workers onto the current runtime.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        if self.handlers.is_empty() {
            warn!("Worker pool started without handlers; workers will stay idle");
        }
        info!(
            workers = self.config.workers,
            lease_secs = self.config.lease_duration.as_secs(),
            task_types = ?self.handlers.task_types(),
            "Task worker pool started"
        );

        (0..self.config.workers.max(1))
            .map(|worker_id| {
                let pool = Arc::clone(self);
                tokio::spawn(async move { pool.run_worker(worker_id).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker_id: usize) {
        let mut idle = self.config.poll_interval;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.process_next(worker_id).await {
                Ok(true) => {
                    idle = self.config.poll_interval;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to process task");
                }
            }

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
            idle = idle.saturating_mul(2).min(self.config.max_poll_interval);
        }

        debug!(worker_id, "Worker stopped");
    }

    /// Claim and process at most one task.
    ///
    /// Returns `Ok(false)` when nothing was claimable. Store errors are
    /// returned without touching the task further.
    pub async fn process_next(&self, worker_id: usize) -> Result<bool> {
        if self.handlers.is_empty() {
            return Ok(false);
        }

        let types = self.handlers.task_types();
        let Some(task) = self
            .queue
            .claim_next_of(self.config.lease_duration, &types)
            .await?
        else {
            return Ok(false);
        };

        let Some(handler) = self.handlers.get(&task.task_type) else {
            let message = format!("no handler for task type '{}'", task.task_type);
            self.queue.mark_failed_permanently(&task, &message).await?;
            return Ok(true);
        };

        debug!(worker_id, task_id = %task.id, task_type = %task.task_type, "Processing task");

        let cancel = self.shutdown.child_token();
        let lease = self.config.lease_duration;
        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(lease, handler.handle(&task, cancel.clone())) => Some(result),
        };

        match outcome {
            None => {
                self.queue.release(&task).await?;
                info!(worker_id, task_id = %task.id, "Task released on shutdown");
            }
            Some(Err(_elapsed)) => {
                let message = format!("handler exceeded lease of {:?}", lease);
                self.queue.mark_failed(&task, &message).await?;
            }
            Some(Ok(Ok(()))) => {
                self.queue.mark_completed(&task).await?;
            }
            Some(Ok(Err(TaskHandlerError::Retryable(message)))) => {
                self.queue.mark_failed(&task, &message).await?;
            }
            Some(Ok(Err(TaskHandlerError::Permanent(message)))) => {
                self.queue.mark_failed_permanently(&task, &message).await?;
            }
        }

        Ok(true)
    }

    /// Signal shutdown and wait for the given worker handles.
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>) {
        self.shutdown.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Task worker pool stopped");
    }
}

/// Periodically returns tasks with expired leases to PENDING.
pub struct LeaseReaper {
    queue: Arc<TaskQueue>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl LeaseReaper {
    pub fn new(queue: Arc<TaskQueue>, interval: Duration) -> Self {
        Self {
            queue,
            interval,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown is signalled.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "Lease reaper started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Lease reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.queue.release_expired().await {
                        error!(error = %e, "Failed to release expired leases");
                    }
                }
            }
        }

        info!("Lease reaper stopped");
    }
}

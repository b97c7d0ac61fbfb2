// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime.
//!
//! [`OpsRuntime`] runs the task worker pool and the lease reaper inside an
//! existing tokio application. When an orchestrator is supplied, executions
//! left RUNNING by a previous process are recovered on start.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use opsflow_core::persistence::SqlitePersistence;
//! use opsflow_core::runtime::OpsRuntime;
//! use opsflow_core::task::{MaintenanceHandler, TaskHandlerRegistry, TaskQueue};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqlitePersistence::connect("sqlite://opsflow.db?mode=rwc").await?);
//!     let queue = Arc::new(TaskQueue::new(store));
//!     let handlers = TaskHandlerRegistry::new()
//!         .with("maintenance", Arc::new(MaintenanceHandler::new(queue.clone())));
//!
//!     let runtime = OpsRuntime::builder()
//!         .queue(queue)
//!         .handlers(handlers)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::task::{LeaseReaper, TaskHandlerRegistry, TaskQueue, TaskWorkerPool, WorkerPoolConfig};
use crate::workflow::{ExecutionFilter, ExecutionStatus, WorkflowOrchestrator};

/// Builder for [`OpsRuntime`].
pub struct OpsRuntimeBuilder {
    queue: Option<Arc<TaskQueue>>,
    handlers: TaskHandlerRegistry,
    pool: WorkerPoolConfig,
    reaper_interval: Duration,
    orchestrator: Option<Arc<WorkflowOrchestrator>>,
}

impl std::fmt::Debug for OpsRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsRuntimeBuilder")
            .field("queue", &self.queue.as_ref().map(|_| "..."))
            .field("handlers", &self.handlers)
            .field("pool", &self.pool)
            .field("reaper_interval", &self.reaper_interval)
            .field("orchestrator", &self.orchestrator.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Default for OpsRuntimeBuilder {
    fn default() -> Self {
        Self {
            queue: None,
            handlers: TaskHandlerRegistry::new(),
            pool: WorkerPoolConfig::default(),
            reaper_interval: Duration::from_secs(30),
            orchestrator: None,
        }
    }
}

impl OpsRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the task queue (required).
    pub fn queue(mut self, queue: Arc<TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Handlers the worker pool dispatches to.
    pub fn handlers(mut self, handlers: TaskHandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn worker_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Default: 30 seconds
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Recover interrupted executions through `orchestrator` on start.
    pub fn orchestrator(mut self, orchestrator: Arc<WorkflowOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Take pool sizing and reaper period from a loaded [`Config`].
    pub fn with_config(self, config: &Config) -> Self {
        let interval = config.reaper_interval;
        self.worker_pool(WorkerPoolConfig::from(config))
            .reaper_interval(interval)
    }

    /// Returns an error if required fields are missing or invalid.
    pub fn build(self) -> Result<OpsRuntimeConfig> {
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue is required"))?;
        if self.pool.workers == 0 {
            anyhow::bail!("worker pool needs at least one worker");
        }
        if self.reaper_interval.is_zero() {
            anyhow::bail!("reaper interval must be greater than zero");
        }

        Ok(OpsRuntimeConfig {
            queue,
            handlers: self.handlers,
            pool: self.pool,
            reaper_interval: self.reaper_interval,
            orchestrator: self.orchestrator,
        })
    }
}

/// Validated configuration for an [`OpsRuntime`].
pub struct OpsRuntimeConfig {
    queue: Arc<TaskQueue>,
    handlers: TaskHandlerRegistry,
    pool: WorkerPoolConfig,
    reaper_interval: Duration,
    orchestrator: Option<Arc<WorkflowOrchestrator>>,
}

impl std::fmt::Debug for OpsRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsRuntimeConfig")
            .field("pool", &self.pool)
            .field("reaper_interval", &self.reaper_interval)
            .finish()
    }
}

impl OpsRuntimeConfig {
    /// Spawn the worker pool, the lease reaper and execution recovery.
    pub async fn start(self) -> Result<OpsRuntime> {
        let pool = Arc::new(TaskWorkerPool::new(
            self.queue.clone(),
            self.handlers,
            self.pool,
        ));
        let worker_handles = pool.spawn();

        let reaper = LeaseReaper::new(self.queue.clone(), self.reaper_interval);
        let reaper_shutdown = reaper.shutdown_handle();
        let reaper_handle = tokio::spawn(async move { reaper.run().await });

        let recovery_shutdown = CancellationToken::new();
        let recovery_handle = self
            .orchestrator
            .clone()
            .map(|orchestrator| spawn_recovery(orchestrator, recovery_shutdown.clone()));

        info!("OpsRuntime started");

        Ok(OpsRuntime {
            queue: self.queue,
            orchestrator: self.orchestrator,
            pool,
            worker_handles,
            reaper_shutdown,
            reaper_handle,
            recovery_shutdown,
            recovery_handle,
        })
    }
}

/// Re-drive every execution a previous process left RUNNING.
fn spawn_recovery(
    orchestrator: Arc<WorkflowOrchestrator>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let filter = ExecutionFilter {
            status: Some(ExecutionStatus::Running),
            ..Default::default()
        };
        let interrupted = match orchestrator.list_executions(&filter).await {
            Ok(list) => list,
            Err(e) => {
                error!(error = %e, "Failed to list interrupted executions");
                return;
            }
        };
        if interrupted.is_empty() {
            return;
        }
        info!(count = interrupted.len(), "Recovering interrupted executions");

        // The parent re-runs its workflow step with a fresh child, so the
        // interrupted child is abandoned.
        let (children, roots): (Vec<_>, Vec<_>) = interrupted
            .into_iter()
            .partition(|e| e.parent_execution_id.is_some());
        for child in children {
            if let Err(e) = orchestrator.cancel(&child.id).await {
                warn!(execution_id = %child.id, error = %e, "Failed to cancel orphaned sub-workflow");
            }
        }

        let recoveries = roots
            .into_iter()
            .map(|execution| {
                let orchestrator = orchestrator.clone();
                async move {
                    match orchestrator.recover(&execution.id).await {
                        Ok(done) => {
                            info!(execution_id = %done.id, status = %done.status, "Execution recovered")
                        }
                        Err(e) => {
                            error!(execution_id = %execution.id, error = %e, "Execution recovery failed")
                        }
                    }
                }
            });

        tokio::select! {
            _ = shutdown.cancelled() => {
                warn!("Shutdown interrupted execution recovery");
            }
            _ = futures::future::join_all(recoveries) => {}
        }
    })
}

/// A running worker node embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct OpsRuntime {
    queue: Arc<TaskQueue>,
    orchestrator: Option<Arc<WorkflowOrchestrator>>,
    pool: Arc<TaskWorkerPool>,
    worker_handles: Vec<JoinHandle<()>>,
    reaper_shutdown: CancellationToken,
    reaper_handle: JoinHandle<()>,
    recovery_shutdown: CancellationToken,
    recovery_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for OpsRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsRuntime")
            .field("workers", &self.worker_handles.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl OpsRuntime {
    pub fn builder() -> OpsRuntimeBuilder {
        OpsRuntimeBuilder::new()
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn orchestrator(&self) -> Option<&Arc<WorkflowOrchestrator>> {
        self.orchestrator.as_ref()
    }

    /// Whether any worker is still alive.
    pub fn is_running(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }

    /// Stop workers (releasing their in-flight tasks), the reaper and recovery.
    pub async fn shutdown(self) -> Result<()> {
        info!("OpsRuntime shutting down...");

        self.recovery_shutdown.cancel();
        self.reaper_shutdown.cancel();
        self.pool.shutdown(self.worker_handles).await;

        if let Err(e) = self.reaper_handle.await {
            error!("Lease reaper task panicked: {}", e);
            return Err(anyhow::anyhow!("lease reaper panicked: {}", e));
        }
        if let Some(handle) = self.recovery_handle {
            if let Err(e) = handle.await {
                error!("Recovery task panicked: {}", e);
                return Err(anyhow::anyhow!("recovery task panicked: {}", e));
            }
        }

        info!("OpsRuntime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;

    fn queue() -> Arc<TaskQueue> {
        Arc::new(TaskQueue::new(Arc::new(MemoryPersistence::new())))
    }

    #[test]
    fn test_builder_requires_queue() {
        let err = OpsRuntime::builder().build().unwrap_err();
        assert!(err.to_string().contains("queue is required"));
    }

    #[test]
    fn test_builder_rejects_zero_workers() {
        let result = OpsRuntime::builder()
            .queue(queue())
            .worker_pool(WorkerPoolConfig {
                workers: 0,
                ..Default::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_debug_hides_queue() {
        let builder = OpsRuntime::builder().queue(queue());
        let debug = format!("{:?}", builder);
        assert!(debug.contains("OpsRuntimeBuilder"));
        assert!(debug.contains("..."));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let runtime = OpsRuntime::builder()
            .queue(queue())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        assert!(runtime.is_running());
        runtime.shutdown().await.unwrap();
    }
}

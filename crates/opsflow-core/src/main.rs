// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! opsflow worker node.
//!
//! Connects to the SQLite store, runs the task worker pool with the built-in
//! maintenance handler and the lease reaper, and recovers workflow
//! executions interrupted by a previous shutdown.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use opsflow_core::config::Config;
use opsflow_core::persistence::SqlitePersistence;
use opsflow_core::runtime::OpsRuntime;
use opsflow_core::task::{MaintenanceHandler, TaskHandlerRegistry, TaskQueue, TaskType};
use opsflow_core::workflow::{
    ExecutorRegistry, OrchestratorConfig, StepType, TaskStepExecutor, WorkflowOrchestrator,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("opsflow_core=info".parse()?),
        )
        .init();

    info!("Starting opsflow worker node");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        workers = config.workers,
        lease_secs = config.lease_duration.as_secs(),
        reaper_interval_secs = config.reaper_interval.as_secs(),
        backoff = ?config.backoff,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let store = Arc::new(SqlitePersistence::connect(&config.database_url).await?);
    info!("Database ready, migrations applied");

    let queue = Arc::new(TaskQueue::new(store.clone()).with_backoff(config.backoff));

    let handlers = TaskHandlerRegistry::new().with(
        TaskType::Maintenance,
        Arc::new(MaintenanceHandler::new(queue.clone())),
    );

    let executors = ExecutorRegistry::new().with(
        StepType::Task,
        Arc::new(TaskStepExecutor::new(queue.clone())),
    );
    let orchestrator = Arc::new(
        WorkflowOrchestrator::new(store.clone(), store.clone(), executors).with_config(
            OrchestratorConfig {
                max_parallel_steps: config.max_parallel_steps,
                ..Default::default()
            },
        ),
    );

    let runtime = OpsRuntime::builder()
        .queue(queue)
        .handlers(handlers)
        .with_config(&config)
        .orchestrator(orchestrator)
        .build()?
        .start()
        .await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    store.pool().close().await;
    info!("Shutdown complete");

    Ok(())
}

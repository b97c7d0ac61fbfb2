// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! opsflow core - durable task queue and DAG workflow orchestrator
//!
//! This crate provides the durable execution subsystem of opsflow: a
//! crash-safe task queue that concurrent workers dequeue from with leases,
//! and a workflow orchestrator that runs DAGs of steps with checkpoints.
//! All state is persisted through store traits; SQLite and in-memory
//! backends are included.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐        ┌──────────────────────────────┐
//! │     WorkflowOrchestrator     │        │        TaskWorkerPool        │
//! │  resolver → dispatch → ckpt  │        │   claim → handle → record    │
//! └──────────────┬───────────────┘        └──────────────┬───────────────┘
//!                │ StepExecutor                          │ TaskHandler
//!                ▼                                       │
//! ┌──────────────────────────────┐  enqueue              │
//! │       TaskStepExecutor       │───────────┐           │
//! └──────────────────────────────┘           ▼           ▼
//!                │                  ┌──────────────────────────────┐
//!                │                  │          TaskQueue           │◄── LeaseReaper
//!                │                  │  order, lease, backoff, DLQ  │
//!                │                  └──────────────┬───────────────┘
//!                ▼                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  WorkflowDefinitionStore / WorkflowExecutionStore / TaskStore    │
//! │              (SqlitePersistence, MemoryPersistence)              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Execution Status State Machine
//!
//! ```text
//!                     ┌─────────┐
//!                     │ PENDING │
//!                     └────┬────┘
//!                          │ start
//!                          ▼
//!     ┌────────┐  pause┌─────────┐
//!     │ PAUSED │◄──────│ RUNNING │──────────────┐
//!     └───┬────┘       └────┬────┘              │
//!         │ resume          │                   │ cancel
//!         └───────►─────────┤                   ▼
//!                     ┌─────┴──────┐      ┌───────────┐
//!                 all steps    blocking   │ CANCELLED │
//!                 resolved     failure    └───────────┘
//!                     │            │
//!                     ▼            ▼
//!              ┌───────────┐  ┌────────┐
//!              │ COMPLETED │  │ FAILED │
//!              └───────────┘  └────────┘
//! ```
//!
//! | Status | Description |
//! |--------|-------------|
//! | `PENDING` | Created, not yet started |
//! | `RUNNING` | Ready steps are being dispatched |
//! | `PAUSED` | No new steps are dispatched; in-flight steps finish |
//! | `COMPLETED` | Every step resolved without a blocking failure |
//! | `FAILED` | A step failed without `continue_on_error`, or the workflow timed out |
//! | `CANCELLED` | Cancelled by a caller; completed steps are kept |
//!
//! The task state machine is documented in [`task`].
//!
//! # Configuration
//!
//! The `opsflow-core` binary reads [`config::Config`] from the environment
//! (`OPSFLOW_DATABASE_URL` is the only required variable).
//!
//! # Modules
//!
//! - [`config`]: Worker node configuration from environment variables
//! - [`error`]: Error types with stable error codes
//! - [`persistence`]: Store traits and the SQLite / in-memory backends
//! - [`task`]: Task entity, queue, worker pool and lease reaper
//! - [`workflow`]: Definitions, dependency resolution, executions, orchestrator
//! - [`runtime`]: Embeddable runtime wiring the pool and the reaper

/// Injectable time source.
pub mod clock;

/// Worker node configuration loaded from environment variables.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Store traits and their SQLite and in-memory implementations.
pub mod persistence;

/// Embeddable runtime (worker pool, lease reaper, execution recovery).
pub mod runtime;

/// Durable task queue.
pub mod task;

/// DAG workflow orchestration.
pub mod workflow;

pub use error::{CoreError, Result};

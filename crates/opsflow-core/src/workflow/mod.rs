// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DAG workflows: definitions, dependency resolution, executions and the
//! orchestrator that drives them.

pub mod condition;
pub mod definition;
pub mod dependency;
pub mod execution;
pub mod executor;
pub mod orchestrator;

pub use self::definition::{StepType, WorkflowDefinition, WorkflowStep};
pub use self::dependency::{BlockedStep, DependencyGraph, DependencyResolver, Resolution};
pub use self::execution::{
    ExecutionFilter, ExecutionStatus, StepExecution, StepStatus, WorkflowExecution,
};
pub use self::executor::{
    ExecutorRegistry, StepContext, StepError, StepExecutor, TaskStepExecutor,
};
pub use self::orchestrator::{OrchestratorConfig, WorkflowOrchestrator};

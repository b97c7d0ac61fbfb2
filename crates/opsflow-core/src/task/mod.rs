// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task entity and its lease/retry state machine.
//!
//! ```text
//!            create
//!              │
//!              ▼
//!         ┌─────────┐  release / lease expired   ┌─────────┐
//!    ┌───►│ PENDING │◄───────────────────────────│ RUNNING │
//!    │    └────┬────┘                            └────┬────┘
//!    │         │ claim_next                           │
//!    │         └──────────────────────────────────────┤
//!    │  mark_failed (retries left)                    │
//!    └────────────────────────────────────────────────┤
//!                                                     │
//!               ┌───────────────┬─────────────────────┼──────────────┐
//!               │ mark_completed│ mark_failed         │ mark_failed_ │
//!               ▼               │ (exhausted)         │ permanently  │
//!         ┌───────────┐         ▼                     ▼              │
//!         │ COMPLETED │     ┌──────┐             ┌────────┐          │
//!         └───────────┘     │ DEAD │             │ FAILED │◄─────────┘
//!                           └──────┘             └────────┘
//! ```

pub mod backoff;
pub mod maintenance;
pub mod queue;
pub mod worker;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub use self::backoff::BackoffPolicy;
pub use self::maintenance::MaintenanceHandler;
pub use self::queue::TaskQueue;
pub use self::worker::{
    LeaseReaper, TaskHandler, TaskHandlerError, TaskHandlerRegistry, TaskWorkerPool,
    WorkerPoolConfig,
};

/// Kind of deferred work. Unknown names are kept as [`TaskType::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskType {
    /// Run an AI analysis job.
    AiAnalysis,
    /// Ingest a batch of metric samples.
    MetricIngest,
    /// Invoke a plugin.
    PluginExec,
    /// Housekeeping work.
    Maintenance,
    /// Downsample stored series.
    Downsample,
    /// Any other task type.
    Custom(String),
}

impl TaskType {
    /// Wire name of this type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::AiAnalysis => "ai_analysis",
            Self::MetricIngest => "metric_ingest",
            Self::PluginExec => "plugin_exec",
            Self::Maintenance => "maintenance",
            Self::Downsample => "downsample",
            Self::Custom(name) => name,
        }
    }
}

impl From<&str> for TaskType {
    fn from(value: &str) -> Self {
        match value {
            "ai_analysis" => Self::AiAnalysis,
            "metric_ingest" => Self::MetricIngest,
            "plugin_exec" => Self::PluginExec,
            "maintenance" => Self::Maintenance,
            "downsample" => Self::Downsample,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TaskType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(TaskType::from(name.as_str()))
    }
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting to be claimed once `run_at` has passed.
    Pending,
    /// Leased to a worker until `locked_until`.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed with a non-retryable error.
    Failed,
    /// Retries exhausted (dead-letter).
    Dead,
}

impl TaskStatus {
    /// Wire name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    /// No further transitions happen without manual intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Dead)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// A unit of deferred, retryable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Time-ordered identifier (UUID v7).
    pub id: String,
    /// What kind of work this is.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Opaque arguments for the handler.
    pub payload: BTreeMap<String, Value>,
    /// Current status.
    pub status: TaskStatus,
    /// Higher runs first.
    pub priority: i32,
    /// Number of failures tolerated before the task goes DEAD.
    pub max_retries: i32,
    /// Number of failures so far.
    pub retry_count: i32,
    /// Not eligible for claiming before this time.
    pub run_at: DateTime<Utc>,
    /// Lease expiry, set only while RUNNING.
    pub locked_until: Option<DateTime<Utc>>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last failure message.
    pub error: Option<String>,
}

impl Task {
    /// Eligible for claiming at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.run_at <= now
    }

    /// Running with a lease that ended before `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Running && self.locked_until.is_some_and(|until| until < now)
    }
}

/// Parameters for [`TaskQueue::create`].
#[derive(Debug, Clone)]
pub struct NewTask {
    /// What kind of work this is.
    pub task_type: TaskType,
    /// Opaque arguments for the handler.
    pub payload: BTreeMap<String, Value>,
    /// Higher runs first.
    pub priority: i32,
    /// Failures tolerated before dead-lettering.
    pub max_retries: i32,
    /// Earliest run time; `None` means now.
    pub run_at: Option<DateTime<Utc>>,
}

impl NewTask {
    /// New task of the given type with default priority 0 and 3 retries.
    pub fn new(task_type: impl Into<TaskType>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: BTreeMap::new(),
            priority: 0,
            max_retries: 3,
            run_at: None,
        }
    }

    /// Set a payload entry.
    pub fn with_payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay the task until `run_at`.
    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        TaskType::from(value.as_str())
    }
}

/// Filter for listing tasks. Results use claim ordering.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Only tasks with this status.
    pub status: Option<TaskStatus>,
    /// Only tasks of this type.
    pub task_type: Option<TaskType>,
    /// Maximum number of rows.
    pub limit: Option<i64>,
    /// Rows to skip.
    pub offset: i64,
}

impl TaskFilter {
    /// Filter by status.
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_round_trips_known_and_custom_names() {
        for name in [
            "ai_analysis",
            "metric_ingest",
            "plugin_exec",
            "maintenance",
            "downsample",
            "alert_digest",
        ] {
            assert_eq!(TaskType::from(name).as_str(), name);
        }
        assert_eq!(
            TaskType::from("alert_digest"),
            TaskType::Custom("alert_digest".to_string())
        );
    }

    #[test]
    fn test_task_type_serializes_as_string() {
        let json = serde_json::to_string(&TaskType::MetricIngest).unwrap();
        assert_eq!(json, "\"metric_ingest\"");
        let parsed: TaskType = serde_json::from_str("\"rollup\"").unwrap();
        assert_eq!(parsed, TaskType::Custom("rollup".to_string()));
    }

    #[test]
    fn test_status_parse_and_terminal() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Dead,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("paused".parse::<TaskStatus>().is_err());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Dead.is_terminal());
    }
}

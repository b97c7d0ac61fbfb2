// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in handler for `maintenance` tasks.
//!
//! The payload `action` selects the job:
//!
//! | Action | Payload | Effect |
//! |--------|---------|--------|
//! | `release_expired` | - | Reclaim RUNNING tasks whose lease ended |
//! | `purge_completed` | `older_than_secs` (default 7 days) | Delete old COMPLETED tasks |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::queue::TaskQueue;
use super::worker::{TaskHandler, TaskHandlerError};
use super::Task;

const DEFAULT_PURGE_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

/// Runs housekeeping against the queue it is registered on.
pub struct MaintenanceHandler {
    queue: Arc<TaskQueue>,
}

impl MaintenanceHandler {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl TaskHandler for MaintenanceHandler {
    async fn handle(&self, task: &Task, _cancel: CancellationToken) -> Result<(), TaskHandlerError> {
        let action = task
            .payload
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TaskHandlerError::Permanent("missing 'action' in payload".into()))?;

        // store errors are transient from the task's point of view
        let retryable = |e: crate::error::CoreError| TaskHandlerError::Retryable(e.to_string());

        match action {
            "release_expired" => {
                let released = self.queue.release_expired().await.map_err(retryable)?;
                info!(task_id = %task.id, released, "Maintenance: released expired leases");
            }
            "purge_completed" => {
                let older_than = task
                    .payload
                    .get("older_than_secs")
                    .and_then(|v| v.as_u64())
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_PURGE_AGE);
                let purged = self
                    .queue
                    .purge_completed(older_than)
                    .await
                    .map_err(retryable)?;
                info!(task_id = %task.id, purged, "Maintenance: purged completed tasks");
            }
            other => {
                return Err(TaskHandlerError::Permanent(format!(
                    "unknown maintenance action '{}'",
                    other
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::task::{NewTask, TaskType};
    use serde_json::json;

    fn handler() -> (MaintenanceHandler, Arc<TaskQueue>) {
        let queue = Arc::new(TaskQueue::new(Arc::new(MemoryPersistence::new())));
        (MaintenanceHandler::new(queue.clone()), queue)
    }

    #[tokio::test]
    async fn test_unknown_action_is_permanent() {
        let (handler, queue) = handler();
        let task = queue
            .create(NewTask::new(TaskType::Maintenance).with_payload("action", json!("vacuum")))
            .await
            .unwrap();
        let err = handler
            .handle(&task, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskHandlerError::Permanent(ref m) if m.contains("vacuum")));
    }

    #[tokio::test]
    async fn test_missing_action_is_permanent() {
        let (handler, queue) = handler();
        let task = queue.create(NewTask::new(TaskType::Maintenance)).await.unwrap();
        assert!(matches!(
            handler.handle(&task, CancellationToken::new()).await,
            Err(TaskHandlerError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn test_release_expired_action() {
        let (handler, queue) = handler();
        let task = queue
            .create(
                NewTask::new(TaskType::Maintenance).with_payload("action", json!("release_expired")),
            )
            .await
            .unwrap();
        handler
            .handle(&task, CancellationToken::new())
            .await
            .unwrap();
    }
}

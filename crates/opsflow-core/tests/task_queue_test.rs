// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue properties checked against both store backends.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;

use common::*;
use opsflow_core::clock::Clock;
use opsflow_core::error::CoreError;
use opsflow_core::persistence::{MemoryPersistence, SqlitePersistence, TaskStore};
use opsflow_core::task::{NewTask, Task, TaskFilter, TaskQueue, TaskStatus, TaskType};

const LEASE: Duration = Duration::from_secs(30);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_task_claimed_by_exactly_one_worker() {
    for backend in BACKENDS {
        let queue = Arc::new(TaskQueue::new(task_store(backend).await));
        let task = queue.create(NewTask::new(TaskType::Downsample)).await.unwrap();

        let claims = (0..16).map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim_next(LEASE).await.unwrap() })
        });
        let winners: Vec<Task> = join_all(claims)
            .await
            .into_iter()
            .filter_map(|r| r.unwrap())
            .collect();

        assert_eq!(winners.len(), 1, "{:?}: expected a single claimant", backend);
        assert_eq!(winners[0].id, task.id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_share_a_task() {
    for backend in BACKENDS {
        let queue = Arc::new(TaskQueue::new(task_store(backend).await));
        for i in 0..20 {
            queue
                .create(NewTask::new(TaskType::MetricIngest).with_priority(i % 3))
                .await
                .unwrap();
        }

        let claims = (0..32).map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim_next(LEASE).await.unwrap() })
        });
        let claimed: Vec<String> = join_all(claims)
            .await
            .into_iter()
            .filter_map(|r| r.unwrap())
            .map(|t| t.id)
            .collect();

        let unique: HashSet<&String> = claimed.iter().collect();
        assert_eq!(claimed.len(), 20, "{:?}", backend);
        assert_eq!(unique.len(), claimed.len(), "{:?}: duplicate claim", backend);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_backed_sqlite_claims_are_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        SqlitePersistence::from_path(dir.path().join("data").join("queue.db"))
            .await
            .unwrap(),
    );
    let queue = Arc::new(TaskQueue::new(store));
    for _ in 0..10 {
        queue.create(NewTask::new(TaskType::PluginExec)).await.unwrap();
    }

    let claims = (0..8).map(|_| {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(task) = queue.claim_next(LEASE).await.unwrap() {
                mine.push(task.id.clone());
                queue.mark_completed(&task).await.unwrap();
            }
            mine
        })
    });
    let all: Vec<String> = join_all(claims)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();

    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), 10);
    assert_eq!(unique.len(), 10);

    let completed = queue
        .list(&TaskFilter::with_status(TaskStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 10);
}

#[tokio::test]
async fn test_claim_order_priority_then_run_at_then_id() {
    for backend in BACKENDS {
        let (queue, clock) = manual_queue(backend).await;
        let now = clock.now();

        let old_low = queue
            .create(NewTask::new(TaskType::Maintenance).with_priority(1))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let new_high = queue
            .create(NewTask::new(TaskType::Maintenance).with_priority(9))
            .await
            .unwrap();
        let new_low = queue
            .create(NewTask::new(TaskType::Maintenance).with_priority(1))
            .await
            .unwrap();
        let future_high = queue
            .create(
                NewTask::new(TaskType::Maintenance)
                    .with_priority(99)
                    .run_at(now + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();

        let mut order = Vec::new();
        while let Some(task) = queue.claim_next(LEASE).await.unwrap() {
            order.push(task.id);
        }
        assert_eq!(
            order,
            vec![new_high.id, old_low.id, new_low.id],
            "{:?}: claim order",
            backend
        );

        let listed: Vec<String> = queue
            .list(&TaskFilter::with_status(TaskStatus::Pending))
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(listed, vec![future_high.id]);
    }
}

#[tokio::test]
async fn test_claim_filters_by_task_type() {
    for backend in BACKENDS {
        let (queue, _) = manual_queue(backend).await;
        queue.create(NewTask::new(TaskType::AiAnalysis)).await.unwrap();
        let rollup = queue
            .create(NewTask::new("alert_digest").with_priority(-5))
            .await
            .unwrap();

        let claimed = queue
            .claim_next_of(LEASE, &[TaskType::from("alert_digest")])
            .await
            .unwrap()
            .expect("custom type should be claimable");
        assert_eq!(claimed.id, rollup.id);
        assert_eq!(claimed.task_type, TaskType::Custom("alert_digest".into()));
        assert!(
            queue
                .claim_next_of(LEASE, &[TaskType::Downsample])
                .await
                .unwrap()
                .is_none()
        );
    }
}

#[tokio::test]
async fn test_backoff_law_then_dead_letter() {
    for backend in BACKENDS {
        let (queue, clock) = manual_queue(backend).await;
        let created = queue
            .create(NewTask::new(TaskType::PluginExec).with_max_retries(3))
            .await
            .unwrap();

        let mut previous_run_at = created.run_at;
        for k in 1..=3 {
            let claimed = queue
                .claim_next(LEASE)
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("{:?}: task due for attempt {}", backend, k));
            let failed_at = clock.now();
            let failed = queue.mark_failed(&claimed, "plugin crashed").await.unwrap();

            assert_eq!(failed.retry_count, k);
            assert!(failed.locked_until.is_none());
            assert!(failed.run_at >= previous_run_at, "run_at moved backwards");
            previous_run_at = failed.run_at;

            if k < 3 {
                assert_eq!(failed.status, TaskStatus::Pending);
                assert!(failed.run_at >= failed_at + chrono::Duration::minutes(k as i64));
                // not due a moment before the backoff elapses
                clock.set(failed.run_at - chrono::Duration::milliseconds(1));
                assert!(queue.claim_next(LEASE).await.unwrap().is_none());
                clock.set(failed.run_at);
            } else {
                assert_eq!(failed.status, TaskStatus::Dead);
                assert!(failed.completed_at.is_some());
            }
        }

        let stored = queue.get(&created.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Dead);
        assert_eq!(stored.retry_count, 3);
        assert_eq!(stored.error.as_deref(), Some("plugin crashed"));

        clock.advance(chrono::Duration::days(1));
        assert!(queue.claim_next(LEASE).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_lease_reclaimed_only_after_expiry() {
    for backend in BACKENDS {
        let (queue, clock) = manual_queue(backend).await;
        queue.create(NewTask::new(TaskType::MetricIngest)).await.unwrap();

        let claimed = queue.claim_next(LEASE).await.unwrap().unwrap();
        let lease_end = claimed.locked_until.unwrap();

        clock.set(lease_end);
        assert_eq!(queue.release_expired().await.unwrap(), 0, "{:?}", backend);
        assert_eq!(queue.get(&claimed.id).await.unwrap().status, TaskStatus::Running);

        clock.advance(chrono::Duration::milliseconds(1));
        assert_eq!(queue.release_expired().await.unwrap(), 1);
        let reclaimed = queue.get(&claimed.id).await.unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Pending);
        assert!(reclaimed.locked_until.is_none());
        assert_eq!(reclaimed.retry_count, 0);

        let again = queue.claim_next(LEASE).await.unwrap().unwrap();
        assert_eq!(again.id, claimed.id);
    }
}

#[tokio::test]
async fn test_pagination_and_delete() {
    for backend in BACKENDS {
        let (queue, _) = manual_queue(backend).await;
        let mut ids = Vec::new();
        for priority in [5, 4, 3, 2, 1] {
            ids.push(
                queue
                    .create(NewTask::new(TaskType::Downsample).with_priority(priority))
                    .await
                    .unwrap()
                    .id,
            );
        }

        let page: Vec<String> = queue
            .list(&TaskFilter {
                limit: Some(2),
                offset: 1,
                ..Default::default()
            })
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(page, ids[1..3].to_vec(), "{:?}", backend);

        assert!(queue.delete(&ids[0]).await.unwrap());
        assert!(!queue.delete(&ids[0]).await.unwrap());
        assert_eq!(queue.list(&TaskFilter::default()).await.unwrap().len(), 4);
    }
}

/// Store that fails every update, for checking that errors never change tasks.
struct FailingUpdates {
    inner: MemoryPersistence,
}

#[async_trait]
impl TaskStore for FailingUpdates {
    async fn create_task(&self, task: &Task) -> Result<(), CoreError> {
        self.inner.create_task(task).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, CoreError> {
        self.inner.get_task(task_id).await
    }

    async fn update_task(&self, _task: &Task) -> Result<(), CoreError> {
        Err(CoreError::database("update_task", "disk I/O error"))
    }

    async fn delete_task(&self, task_id: &str) -> Result<bool, CoreError> {
        self.inner.delete_task(task_id).await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, CoreError> {
        self.inner.list_tasks(filter).await
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: chrono::Duration,
        task_types: &[TaskType],
    ) -> Result<Option<Task>, CoreError> {
        self.inner.claim_next(now, lease, task_types).await
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        self.inner.release_expired(now).await
    }
}

#[tokio::test]
async fn test_store_failure_leaves_task_untouched() {
    let queue = TaskQueue::new(Arc::new(FailingUpdates {
        inner: MemoryPersistence::new(),
    }));
    queue
        .create(NewTask::new(TaskType::AiAnalysis).with_max_retries(1))
        .await
        .unwrap();
    let claimed = queue.claim_next(LEASE).await.unwrap().unwrap();

    let err = queue.mark_failed(&claimed, "model timeout").await.unwrap_err();
    assert!(err.is_infrastructure());
    assert_eq!(err.error_code(), "DATABASE_ERROR");

    let stored = queue.get(&claimed.id).await.unwrap();
    assert_eq!(stored, claimed);
    assert_eq!(stored.retry_count, 0);
    assert!(stored.error.is_none());

    assert!(queue.mark_completed(&claimed).await.is_err());
    assert_eq!(queue.get(&claimed.id).await.unwrap().status, TaskStatus::Running);
}

#[tokio::test]
async fn test_retry_dead_redrives_on_both_backends() {
    for backend in BACKENDS {
        let (queue, _) = manual_queue(backend).await;
        queue
            .create(NewTask::new(TaskType::PluginExec).with_max_retries(0))
            .await
            .unwrap();
        let claimed = queue.claim_next(LEASE).await.unwrap().unwrap();
        queue.mark_failed(&claimed, "exit 1").await.unwrap();

        let revived = queue.retry_dead(&claimed.id).await.unwrap();
        assert_eq!(revived.status, TaskStatus::Pending);
        assert!(revived.completed_at.is_none());
        assert_eq!(queue.get(&claimed.id).await.unwrap(), revived, "{:?}", backend);
        assert!(queue.claim_next(LEASE).await.unwrap().is_some());
    }
}

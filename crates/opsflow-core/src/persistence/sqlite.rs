// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Timestamps are stored as INTEGER epoch milliseconds so claim ordering and
//! lease comparisons are plain integer comparisons.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::CoreError;
use crate::migrations::SQLITE as MIGRATOR;
use crate::task::{Task, TaskFilter, TaskStatus, TaskType};
use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::execution::{ExecutionFilter, WorkflowExecution};

use super::{TaskStore, WorkflowDefinitionStore, WorkflowExecutionStore};

const TASK_COLUMNS: &str = "id, task_type, payload, status, priority, max_retries, retry_count, \
     run_at, locked_until, created_at, updated_at, completed_at, error";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqlitePersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePersistence")
            .field("connections", &self.pool.size())
            .finish()
    }
}

impl SqlitePersistence {
    /// Wrap an existing pool. Migrations must already have been applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open (creating if needed) a database file and apply migrations.
    ///
    /// Parent directories are created as required.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::database(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        Self::connect(&format!("sqlite:{}", path.to_string_lossy())).await
    }

    /// Connect to a SQLite URL and apply migrations.
    ///
    /// File databases use WAL journaling and a busy timeout so that
    /// concurrent claimers wait for the write lock instead of failing.
    /// `sqlite::memory:` gets a single connection.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CoreError::database("connect", format!("Invalid SQLite URL: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(StdDuration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            // closing the only connection drops the database
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| {
                CoreError::database("connect", format!("Failed to connect to SQLite: {}", e))
            })?;

        MIGRATOR.run(&pool).await.map_err(|e| {
            CoreError::database("migrate", format!("Failed to run migrations: {}", e))
        })?;

        debug!(in_memory, "SQLite persistence ready");
        Ok(Self { pool })
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, CoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CoreError::database("decode", format!("timestamp out of range: {}", ms)))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: String,
    task_type: String,
    payload: String,
    status: String,
    priority: i64,
    max_retries: i64,
    retry_count: i64,
    run_at: i64,
    locked_until: Option<i64>,
    created_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
    error: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = CoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            status: TaskStatus::from_str(&row.status)
                .map_err(|e| CoreError::database("decode", e))?,
            task_type: TaskType::from(row.task_type),
            payload: serde_json::from_str(&row.payload)?,
            priority: row.priority as i32,
            max_retries: row.max_retries as i32,
            retry_count: row.retry_count as i32,
            run_at: from_millis(row.run_at)?,
            locked_until: row.locked_until.map(from_millis).transpose()?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            completed_at: row.completed_at.map(from_millis).transpose()?,
            error: row.error,
            id: row.id,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    document: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    document: String,
    checkpoint: Option<Vec<u8>>,
}

impl TryFrom<ExecutionRow> for WorkflowExecution {
    type Error = CoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let mut execution: WorkflowExecution = serde_json::from_str(&row.document)?;
        execution.checkpoint = row.checkpoint;
        Ok(execution)
    }
}

// ============================================================================
// Tasks
// ============================================================================

#[async_trait::async_trait]
impl TaskStore for SqlitePersistence {
    async fn create_task(&self, task: &Task) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, payload, status, priority, max_retries,
                               retry_count, run_at, locked_until, created_at, updated_at,
                               completed_at, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(task.task_type.as_str())
        .bind(serde_json::to_string(&task.payload)?)
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.max_retries)
        .bind(task.retry_count)
        .bind(to_millis(task.run_at))
        .bind(task.locked_until.map(to_millis))
        .bind(to_millis(task.created_at))
        .bind(to_millis(task.updated_at))
        .bind(task.completed_at.map(to_millis))
        .bind(&task.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, CoreError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE id = ?",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Task::try_from).transpose()
    }

    async fn update_task(&self, task: &Task) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET task_type = ?, payload = ?, status = ?, priority = ?, max_retries = ?,
                retry_count = ?, run_at = ?, locked_until = ?, updated_at = ?,
                completed_at = ?, error = ?
            WHERE id = ?
            "#,
        )
        .bind(task.task_type.as_str())
        .bind(serde_json::to_string(&task.payload)?)
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.max_retries)
        .bind(task.retry_count)
        .bind(to_millis(task.run_at))
        .bind(task.locked_until.map(to_millis))
        .bind(to_millis(task.updated_at))
        .bind(task.completed_at.map(to_millis))
        .bind(&task.error)
        .bind(&task.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::TaskNotFound {
                task_id: task.id.clone(),
            });
        }
        Ok(())
    }

    async fn delete_task(&self, task_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, CoreError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM tasks WHERE 1 = 1", TASK_COLUMNS));
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(task_type) = &filter.task_type {
            qb.push(" AND task_type = ")
                .push_bind(task_type.as_str().to_string());
        }
        qb.push(" ORDER BY priority DESC, run_at ASC, id ASC");
        qb.push(" LIMIT ").push_bind(filter.limit.unwrap_or(-1));
        qb.push(" OFFSET ").push_bind(filter.offset.max(0));

        let rows = qb
            .build_query_as::<TaskRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        task_types: &[TaskType],
    ) -> Result<Option<Task>, CoreError> {
        let now_ms = to_millis(now);
        let locked_until = to_millis(now + lease);

        // One statement: the inner SELECT picks the candidate and the outer
        // UPDATE re-checks its status under SQLite's write lock.
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE tasks SET status = 'running', locked_until = ");
        qb.push_bind(locked_until);
        qb.push(", updated_at = ").push_bind(now_ms);
        qb.push(" WHERE id = (SELECT id FROM tasks WHERE status = 'pending' AND run_at <= ");
        qb.push_bind(now_ms);
        if !task_types.is_empty() {
            qb.push(" AND task_type IN (");
            let mut separated = qb.separated(", ");
            for task_type in task_types {
                separated.push_bind(task_type.as_str().to_string());
            }
            separated.push_unseparated(")");
        }
        qb.push(" ORDER BY priority DESC, run_at ASC, id ASC LIMIT 1)");
        qb.push(" AND status = 'pending' RETURNING ");
        qb.push(TASK_COLUMNS);

        let row = qb
            .build_query_as::<TaskRow>()
            .fetch_optional(&self.pool)
            .await?;

        row.map(Task::try_from).transpose()
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let now_ms = to_millis(now);
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', locked_until = NULL, updated_at = ?
            WHERE status = 'running' AND locked_until < ?
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Workflow definitions
// ============================================================================

#[async_trait::async_trait]
impl WorkflowDefinitionStore for SqlitePersistence {
    async fn create_definition(&self, definition: &WorkflowDefinition) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_definitions (id, name, version, definition, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&definition.id)
        .bind(&definition.name)
        .bind(definition.version)
        .bind(serde_json::to_string(definition)?)
        .bind(to_millis(definition.created_at))
        .bind(to_millis(definition.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(CoreError::WorkflowAlreadyExists {
                name: definition.name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, CoreError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT definition AS document FROM workflow_definitions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|r| serde_json::from_str(&r.document))
            .transpose()?)
    }

    async fn get_definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, CoreError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT definition AS document FROM workflow_definitions WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|r| serde_json::from_str(&r.document))
            .transpose()?)
    }

    async fn update_definition(&self, definition: &WorkflowDefinition) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_definitions
            SET name = ?, version = ?, definition = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&definition.name)
        .bind(definition.version)
        .bind(serde_json::to_string(definition)?)
        .bind(to_millis(definition.updated_at))
        .bind(&definition.id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) if r.rows_affected() == 0 => Err(CoreError::WorkflowNotFound {
                workflow: definition.id.clone(),
            }),
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(CoreError::WorkflowAlreadyExists {
                name: definition.name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_definition(&self, id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM workflow_definitions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, CoreError> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            "SELECT definition AS document FROM workflow_definitions ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| serde_json::from_str(&r.document).map_err(CoreError::from))
            .collect()
    }
}

// ============================================================================
// Workflow executions
// ============================================================================

#[async_trait::async_trait]
impl WorkflowExecutionStore for SqlitePersistence {
    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_executions (id, workflow_id, workflow_name, status,
                                             parent_execution_id, document, checkpoint,
                                             created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.workflow_id)
        .bind(&execution.workflow_name)
        .bind(execution.status.as_str())
        .bind(&execution.parent_execution_id)
        .bind(serde_json::to_string(execution)?)
        .bind(&execution.checkpoint)
        .bind(to_millis(execution.created_at))
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>, CoreError> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            "SELECT document, checkpoint FROM workflow_executions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowExecution::try_from).transpose()
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = ?, document = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(execution.status.as_str())
        .bind(serde_json::to_string(execution)?)
        .bind(to_millis(Utc::now()))
        .bind(&execution.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::ExecutionNotFound {
                execution_id: execution.id.clone(),
            });
        }
        Ok(())
    }

    async fn delete_execution(&self, id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM workflow_executions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, CoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT document, checkpoint FROM workflow_executions WHERE 1 = 1",
        );
        if let Some(workflow_id) = &filter.workflow_id {
            qb.push(" AND workflow_id = ").push_bind(workflow_id.clone());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY created_at DESC, id DESC");
        qb.push(" LIMIT ").push_bind(filter.limit.unwrap_or(-1));
        qb.push(" OFFSET ").push_bind(filter.offset.max(0));

        let rows = qb
            .build_query_as::<ExecutionRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(WorkflowExecution::try_from).collect()
    }

    async fn get_latest_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowExecution>, CoreError> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT document, checkpoint FROM workflow_executions
            WHERE workflow_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowExecution::try_from).transpose()
    }

    async fn save_checkpoint(&self, execution_id: &str, state: &[u8]) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE workflow_executions SET checkpoint = ?, updated_at = ? WHERE id = ?",
        )
        .bind(state)
        .bind(to_millis(Utc::now()))
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            });
        }
        Ok(())
    }

    async fn load_checkpoint(&self, execution_id: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let row: Option<(Option<Vec<u8>>,)> =
            sqlx::query_as("SELECT checkpoint FROM workflow_executions WHERE id = ?")
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((checkpoint,)) => Ok(checkpoint),
            None => Err(CoreError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            }),
        }
    }
}

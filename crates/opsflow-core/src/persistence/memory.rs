// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-local persistence.
//!
//! Everything lives behind one mutex per table. `claim_next` selects and
//! transitions the candidate while holding the task table lock, which gives
//! the same at-most-one-claimant guarantee as the SQL backend.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::CoreError;
use crate::task::{Task, TaskFilter, TaskStatus, TaskType};
use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::execution::{ExecutionFilter, WorkflowExecution};

use super::{TaskStore, WorkflowDefinitionStore, WorkflowExecutionStore, claim_order};

/// In-memory implementation of every store trait.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    tasks: Mutex<BTreeMap<String, Task>>,
    definitions: Mutex<BTreeMap<String, WorkflowDefinition>>,
    executions: Mutex<BTreeMap<String, WorkflowExecution>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn paginate<T>(items: Vec<T>, limit: Option<i64>, offset: i64) -> Vec<T> {
    let skip = offset.max(0) as usize;
    let take = limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
    items.into_iter().skip(skip).take(take).collect()
}

#[async_trait]
impl TaskStore for MemoryPersistence {
    async fn create_task(&self, task: &Task) -> Result<(), CoreError> {
        let mut tasks = lock(&self.tasks);
        if tasks.contains_key(&task.id) {
            return Err(CoreError::database(
                "create_task",
                format!("duplicate task id '{}'", task.id),
            ));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, CoreError> {
        Ok(lock(&self.tasks).get(task_id).cloned())
    }

    async fn update_task(&self, task: &Task) -> Result<(), CoreError> {
        let mut tasks = lock(&self.tasks);
        match tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(CoreError::TaskNotFound {
                task_id: task.id.clone(),
            }),
        }
    }

    async fn delete_task(&self, task_id: &str) -> Result<bool, CoreError> {
        Ok(lock(&self.tasks).remove(task_id).is_some())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, CoreError> {
        let mut matching: Vec<Task> = lock(&self.tasks)
            .values()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| filter.task_type.as_ref().is_none_or(|tt| &t.task_type == tt))
            .cloned()
            .collect();
        matching.sort_by(claim_order);
        Ok(paginate(matching, filter.limit, filter.offset))
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        task_types: &[TaskType],
    ) -> Result<Option<Task>, CoreError> {
        let mut tasks = lock(&self.tasks);

        let candidate = tasks
            .values()
            .filter(|t| t.is_due(now))
            .filter(|t| task_types.is_empty() || task_types.contains(&t.task_type))
            .min_by(|a, b| claim_order(a, b))
            .map(|t| t.id.clone());

        let Some(id) = candidate else {
            return Ok(None);
        };
        let Some(task) = tasks.get_mut(&id) else {
            return Ok(None);
        };
        task.status = TaskStatus::Running;
        task.locked_until = Some(now + lease);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let mut released = 0;
        for task in lock(&self.tasks).values_mut() {
            if task.lease_expired(now) {
                task.status = TaskStatus::Pending;
                task.locked_until = None;
                task.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl WorkflowDefinitionStore for MemoryPersistence {
    async fn create_definition(&self, definition: &WorkflowDefinition) -> Result<(), CoreError> {
        let mut definitions = lock(&self.definitions);
        if definitions.values().any(|d| d.name == definition.name) {
            return Err(CoreError::WorkflowAlreadyExists {
                name: definition.name.clone(),
            });
        }
        definitions.insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, CoreError> {
        Ok(lock(&self.definitions).get(id).cloned())
    }

    async fn get_definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, CoreError> {
        Ok(lock(&self.definitions)
            .values()
            .find(|d| d.name == name)
            .cloned())
    }

    async fn update_definition(&self, definition: &WorkflowDefinition) -> Result<(), CoreError> {
        let mut definitions = lock(&self.definitions);
        if definitions
            .values()
            .any(|d| d.name == definition.name && d.id != definition.id)
        {
            return Err(CoreError::WorkflowAlreadyExists {
                name: definition.name.clone(),
            });
        }
        match definitions.get_mut(&definition.id) {
            Some(existing) => {
                *existing = definition.clone();
                Ok(())
            }
            None => Err(CoreError::WorkflowNotFound {
                workflow: definition.id.clone(),
            }),
        }
    }

    async fn delete_definition(&self, id: &str) -> Result<bool, CoreError> {
        Ok(lock(&self.definitions).remove(id).is_some())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, CoreError> {
        let mut all: Vec<WorkflowDefinition> =
            lock(&self.definitions).values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }
}

#[async_trait]
impl WorkflowExecutionStore for MemoryPersistence {
    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), CoreError> {
        lock(&self.executions).insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>, CoreError> {
        Ok(lock(&self.executions).get(id).cloned())
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), CoreError> {
        let mut executions = lock(&self.executions);
        match executions.get_mut(&execution.id) {
            Some(existing) => {
                let checkpoint = existing.checkpoint.take();
                *existing = execution.clone();
                existing.checkpoint = checkpoint;
                Ok(())
            }
            None => Err(CoreError::ExecutionNotFound {
                execution_id: execution.id.clone(),
            }),
        }
    }

    async fn delete_execution(&self, id: &str) -> Result<bool, CoreError> {
        Ok(lock(&self.executions).remove(id).is_some())
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, CoreError> {
        let mut matching: Vec<WorkflowExecution> = lock(&self.executions)
            .values()
            .filter(|e| {
                filter
                    .workflow_id
                    .as_ref()
                    .is_none_or(|w| &e.workflow_id == w)
            })
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(paginate(matching, filter.limit, filter.offset))
    }

    async fn get_latest_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowExecution>, CoreError> {
        Ok(lock(&self.executions)
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .cloned())
    }

    async fn save_checkpoint(&self, execution_id: &str, state: &[u8]) -> Result<(), CoreError> {
        match lock(&self.executions).get_mut(execution_id) {
            Some(execution) => {
                execution.checkpoint = Some(state.to_vec());
                Ok(())
            }
            None => Err(CoreError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            }),
        }
    }

    async fn load_checkpoint(&self, execution_id: &str) -> Result<Option<Vec<u8>>, CoreError> {
        match lock(&self.executions).get(execution_id) {
            Some(execution) => Ok(execution.checkpoint.clone()),
            None => Err(CoreError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            }),
        }
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for opsflow-core.
//!
//! [`CoreError`] covers the four failure classes of the durable execution core:
//!
//! | Class | Variants | Retried? |
//! |-------|----------|----------|
//! | Validation | `ValidationError` | never, rejected before persistence |
//! | Transient execution | `TransientExecution` | yes, by backoff / step retry policy |
//! | Permanent execution | `PermanentExecution` | no, task goes DEAD or step FAILED |
//! | Infrastructure | `DatabaseError` | surfaced to the caller, no retry consumed |

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors returned by the queue, the stores and the orchestrator.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Input failed validation (negative retries, cyclic dependencies, ...).
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field or entity that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Task was not found in the store.
    #[error("Task '{task_id}' not found")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: String,
    },

    /// Workflow definition was not found.
    #[error("Workflow '{workflow}' not found")]
    WorkflowNotFound {
        /// The workflow ID or name that was looked up.
        workflow: String,
    },

    /// Workflow definition with the same name already exists.
    #[error("Workflow '{name}' already exists")]
    WorkflowAlreadyExists {
        /// The conflicting name.
        name: String,
    },

    /// Workflow execution was not found.
    #[error("Execution '{execution_id}' not found")]
    ExecutionNotFound {
        /// The execution ID that was not found.
        execution_id: String,
    },

    /// Execution is in an invalid state for the requested operation.
    #[error("Execution '{execution_id}' is in invalid state: expected '{expected}', got '{actual}'")]
    InvalidExecutionState {
        /// The execution ID.
        execution_id: String,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// Work failed but may succeed when retried.
    #[error("Transient execution error: {message}")]
    TransientExecution {
        /// Failure message.
        message: String,
    },

    /// Work failed and the retry budget is exhausted.
    #[error("Permanent execution error after {attempts} attempt(s): {message}")]
    PermanentExecution {
        /// Number of attempts made.
        attempts: u32,
        /// Last failure message.
        message: String,
    },

    /// Checkpoint could not be encoded or decoded.
    #[error("Checkpoint error for execution '{execution_id}': {reason}")]
    Checkpoint {
        /// The execution ID.
        execution_id: String,
        /// The reason for failure.
        reason: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Shorthand for a [`CoreError::ValidationError`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`CoreError::DatabaseError`].
    pub fn database(operation: impl Into<String>, details: impl std::fmt::Display) -> Self {
        Self::DatabaseError {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::WorkflowNotFound { .. } => "WORKFLOW_NOT_FOUND",
            Self::WorkflowAlreadyExists { .. } => "WORKFLOW_ALREADY_EXISTS",
            Self::ExecutionNotFound { .. } => "EXECUTION_NOT_FOUND",
            Self::InvalidExecutionState { .. } => "INVALID_EXECUTION_STATE",
            Self::TransientExecution { .. } => "TRANSIENT_EXECUTION_ERROR",
            Self::PermanentExecution { .. } => "PERMANENT_EXECUTION_ERROR",
            Self::Checkpoint { .. } => "CHECKPOINT_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// True for failures of the backing store rather than of the work itself.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::DatabaseError { .. })
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (CoreError::validation("max_retries", "must be >= 0"), "VALIDATION_ERROR"),
            (
                CoreError::TaskNotFound {
                    task_id: "t-1".to_string(),
                },
                "TASK_NOT_FOUND",
            ),
            (
                CoreError::WorkflowNotFound {
                    workflow: "nightly".to_string(),
                },
                "WORKFLOW_NOT_FOUND",
            ),
            (
                CoreError::ExecutionNotFound {
                    execution_id: "e-1".to_string(),
                },
                "EXECUTION_NOT_FOUND",
            ),
            (
                CoreError::InvalidExecutionState {
                    execution_id: "e-1".to_string(),
                    expected: "paused".to_string(),
                    actual: "running".to_string(),
                },
                "INVALID_EXECUTION_STATE",
            ),
            (
                CoreError::PermanentExecution {
                    attempts: 3,
                    message: "boom".to_string(),
                },
                "PERMANENT_EXECUTION_ERROR",
            ),
            (CoreError::database("insert", "connection refused"), "DATABASE_ERROR"),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::validation("steps", "dependency cycle: a -> b -> a");
        assert_eq!(
            err.to_string(),
            "Validation error for 'steps': dependency cycle: a -> b -> a"
        );

        let err = CoreError::InvalidExecutionState {
            execution_id: "abc-123".to_string(),
            expected: "paused".to_string(),
            actual: "completed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Execution 'abc-123' is in invalid state: expected 'paused', got 'completed'"
        );

        let err = CoreError::database("claim_next", "database is locked");
        assert_eq!(
            err.to_string(),
            "Database error during 'claim_next': database is locked"
        );
    }

    #[test]
    fn test_is_infrastructure() {
        assert!(CoreError::database("update", "io").is_infrastructure());
        assert!(!CoreError::validation("x", "y").is_infrastructure());
        assert!(
            !CoreError::TransientExecution {
                message: "flaky".to_string()
            }
            .is_infrastructure()
        );
    }
}

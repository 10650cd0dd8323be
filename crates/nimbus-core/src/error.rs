// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for nimbus-core.
//!
//! Provides a unified error type with stable error codes for API callers.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while managing jobs and queues.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Job was not found (or has been removed).
    JobNotFound {
        /// The job ID that was not found.
        job_id: i64,
    },

    /// Sync queue item was not found.
    QueueItemNotFound {
        /// The queue item ID.
        item_id: i64,
    },

    /// No handler is registered for the command.
    UnknownCommand {
        /// The command name.
        cmd: String,
    },

    /// Job is in an invalid state for the requested operation.
    InvalidJobState {
        /// The job ID.
        job_id: i64,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// Job submission referenced an entity that does not exist.
    UnknownInstance {
        /// Instance type (e.g. "VirtualMachine").
        instance_type: String,
        /// Instance ID.
        instance_id: i64,
    },

    /// Join map rows reference jobs that no longer exist.
    JoinInconsistency {
        /// The waiting job.
        job_id: i64,
        /// The job being waited upon.
        join_job_id: i64,
        /// What went wrong.
        reason: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Shorthand for a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::QueueItemNotFound { .. } => "QUEUE_ITEM_NOT_FOUND",
            Self::UnknownCommand { .. } => "UNKNOWN_COMMAND",
            Self::InvalidJobState { .. } => "INVALID_JOB_STATE",
            Self::UnknownInstance { .. } => "UNKNOWN_INSTANCE",
            Self::JoinInconsistency { .. } => "JOIN_INCONSISTENCY",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether the error came from the storage layer rather than the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseError { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JobNotFound { job_id } => write!(f, "Job {} not found", job_id),
            Self::QueueItemNotFound { item_id } => {
                write!(f, "Sync queue item {} not found", item_id)
            }
            Self::UnknownCommand { cmd } => {
                write!(f, "No handler registered for command '{}'", cmd)
            }
            Self::InvalidJobState {
                job_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Job {} is in invalid state: expected '{}', got '{}'",
                    job_id, expected, actual
                )
            }
            Self::UnknownInstance {
                instance_type,
                instance_id,
            } => {
                write!(
                    f,
                    "Unable to find {} with id {}",
                    instance_type, instance_id
                )
            }
            Self::JoinInconsistency {
                job_id,
                join_job_id,
                reason,
            } => {
                write!(
                    f,
                    "Job {} cannot join job {}: {}",
                    job_id, join_job_id, reason
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

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
        CoreError::ValidationError {
            field: "json".to_string(),
            message: err.to_string(),
        }
    }
}

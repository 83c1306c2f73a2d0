// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runstate-core.
//!
//! Rejections, waits and aborts are orchestration outcomes, not errors; they
//! travel inside [`crate::context::OrchestrationResult`]. `CoreError` covers
//! missing entities, invalid input and infrastructure faults.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while orchestrating or reading states.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Run was not found.
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// Run already exists (duplicate registration).
    RunAlreadyExists {
        /// The run ID that already exists.
        run_id: String,
    },

    /// State was not found.
    StateNotFound {
        /// The state ID that was not found.
        state_id: String,
    },

    /// A concurrent writer changed the run between read and commit.
    ConcurrentModification {
        /// The run ID.
        run_id: String,
        /// What was detected.
        details: String,
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
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::RunAlreadyExists { .. } => "RUN_ALREADY_EXISTS",
            Self::StateNotFound { .. } => "STATE_NOT_FOUND",
            Self::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. } | Self::DatabaseError { .. }
        )
    }

    /// Whether this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RunNotFound { .. } | Self::StateNotFound { .. })
    }

    pub(crate) fn conflict(run_id: impl fmt::Display, details: impl Into<String>) -> Self {
        Self::ConcurrentModification {
            run_id: run_id.to_string(),
            details: details.into(),
        }
    }

    /// Attach the run id to a conflict raised without one.
    pub(crate) fn with_run_id(self, run: impl fmt::Display) -> Self {
        match self {
            Self::ConcurrentModification { run_id, details } if run_id.is_empty() => {
                Self::ConcurrentModification {
                    run_id: run.to_string(),
                    details,
                }
            }
            other => other,
        }
    }

    pub(crate) fn database(operation: &str, details: impl Into<String>) -> Self {
        Self::DatabaseError {
            operation: operation.to_string(),
            details: details.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotFound { run_id } => {
                write!(f, "Run '{}' not found", run_id)
            }
            Self::RunAlreadyExists { run_id } => {
                write!(f, "Run '{}' already exists", run_id)
            }
            Self::StateNotFound { state_id } => {
                write!(f, "State '{}' not found", state_id)
            }
            Self::ConcurrentModification { run_id, details } => {
                write!(
                    f,
                    "Run '{}' was modified concurrently: {}",
                    run_id, details
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

// SQLite: SQLITE_BUSY and its extended codes, SQLITE_LOCKED, SQLITE_CONSTRAINT_UNIQUE,
// SQLITE_CONSTRAINT_PRIMARYKEY.
// PostgreSQL: serialization_failure, deadlock_detected, unique_violation.
const CONFLICT_CODES: &[&str] = &[
    "5", "261", "517", "773", "6", "2067", "1555", "40001", "40P01", "23505",
];

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err
            && let Some(code) = db_err.code()
            && CONFLICT_CODES.contains(&code.as_ref())
        {
            return CoreError::ConcurrentModification {
                run_id: String::new(),
                details: db_err.message().to_string(),
            };
        }

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

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication dispatcher.
//!
//! Errors are split by where they surface:
//!
//! - [`ValidationError`] is reported per item by event intake and never retried.
//! - [`DispatchError`] is the crate-wide error for queue, config and lifecycle
//!   operations.
//!
//! Replication failures are *not* errors in this sense. A worker reports them
//! as an [`Outcome`](crate::worker::Outcome) and they are recorded on the job.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | Busy/locked only | SQLite errors from the job table |
//! | `Validation` | No | Malformed intake payload |
//! | `Unauthorized` | No | Caller lacks the admin capability |
//! | `JobNotFound` | No | Unknown job id |
//! | `InvalidTransition` | No | Job is not in the state the operation requires |
//! | `Config` | No | Configuration invalid |
//! | `Serialization` | No | Stored payload could not be (de)serialized |
//! | `InvalidState` | No | Dispatcher lifecycle violation |
//! | `Shutdown` | No | Dispatcher is shutting down |
//! | `Internal` | No | Unexpected internal error |

use thiserror::Error;

/// Result type alias for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// A rejected change descriptor.
///
/// Returned per item so one bad entry never fails the rest of a batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A field required by the change kind is absent or empty.
    #[error("missing required field `{field}`")]
    MissingField { field: &'static str },

    /// A field is present but has the wrong shape.
    #[error("malformed field `{field}`: {reason}")]
    Malformed { field: &'static str, reason: String },

    /// The change kind / event name is not one we replicate.
    #[error("unknown change kind `{0}`")]
    UnknownKind(String),
}

impl ValidationError {
    pub(crate) fn missing(field: &'static str) -> Self {
        Self::MissingField { field }
    }

    pub(crate) fn malformed(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while dispatching.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Request-level validation failure (e.g. `projects` missing).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// SQLite error from the job store.
    ///
    /// Busy/locked errors are retried inside the queue before surfacing here.
    #[error("Job store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stored payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The caller did not present the admin capability.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// No job with this id exists.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The job exists but is not in a state that permits the operation.
    #[error("Invalid transition for job {job_id}: {op} requires {expected}, job is {actual}")]
    InvalidTransition {
        job_id: String,
        op: &'static str,
        expected: &'static str,
        actual: String,
    },

    /// Dispatcher state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => crate::queue::is_sqlite_busy_error(e),
            Self::Validation(_) => false,
            Self::Config(_) => false,
            Self::Serialization(_) => false,
            Self::Unauthorized(_) => false,
            Self::JobNotFound(_) => false,
            Self::InvalidTransition { .. } => false, // Lost a race; the job moved on
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

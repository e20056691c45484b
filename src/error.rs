//! Error types for brand-forge operations.
//!
//! Defines the error taxonomy shared by the orchestrator and its callers:
//! - Caller errors surfaced synchronously (`InvalidInput`, `NotFound`, `AlreadyTerminal`)
//! - Classified stage failures (`Transient`, `Permanent`, `Timeout`)
//! - Input validation failures

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::config::ConfigError;
use crate::scheduler::job::JobStatus;
use crate::scheduler::queue::QueueError;
use crate::storage::{DatabaseError, StorageError};

/// Errors returned by the orchestrator's caller-facing operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid input: {0}")]
    InvalidInput(#[from] ValidationError),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {job_id} is already terminal ({status})")]
    AlreadyTerminal { job_id: Uuid, status: JobStatus },

    #[error("Timed out waiting for job {0} to finish")]
    WaitTimeout(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl OrchestratorError {
    /// Storage-layer failures that may clear up on their own. A worker
    /// retries reporting an outcome only for these.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Database(_) | OrchestratorError::Storage(_)
        )
    }
}

/// Brand input validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Empty { field: &'static str },

    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("{field} must be at least {min} characters")]
    TooShort { field: &'static str, min: usize },

    #[error("{field} must be between {min} and {max}, got {actual}")]
    OutOfRange {
        field: &'static str,
        min: usize,
        max: usize,
        actual: usize,
    },

    #[error("{field} must contain at least {min} words")]
    TooFewWords { field: &'static str, min: usize },
}

/// Classification of a stage failure, driving the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// Network, resource exhaustion or other infrastructure failure.
    Transient,
    /// The executor determined the input cannot be processed.
    Permanent,
    /// The executor did not return within the stage deadline.
    Timeout,
}

impl ErrorClass {
    /// Timeouts are retried exactly like transient failures.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified stage failure as recorded on a stage record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{class}: {message}")]
pub struct StageError {
    pub class: ErrorClass,
    pub message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    pub fn timeout(deadline: Duration) -> Self {
        Self {
            class: ErrorClass::Timeout,
            message: format!("stage did not finish within {}ms", deadline.as_millis()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}

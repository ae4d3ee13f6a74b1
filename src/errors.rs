//! Typed error hierarchy for Anvil.
//!
//! Three top-level enums cover the three subsystems:
//! - `QueueError`: work queue misuse and storage failures
//! - `GateError`: validator failures that are not ordinary "check failed" outcomes
//! - `WorkflowError`: orchestration failures around a single task

use thiserror::Error;
use uuid::Uuid;

/// Errors from the work queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid work item: {0}")]
    Validation(String),

    #[error("Work item {id} not found")]
    NotFound { id: Uuid },

    #[error("Work item {id} is {actual}, expected {expected}")]
    InvalidState {
        id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("Work item {id} exhausted its retries ({attempts}/{max_attempts} attempts)")]
    RetryExhausted {
        id: Uuid,
        attempts: u32,
        max_attempts: u32,
    },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

impl From<rusqlite::Error> for QueueError {
    fn from(err: rusqlite::Error) -> Self {
        QueueError::Database(err.into())
    }
}

/// Errors raised by the quality gate validators.
///
/// A check that runs and fails is not an error: it is a failed outcome inside a
/// report. These variants cover the cases that must abort or fail closed.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Pre-flight failed: {}", failed.join(", "))]
    PreflightFailed { failed: Vec<String> },

    #[error("Unsupported criterion type '{kind}'")]
    UnsupportedCriterion { kind: String },

    #[error("Verification kind '{kind}' is not implemented")]
    NotImplemented { kind: String },

    #[error("Failed to run command '{command}': {source}")]
    Shell {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid predicate '{expr}': {message}")]
    InvalidPredicate { expr: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the workflow orchestrator and worker loop.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Quality gate could not run: {reason}")]
    GateFailure { reason: String },

    #[error("Version control error: {0}")]
    Vcs(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Errors confined to one attempt. The worker routes these through the
    /// failure policy and moves on; anything else stops the loop.
    pub fn is_task_scoped(&self) -> bool {
        matches!(self, WorkflowError::Vcs(_) | WorkflowError::GateFailure { .. })
    }
}

//! Core domain errors.

use thiserror::Error;

/// Core domain errors for the maestro.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Daemon not found.
    #[error("Daemon not found: {0}")]
    DaemonNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// The attached tasks of an incomplete job disagree in a way the
    /// aggregation rules do not cover.
    #[error("Inconsistent partial status for job {job}: [{statuses}]")]
    InconsistentPartialStatus { job: String, statuses: String },

    /// A fraction was reported twice for the same job.
    #[error("Job {job} already has a task for fraction {fraction}")]
    DuplicateFraction { job: String, fraction: u32 },

    /// Kill requested on a job that is neither queued nor running.
    #[error("Job {0} cannot be killed in its current state")]
    NotKillable(String),

    /// Close requested on a job that has not reached a terminal status.
    #[error("Job {0} cannot be closed before it finishes")]
    NotClosable(String),

    /// Unqueue requested on a job that is not waiting on a parent.
    #[error("Job {0} is not queued")]
    NotQueued(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

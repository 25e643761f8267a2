//! Task: one fraction of a job running on one daemon.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CoreError, DaemonAddress, JobId, JobStatus, TaskKey};

/// Execution of one fraction of a job on a specific daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Job this task belongs to.
    pub job_id: JobId,

    /// Index of the task within its job's fan-out, starting at 1.
    pub fraction: u32,

    /// Daemon running this fraction. Fixed at creation.
    pub daemon: DaemonAddress,

    /// Current status. Never an informational status.
    pub status: JobStatus,

    /// When the daemon reported the task running.
    pub start_date: Option<DateTime<Utc>>,

    /// When the daemon reported the task terminal.
    pub finish_date: Option<DateTime<Utc>>,

    /// Output accumulated so far.
    pub output: String,

    /// Command line the daemon will execute.
    pub cmd_line: String,

    /// Issues reported when the task was defined or while running.
    pub issues: String,

    /// Id given by an external scheduler, if the daemon uses one.
    pub external_id: String,
}

impl Task {
    /// Create a new Task in the INITIAL status.
    pub fn new(job_id: JobId, fraction: u32, daemon: DaemonAddress) -> Self {
        Self {
            job_id,
            fraction,
            daemon,
            status: JobStatus::Initial,
            start_date: None,
            finish_date: None,
            output: String::new(),
            cmd_line: String::new(),
            issues: String::new(),
            external_id: String::new(),
        }
    }

    /// Builder method to set the command line.
    pub fn with_cmd_line(mut self, cmd_line: impl Into<String>) -> Self {
        self.cmd_line = cmd_line.into();
        self
    }

    /// Builder method to set the issues reported at definition.
    pub fn with_issues(mut self, issues: impl Into<String>) -> Self {
        self.issues = issues.into();
        self
    }

    /// Builder method to set the external scheduler id.
    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = id.into();
        self
    }

    /// Registry key of this task.
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.job_id.clone(), self.fraction)
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status reported by the daemon.
    ///
    /// RUNNING stamps the start date and terminal statuses stamp the finish
    /// date, both taken from `parameter` when it holds an RFC 3339 date.
    /// Informational statuses are accepted without changing the stored one.
    pub fn set_status(&mut self, status: JobStatus, parameter: &str) -> Result<(), CoreError> {
        if self.is_terminal() && status != self.status {
            return Err(CoreError::InvalidStateTransition {
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }

        match status {
            JobStatus::Issued => {
                if !parameter.is_empty() {
                    self.issues.push_str(parameter);
                }
                return Ok(());
            }
            JobStatus::Requeued => return Ok(()),
            JobStatus::Running => self.start_date = Some(parse_date(parameter)),
            s if s.is_terminal() => self.finish_date = Some(parse_date(parameter)),
            _ => {}
        }

        self.status = status;
        Ok(())
    }

    /// Append daemon output.
    pub fn append_output(&mut self, text: &str) {
        self.output.push_str(text);
    }
}

/// Parse a date reported by a daemon, falling back to now.
pub fn parse_date(parameter: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(parameter.trim())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

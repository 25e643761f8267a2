//! Status enums for jobs, tasks and daemon connections.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// Status shared by jobs and tasks.
///
/// `Issued` and `Requeued` are informational: they are reported by daemons
/// but never stored as the status of a task or a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Nothing reported yet.
    #[default]
    Initial,
    /// Waiting, either on a parent job or in a daemon-side queue.
    Queued,
    /// At least one fraction is executing.
    Running,
    /// Issues were reported for the flow.
    Issued,
    /// Every fraction finished.
    Finished,
    /// A fraction failed.
    Failed,
    /// A fraction was canceled.
    Canceled,
    /// A daemon put a fraction back in its queue.
    Requeued,
}

impl JobStatus {
    /// Returns true if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }

    /// Returns true if the status is only reported, never stored.
    pub fn is_informational(&self) -> bool {
        matches!(self, Self::Issued | Self::Requeued)
    }

    /// Wire representation.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Initial => "unknown",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Issued => "issued",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Requeued => "requeued",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "unknown" | "initial" => Self::Initial,
            "queued" => Self::Queued,
            "running" => Self::Running,
            "issued" => Self::Issued,
            "finished" => Self::Finished,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            "requeued" => Self::Requeued,
            other => return Err(CoreError::InvalidInput(format!("unknown status '{other}'"))),
        })
    }
}

/// Connection state of a daemon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DaemonState {
    /// No connection; the record persists.
    #[default]
    Disconnected,
    /// A connect attempt is in progress.
    Run,
    /// The connect sequence is suspended until a client answers a prompt.
    AwaitingAnswer,
    /// Handshake completed; the daemon accepts work.
    Logged,
}

impl DaemonState {
    /// Returns true while a connect attempt is in progress.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Run | Self::AwaitingAnswer)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: DaemonState) -> bool {
        use DaemonState::*;
        match (self, next) {
            (_, Disconnected) => true,
            (Disconnected, Run) => true,
            (Run, AwaitingAnswer) | (Run, Logged) => true,
            (AwaitingAnswer, Run) | (AwaitingAnswer, Logged) => true,
            _ => false,
        }
    }

    /// Wire representation.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Run => "run",
            Self::AwaitingAnswer => "awaiting_answer",
            Self::Logged => "logged",
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl FromStr for DaemonState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "disconnected" => Self::Disconnected,
            "run" => Self::Run,
            "awaiting_answer" => Self::AwaitingAnswer,
            "logged" => Self::Logged,
            other => {
                return Err(CoreError::InvalidInput(format!("unknown daemon state '{other}'")))
            }
        })
    }
}

/// Why a daemon ended up disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DaemonErrorKind {
    /// The transport could not be established or dropped.
    ConnectionRefused,
    /// The daemon speaks another protocol version.
    Protocol,
    /// The daemon belongs to another shared filesystem domain.
    Nfs,
    /// Another daemon already registered with the same daemon id.
    Id,
    /// The daemon identity was refused or changed.
    Ssh,
    /// The daemon was stopped on request.
    Stop,
}

impl DaemonErrorKind {
    /// Terminal errors are never retried automatically.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::ConnectionRefused)
    }

    /// Wire representation.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::ConnectionRefused => "connection-refused",
            Self::Protocol => "protocol",
            Self::Nfs => "nfs",
            Self::Id => "id",
            Self::Ssh => "ssh",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for DaemonErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

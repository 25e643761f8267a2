//! Read-only views of the coordinator state for the admin surface.

use serde::Serialize;

use maestro_core::{DaemonAddress, DaemonErrorKind, DaemonState, JobId, JobStatus};

/// One daemon as seen by the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonView {
    pub address: DaemonAddress,
    pub hostname: String,
    pub state: DaemonState,
    pub autoconnect: bool,
    pub tags: Vec<String>,
    pub uncompleted_tasks: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DaemonErrorKind>,
}

/// One job as seen by the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub title: String,
    pub status: JobStatus,
    pub total: u32,
    pub tasks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<JobId>,
}

/// Point-in-time copy of the coordinator state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub daemons: Vec<DaemonView>,
    pub jobs: Vec<JobView>,
    pub clients: usize,
}

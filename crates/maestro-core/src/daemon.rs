//! Daemon records: one per configured worker host.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{CoreError, DaemonAddress, DaemonErrorKind, DaemonState};

/// Host information reported by a daemon in its handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub hostname: String,
    pub server_type: String,
    pub model_name: String,
    pub memory: String,
    /// Shared filesystem domain of the host.
    pub nfsid: String,
    pub ncores: u32,
    /// CPU clock in MHz.
    pub clock: f64,
    /// Identity of the daemon process.
    pub daemon_id: String,
    pub mpi_flavors: Vec<String>,
}

impl DaemonInfo {
    /// Ranking score used when choosing daemons for a job.
    pub fn score(&self) -> f64 {
        f64::from(self.ncores.max(1)) * self.clock
    }
}

/// Error attached to a daemon that got disconnected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonError {
    pub kind: DaemonErrorKind,
    pub message: String,
}

/// A managed connection to one worker host.
///
/// The record outlives its connections: dropping the transport only moves
/// it back to DISCONNECTED so autoconnect can retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Daemon {
    /// Network address; the identity of the daemon.
    pub address: DaemonAddress,

    /// Retry this daemon on connect-all.
    pub autoconnect: bool,

    /// Daemon id accepted the first time this address logged in.
    pub known_id: Option<String>,

    /// Set when the connect-all watchdog gave up on this daemon.
    pub canceled: bool,

    /// Set while a confirmed disconnect is tearing the connection down.
    pub disconnecting: bool,

    state: DaemonState,
    tags: BTreeSet<String>,
    info: Option<DaemonInfo>,
    error: Option<DaemonError>,
    uncompleted_tasks: u32,
}

impl Daemon {
    /// Create a new Daemon, DISCONNECTED and with autoconnect on.
    pub fn new(address: DaemonAddress) -> Self {
        Self {
            address,
            autoconnect: true,
            known_id: None,
            canceled: false,
            disconnecting: false,
            state: DaemonState::Disconnected,
            tags: BTreeSet::new(),
            info: None,
            error: None,
            uncompleted_tasks: 0,
        }
    }

    /// Builder method to set tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.merge_tags(tags);
        self
    }

    /// Builder method to set autoconnect.
    pub fn with_autoconnect(mut self, autoconnect: bool) -> Self {
        self.autoconnect = autoconnect;
        self
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn is_logged(&self) -> bool {
        self.state == DaemonState::Logged
    }

    /// Move to `next`, returning the previous state.
    pub fn set_state(&mut self, next: DaemonState) -> Result<DaemonState, CoreError> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let old = self.state;
        self.state = next;
        if next == DaemonState::Run {
            self.error = None;
            self.canceled = false;
        }
        Ok(old)
    }

    /// Record a terminal or transient error and drop to DISCONNECTED.
    pub fn disconnect_with(&mut self, kind: DaemonErrorKind, message: impl Into<String>) {
        self.state = DaemonState::Disconnected;
        self.error = Some(DaemonError {
            kind,
            message: message.into(),
        });
    }

    pub fn error(&self) -> Option<&DaemonError> {
        self.error.as_ref()
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn info(&self) -> Option<&DaemonInfo> {
        self.info.as_ref()
    }

    pub fn set_info(&mut self, info: DaemonInfo) {
        self.info = Some(info);
    }

    /// Tags in sorted order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Comma-joined sorted tags, as sent on the wire.
    pub fn tags_string(&self) -> String {
        self.tags.iter().cloned().collect::<Vec<_>>().join(",")
    }

    /// Add tags, ignoring blanks and duplicates. Returns true on change.
    pub fn merge_tags<I, S>(&mut self, tags: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut changed = false;
        for tag in tags {
            let tag = tag.into();
            let tag = tag.trim();
            if !tag.is_empty() {
                changed |= self.tags.insert(tag.to_string());
            }
        }
        changed
    }

    /// Replace the whole tag set. Returns true on change.
    pub fn replace_tags<I, S>(&mut self, tags: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let old = std::mem::take(&mut self.tags);
        self.merge_tags(tags);
        old != self.tags
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        self.tags.remove(tag.trim())
    }

    /// Whether the daemon supports every MPI flavor in `flavors`.
    pub fn supports_mpi<'a>(&self, flavors: impl IntoIterator<Item = &'a str>) -> bool {
        let supported = self.info.as_ref().map(|i| &i.mpi_flavors);
        flavors
            .into_iter()
            .filter(|f| !f.is_empty())
            .all(|f| supported.is_some_and(|s| s.iter().any(|m| m == f)))
    }

    pub fn uncompleted_tasks(&self) -> u32 {
        self.uncompleted_tasks
    }

    pub fn task_started(&mut self) {
        self.uncompleted_tasks += 1;
    }

    pub fn task_completed(&mut self) {
        self.uncompleted_tasks = self.uncompleted_tasks.saturating_sub(1);
    }
}

/// Split a comma-joined tag list.
pub fn split_tags(tags: &str) -> impl Iterator<Item = &str> {
    tags.split(',').map(str::trim).filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daemon() -> Daemon {
        Daemon::new(DaemonAddress::new("node1:2127"))
    }

    #[test]
    fn test_new_daemon_defaults() {
        let d = daemon();
        assert_eq!(d.state(), DaemonState::Disconnected);
        assert!(d.autoconnect);
        assert_eq!(d.uncompleted_tasks(), 0);
        assert!(d.error().is_none());
    }

    #[test]
    fn test_tags_are_sorted_and_deduplicated() {
        let mut d = daemon().with_tags(["gpu", "batch"]);
        assert!(!d.merge_tags(["gpu", " "]));
        assert!(d.merge_tags(split_tags("big, gpu,")));
        assert_eq!(d.tags_string(), "batch,big,gpu");
        assert!(d.has_tag("big"));
    }

    #[test]
    fn test_replace_and_remove_tags() {
        let mut d = daemon().with_tags(["a", "b"]);
        assert!(d.replace_tags(["c"]));
        assert!(!d.replace_tags(["c"]));
        assert!(d.remove_tag("c"));
        assert!(!d.remove_tag("c"));
        assert_eq!(d.tags_string(), "");
    }

    #[test]
    fn test_state_transitions() {
        let mut d = daemon();
        assert!(d.set_state(DaemonState::Logged).is_err());
        d.disconnect_with(DaemonErrorKind::ConnectionRefused, "refused");
        assert_eq!(d.set_state(DaemonState::Run).unwrap(), DaemonState::Disconnected);
        // A new attempt clears the previous error.
        assert!(d.error().is_none());
        d.set_state(DaemonState::AwaitingAnswer).unwrap();
        d.set_state(DaemonState::Logged).unwrap();
        assert!(d.is_logged());
    }

    #[test]
    fn test_supports_mpi() {
        let mut d = daemon();
        assert!(d.supports_mpi(split_tags("")));
        assert!(!d.supports_mpi(["openmpi"]));
        d.set_info(DaemonInfo {
            mpi_flavors: vec!["openmpi".into(), "mpich".into()],
            ..Default::default()
        });
        assert!(d.supports_mpi(["openmpi"]));
        assert!(!d.supports_mpi(["openmpi", "intel"]));
    }

    #[test]
    fn test_uncompleted_counter_never_underflows() {
        let mut d = daemon();
        d.task_started();
        d.task_completed();
        d.task_completed();
        assert_eq!(d.uncompleted_tasks(), 0);
    }
}

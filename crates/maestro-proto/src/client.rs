//! Messages exchanged between the maestro and GUI clients.
//!
//! Builders here turn domain objects into the messages every client
//! receives; the field order is part of the protocol.

use chrono::{DateTime, Utc};
use maestro_core::{Daemon, DaemonAddress, Job, JobId, JobStatus};

use crate::message::code;
use crate::{Message, ProtoError};

/// Number of fields in a `job_def` message.
pub const JOB_DEF_FIELDS: usize = 26;

/// Number of fields in a `ssta` message.
pub const SERVER_STATUS_FIELDS: usize = 10;

/// Client handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIni {
    /// Display of the GUI (`host:port`).
    pub display: String,
    pub version: String,
    pub cookie: String,
    pub session_id: String,
    /// Client clock, RFC 3339.
    pub clock: String,
    pub has_maestro: bool,
}

impl ClientIni {
    /// Seconds the maestro clock is ahead of the client clock.
    pub fn clock_diff(&self, now: DateTime<Utc>) -> i64 {
        DateTime::parse_from_rfc3339(self.clock.trim())
            .map(|c| (now - c.with_timezone(&Utc)).num_seconds())
            .unwrap_or(0)
    }
}

impl TryFrom<&Message> for ClientIni {
    type Error = ProtoError;

    fn try_from(msg: &Message) -> Result<Self, Self::Error> {
        if msg.code != code::CLIENT_INI {
            return Err(ProtoError::UnknownCode(msg.code.clone()));
        }
        let a = msg.expect_min_args(5)?;
        Ok(Self {
            display: a[0].clone(),
            version: a[1].clone(),
            cookie: a[2].clone(),
            session_id: a[3].clone(),
            clock: a[4].clone(),
            has_maestro: a.get(5).is_some_and(|v| v == "yes" || v == "true"),
        })
    }
}

impl From<&ClientIni> for Message {
    fn from(ini: &ClientIni) -> Self {
        Message::new(
            code::CLIENT_INI,
            [
                ini.display.as_str(),
                ini.version.as_str(),
                ini.cookie.as_str(),
                ini.session_id.as_str(),
                ini.clock.as_str(),
                if ini.has_maestro { "yes" } else { "no" },
            ],
        )
    }
}

fn date(d: Option<DateTime<Utc>>) -> String {
    d.map(|d| d.to_rfc3339()).unwrap_or_default()
}

/// Handshake accepted.
pub fn ret(clock_diff: i64) -> Message {
    Message::new(code::CLIENT_RET, [clock_diff.to_string()])
}

/// Handshake refused.
pub fn err(kind: &str, detail: &str) -> Message {
    Message::new(code::CLIENT_ERR, [kind, detail])
}

/// Full definition of a job.
pub fn job_def(job: &Job) -> Message {
    job_def_with_status(job, job.partial_status().unwrap_or(job.status()))
}

/// Definition of a job carrying `status` in place of the current one.
pub fn job_def_with_status(job: &Job, status: JobStatus) -> Message {
    let info = &job.info;
    Message::new(
        code::JOB_DEF,
        [
            job.id.to_string(),
            info.temp_id.clone(),
            info.flow_id.clone(),
            info.nprocs.clone(),
            info.servers_list.clone(),
            info.hostname.clone(),
            info.title.clone(),
            info.counter.clone(),
            info.description.clone(),
            info.snapshot_title.clone(),
            info.snapshot_id.clone(),
            job.parent_id.as_ref().map(JobId::to_string).unwrap_or_default(),
            info.nice.clone(),
            info.input.clone(),
            info.output.clone(),
            info.error.clone(),
            job.submit_date.to_rfc3339(),
            info.group.clone(),
            info.group_type.as_wire().to_string(),
            info.speed.clone(),
            status.as_wire().to_string(),
            date(job.start_date()),
            date(job.finish_date()),
            info.run_type.as_wire().to_string(),
            info.mpi_owner.clone(),
            info.mpi_flavor.clone(),
        ],
    )
}

/// Job status change.
pub fn job_status(job_id: &JobId, status: JobStatus, parameter: &str) -> Message {
    Message::new(
        code::JOB_STATUS,
        [job_id.as_str(), status.as_wire(), parameter],
    )
}

/// Output of one fraction.
pub fn job_output(job_id: &JobId, fraction: u32, text: &str) -> Message {
    Message::new(
        code::JOB_OUTPUT,
        [job_id.to_string(), fraction.to_string(), text.to_string()],
    )
}

/// Command line of one fraction.
pub fn job_cmd(job_id: &JobId, fraction: u32, text: &str) -> Message {
    Message::new(
        code::JOB_CMD,
        [job_id.to_string(), fraction.to_string(), text.to_string()],
    )
}

/// Issues of a job.
pub fn job_issues(job_id: &JobId, text: &str) -> Message {
    Message::new(code::JOB_ISSUES, [job_id.as_str(), text])
}

/// Daemon status, sent on every state transition.
pub fn server_status(daemon: &Daemon) -> Message {
    let info = daemon.info().cloned().unwrap_or_default();
    let (kind, message) = daemon
        .error()
        .map(|e| (e.kind.as_wire().to_string(), e.message.clone()))
        .unwrap_or_default();
    Message::new(
        code::SERVER_STATUS,
        [
            info.hostname,
            daemon.address.to_string(),
            daemon.state().as_wire().to_string(),
            on_off(daemon.autoconnect).to_string(),
            info.ncores.to_string(),
            info.clock.to_string(),
            info.model_name,
            info.memory,
            kind,
            message,
        ],
    )
}

/// Tag set of a daemon.
pub fn server_tags(daemon: &Daemon) -> Message {
    Message::new(
        code::SERVER_TAGS,
        [daemon.address.to_string(), daemon.tags_string()],
    )
}

/// Autoconnect flag of a daemon.
pub fn autoconnect(daemon: &Daemon) -> Message {
    Message::new(
        code::AUTOCONNECT,
        [daemon.address.as_str(), on_off(daemon.autoconnect)],
    )
}

/// A daemon was removed.
pub fn server_removed(address: &DaemonAddress) -> Message {
    Message::new(code::SERVER_REMOVED, [address.as_str()])
}

/// MPI flavors a daemon supports.
pub fn mpi(daemon: &Daemon) -> Message {
    let flavors = daemon
        .info()
        .map(|i| i.mpi_flavors.join(","))
        .unwrap_or_default();
    Message::new(code::MPI, [daemon.address.to_string(), flavors])
}

/// Yes/no question about a daemon being connected.
pub fn question(address: &DaemonAddress, title: &str, text: &str) -> Message {
    Message::new(code::QUESTION, [address.as_str(), title, text])
}

/// Password prompt for a daemon being connected.
pub fn password(address: &DaemonAddress) -> Message {
    Message::new(code::PASSWORD, [address.as_str()])
}

/// Confirmation request before acting on a busy daemon.
pub fn confirm(address: &DaemonAddress, action: &str, uncompleted: u32) -> Message {
    Message::new(
        code::CONFIRM,
        [address.to_string(), action.to_string(), uncompleted.to_string()],
    )
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::{DaemonErrorKind, DaemonInfo, JobInfo, Task};

    #[test]
    fn test_job_def_field_order() {
        let info = JobInfo {
            temp_id: "tmp-1".into(),
            title: "Migration".into(),
            group: "gpu".into(),
            ..Default::default()
        };
        let mut job = Job::new(JobId::new("3"), info, 1).with_parent(Some(JobId::new("2")));
        job.attach_task(Task::new(JobId::new("3"), 1, DaemonAddress::new("n1:2127")))
            .unwrap();
        job.update_task(1, JobStatus::Running, "2024-02-01T08:00:00Z")
            .unwrap();

        let msg = job_def(&job);
        assert_eq!(msg.args.len(), JOB_DEF_FIELDS);
        assert_eq!(msg.args[0], "3");
        assert_eq!(msg.args[1], "tmp-1");
        assert_eq!(msg.args[6], "Migration");
        assert_eq!(msg.args[11], "2");
        assert_eq!(msg.args[17], "gpu");
        assert_eq!(msg.args[18], "group");
        assert_eq!(msg.args[20], "running");
        assert_eq!(msg.args[21], "2024-02-01T08:00:00+00:00");
        assert_eq!(msg.args[22], "");
        assert_eq!(msg.args[23], "normal");
    }

    #[test]
    fn test_server_status_carries_error() {
        let mut daemon = Daemon::new(DaemonAddress::new("n1:2127"));
        daemon.set_info(DaemonInfo {
            hostname: "n1".into(),
            ncores: 8,
            clock: 3000.0,
            ..Default::default()
        });
        daemon.disconnect_with(DaemonErrorKind::Nfs, "nfs mismatch");

        let msg = server_status(&daemon);
        assert_eq!(msg.args.len(), SERVER_STATUS_FIELDS);
        assert_eq!(msg.args[0], "n1");
        assert_eq!(msg.args[1], "n1:2127");
        assert_eq!(msg.args[2], "disconnected");
        assert_eq!(msg.args[3], "on");
        assert_eq!(msg.args[4], "8");
        assert_eq!(msg.args[8], "nfs");
        assert_eq!(msg.args[9], "nfs mismatch");
    }

    #[test]
    fn test_client_ini_parse_and_clock_diff() {
        let ini = ClientIni {
            display: "desk:10".into(),
            version: "1.0".into(),
            cookie: "abc".into(),
            session_id: "gui-1".into(),
            clock: "2024-01-01T00:00:00Z".into(),
            has_maestro: true,
        };
        let parsed = ClientIni::try_from(&Message::from(&ini)).unwrap();
        assert_eq!(parsed, ini);

        let now = DateTime::parse_from_rfc3339("2024-01-01T00:00:42Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parsed.clock_diff(now), 42);

        let bad = ClientIni {
            clock: "yesterday".into(),
            ..ini
        };
        assert_eq!(bad.clock_diff(now), 0);
    }

    #[test]
    fn test_short_ini_is_rejected() {
        let msg = Message::new(code::CLIENT_INI, ["desk", "1.0"]);
        assert!(ClientIni::try_from(&msg).is_err());
    }

    #[test]
    fn test_tags_and_confirm() {
        let daemon = Daemon::new(DaemonAddress::new("n1:2127")).with_tags(["b", "a"]);
        assert_eq!(server_tags(&daemon).args, vec!["n1:2127", "a,b"]);
        assert_eq!(
            confirm(&daemon.address, "disconnect", 2).args,
            vec!["n1:2127", "disconnect", "2"]
        );
    }
}

//! Messages exchanged between the maestro and its daemons.

use maestro_core::{DaemonInfo, JobId, JobStatus};

use crate::message::code;
use crate::{Message, ProtoError};

/// A message a daemon sends to the maestro.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonMessage {
    /// Handshake reply.
    Ret(DaemonInfo),
    /// Handshake refusal.
    Err { kind: String, detail: String },
    /// A fraction of a job was defined on the daemon.
    TaskDefined {
        job_id: JobId,
        fraction: u32,
        issues: String,
        cmd_line: String,
        external_id: String,
    },
    /// Status change of a fraction.
    Status {
        job_id: JobId,
        fraction: u32,
        status: JobStatus,
        parameter: String,
    },
    /// Output produced by a fraction.
    Output {
        job_id: JobId,
        fraction: u32,
        text: String,
    },
}

impl TryFrom<Message> for DaemonMessage {
    type Error = ProtoError;

    fn try_from(msg: Message) -> Result<Self, Self::Error> {
        match msg.code.as_str() {
            code::RET => {
                let a = msg.expect_args(9)?;
                Ok(Self::Ret(DaemonInfo {
                    hostname: a[0].clone(),
                    server_type: a[1].clone(),
                    model_name: a[2].clone(),
                    memory: a[3].clone(),
                    nfsid: a[4].clone(),
                    ncores: parse_field("ncores", &a[5])?,
                    clock: parse_field("clock", &a[6])?,
                    daemon_id: a[7].clone(),
                    mpi_flavors: maestro_core::split_tags(&a[8]).map(str::to_string).collect(),
                }))
            }
            code::ERR => {
                let a = msg.expect_args(2)?;
                Ok(Self::Err {
                    kind: a[0].clone(),
                    detail: a[1].clone(),
                })
            }
            code::TSK => {
                let a = msg.expect_args(5)?;
                Ok(Self::TaskDefined {
                    job_id: JobId::new(a[0].as_str()),
                    fraction: parse_field("fraction", &a[1])?,
                    issues: a[2].clone(),
                    cmd_line: a[3].clone(),
                    external_id: a[4].clone(),
                })
            }
            code::STA => {
                let a = msg.expect_args(4)?;
                Ok(Self::Status {
                    job_id: JobId::new(a[0].as_str()),
                    fraction: parse_field("fraction", &a[1])?,
                    status: a[2].parse().map_err(|_| ProtoError::InvalidField {
                        field: "status",
                        value: a[2].clone(),
                    })?,
                    parameter: a[3].clone(),
                })
            }
            code::OUT => {
                let a = msg.expect_args(3)?;
                Ok(Self::Output {
                    job_id: JobId::new(a[0].as_str()),
                    fraction: parse_field("fraction", &a[1])?,
                    text: a[2].clone(),
                })
            }
            _ => Err(ProtoError::UnknownCode(msg.code.clone())),
        }
    }
}

impl From<&DaemonMessage> for Message {
    fn from(msg: &DaemonMessage) -> Self {
        match msg {
            DaemonMessage::Ret(info) => Message::new(
                code::RET,
                [
                    info.hostname.clone(),
                    info.server_type.clone(),
                    info.model_name.clone(),
                    info.memory.clone(),
                    info.nfsid.clone(),
                    info.ncores.to_string(),
                    info.clock.to_string(),
                    info.daemon_id.clone(),
                    info.mpi_flavors.join(","),
                ],
            ),
            DaemonMessage::Err { kind, detail } => {
                Message::new(code::ERR, [kind.as_str(), detail.as_str()])
            }
            DaemonMessage::TaskDefined {
                job_id,
                fraction,
                issues,
                cmd_line,
                external_id,
            } => Message::new(
                code::TSK,
                [
                    job_id.to_string(),
                    fraction.to_string(),
                    issues.clone(),
                    cmd_line.clone(),
                    external_id.clone(),
                ],
            ),
            DaemonMessage::Status {
                job_id,
                fraction,
                status,
                parameter,
            } => Message::new(
                code::STA,
                [
                    job_id.to_string(),
                    fraction.to_string(),
                    status.as_wire().to_string(),
                    parameter.clone(),
                ],
            ),
            DaemonMessage::Output {
                job_id,
                fraction,
                text,
            } => Message::new(
                code::OUT,
                [job_id.to_string(), fraction.to_string(), text.clone()],
            ),
        }
    }
}

fn parse_field<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ProtoError> {
    value.trim().parse().map_err(|_| ProtoError::InvalidField {
        field,
        value: value.to_string(),
    })
}

/// Handshake sent to a daemon right after the transport is up.
pub fn ini(version: &str, hostname: &str, password: Option<&str>) -> Message {
    match password {
        Some(pass) => Message::new(code::INI, [version, hostname, pass]),
        None => Message::new(code::INI, [version, hostname]),
    }
}

/// Ask a daemon to kill one fraction.
pub fn kill(job_id: &JobId, fraction: u32) -> Message {
    Message::new(code::KIL, [job_id.to_string(), fraction.to_string()])
}

/// Tell a daemon it may free the outputs of one fraction.
pub fn clear(job_id: &JobId, fraction: u32) -> Message {
    Message::new(code::CLR, [job_id.to_string(), fraction.to_string()])
}

/// Ask a daemon to shut down.
pub fn quit() -> Message {
    Message::new(code::QUT, Vec::<String>::new())
}

/// Order to run one fraction of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCommand {
    pub job_id: JobId,
    pub fraction: u32,
    pub total: u32,
    pub speed: String,
    pub nice: String,
    pub flow: String,
    pub paths: String,
    pub nprocs: String,
    pub mpi_flavor: String,
    pub display: String,
    pub cookie: String,
}

impl From<&RunCommand> for Message {
    fn from(run: &RunCommand) -> Self {
        Message::new(
            code::RUN,
            [
                run.job_id.to_string(),
                run.fraction.to_string(),
                run.total.to_string(),
                run.speed.clone(),
                run.nice.clone(),
                run.flow.clone(),
                run.paths.clone(),
                run.nprocs.clone(),
                run.mpi_flavor.clone(),
                run.display.clone(),
                run.cookie.clone(),
            ],
        )
    }
}

impl TryFrom<&Message> for RunCommand {
    type Error = ProtoError;

    fn try_from(msg: &Message) -> Result<Self, Self::Error> {
        if msg.code != code::RUN {
            return Err(ProtoError::UnknownCode(msg.code.clone()));
        }
        let a = msg.expect_args(11)?;
        Ok(Self {
            job_id: JobId::new(a[0].as_str()),
            fraction: parse_field("fraction", &a[1])?,
            total: parse_field("total", &a[2])?,
            speed: a[3].clone(),
            nice: a[4].clone(),
            flow: a[5].clone(),
            paths: a[6].clone(),
            nprocs: a[7].clone(),
            mpi_flavor: a[8].clone(),
            display: a[9].clone(),
            cookie: a[10].clone(),
        })
    }
}

//! Daemon selection and job dispatch.
//!
//! A [`Runner`] is the plan for one job: the daemons chosen at submission
//! and the `RUN` order each of them receives. The plan is built right away
//! but only dispatched once the job may start (immediately, or when its
//! parent reaches a terminal status).

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::info;

use maestro_core::{split_tags, Client, Daemon, DaemonAddress, GroupType, JobId, JobInfo, RunType};
use maestro_proto::RunCommand;

use crate::error::DispatchError;

/// Logged in and not being torn down.
fn accepts_work(daemon: &Daemon) -> bool {
    daemon.is_logged() && !daemon.disconnecting
}

/// Whether `daemon` may run a job described by `info`.
pub fn is_eligible(daemon: &Daemon, info: &JobInfo) -> bool {
    if !accepts_work(daemon) {
        return false;
    }
    let in_group = match info.group_type {
        GroupType::Daemon => {
            daemon.address.as_str() == info.group || daemon.address.host() == info.group
        }
        GroupType::Group => info.group.is_empty() || daemon.has_tag(&info.group),
    };
    in_group && daemon.supports_mpi(split_tags(&info.mpi_flavor))
}

/// Eligible daemons, best first: highest `cores x clock`, ties by address.
pub fn eligible_daemons<'a>(
    daemons: impl IntoIterator<Item = &'a Daemon>,
    info: &JobInfo,
) -> Vec<&'a Daemon> {
    let mut eligible: Vec<&Daemon> = daemons
        .into_iter()
        .filter(|d| is_eligible(d, info))
        .collect();
    eligible.sort_by(|a, b| {
        score(b)
            .partial_cmp(&score(a))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.address.cmp(&b.address))
    });
    eligible
}

fn score(daemon: &Daemon) -> f64 {
    daemon.info().map(|i| i.score()).unwrap_or(0.0)
}

/// Daemons a job runs on: every eligible one for parallel runs, the best
/// one otherwise. Empty when nothing is eligible.
pub fn select_daemons<'a>(
    daemons: impl IntoIterator<Item = &'a Daemon>,
    info: &JobInfo,
) -> Vec<DaemonAddress> {
    let eligible = eligible_daemons(daemons, info);
    let take = match info.run_type {
        RunType::Parallel => eligible.len(),
        RunType::Normal => 1,
    };
    eligible
        .into_iter()
        .take(take)
        .map(|d| d.address.clone())
        .collect()
}

/// Dispatch plan of one job.
#[derive(Debug, Clone)]
pub struct Runner {
    job_id: JobId,
    daemons: Vec<DaemonAddress>,
    template: RunCommand,
}

impl Runner {
    /// Plan a job over `daemons`, in fraction order.
    pub fn new(
        job_id: JobId,
        daemons: Vec<DaemonAddress>,
        info: &JobInfo,
        flow: impl Into<String>,
        paths: impl Into<String>,
        client: Option<&Client>,
    ) -> Self {
        let total = daemons.len() as u32;
        let template = RunCommand {
            job_id: job_id.clone(),
            fraction: 0,
            total,
            speed: info.speed.clone(),
            nice: info.nice.clone(),
            flow: flow.into(),
            paths: paths.into(),
            nprocs: if info.nprocs.is_empty() {
                total.to_string()
            } else {
                info.nprocs.clone()
            },
            mpi_flavor: info.mpi_flavor.clone(),
            display: client.map(Client::display).unwrap_or_default(),
            cookie: client.map(|c| c.cookie.clone()).unwrap_or_default(),
        };
        Self {
            job_id,
            daemons,
            template,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn daemons(&self) -> &[DaemonAddress] {
        &self.daemons
    }

    pub fn total(&self) -> u32 {
        self.daemons.len() as u32
    }

    /// `addr,1,addr,1,...`
    pub fn servers_list(&self) -> String {
        self.daemons
            .iter()
            .map(|d| format!("{d},1"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Record the plan in the job metadata sent to clients.
    pub fn describe(&self, info: &mut JobInfo) {
        info.servers_list = self.servers_list();
        info.nprocs = self.template.nprocs.clone();
        if !info.mpi_flavor.is_empty() {
            info.mpi_owner = self
                .daemons
                .first()
                .map(DaemonAddress::to_string)
                .unwrap_or_default();
        }
    }

    /// `RUN` orders for every fraction. Fails without producing any order
    /// when one of the planned daemons no longer accepts work.
    pub fn orders(
        &self,
        daemons: &BTreeMap<DaemonAddress, Daemon>,
    ) -> Result<Vec<(DaemonAddress, RunCommand)>, DispatchError> {
        if let Some(gone) = self
            .daemons
            .iter()
            .find(|a| !daemons.get(*a).is_some_and(accepts_work))
        {
            return Err(DispatchError::DaemonUnavailable(gone.clone()));
        }

        info!(
            job_id = %self.job_id,
            total = self.total(),
            servers = %self.servers_list(),
            "Dispatching job"
        );

        Ok(self
            .daemons
            .iter()
            .enumerate()
            .map(|(i, address)| {
                let run = RunCommand {
                    fraction: i as u32 + 1,
                    ..self.template.clone()
                };
                (address.clone(), run)
            })
            .collect())
    }
}

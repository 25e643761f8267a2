//! Job: one logical run request fanned out into tasks.
//!
//! A job owns its tasks and folds their individual statuses into one
//! aggregate status. Until every fraction has been attached the job is
//! *partial*: only FAILED and CANCELED reports move it (fail-fast), every
//! other report waits for the remaining fractions.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CoreError, DaemonAddress, JobId, JobStatus, Task};

/// How `group` selects the daemons of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    /// `group` is a tag; empty means every daemon.
    #[default]
    Group,
    /// `group` is the address of one daemon.
    Daemon,
}

impl GroupType {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Daemon => "daemon",
        }
    }
}

impl FromStr for GroupType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "group" => Ok(Self::Group),
            "daemon" => Ok(Self::Daemon),
            other => Err(CoreError::InvalidInput(format!("unknown group type '{other}'"))),
        }
    }
}

/// Whether a job runs on the best daemon or on every eligible one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    #[default]
    Normal,
    Parallel,
}

impl RunType {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Parallel => "parallel",
        }
    }
}

impl FromStr for RunType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "normal" => Ok(Self::Normal),
            "parallel" => Ok(Self::Parallel),
            other => Err(CoreError::InvalidInput(format!("unknown run type '{other}'"))),
        }
    }
}

/// Submission metadata of a job, as sent by the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Client-local id the GUI used before the server assigned one.
    pub temp_id: String,
    pub flow_id: String,
    pub title: String,
    pub description: String,
    /// Host the submitting client runs on.
    pub hostname: String,
    /// How many times the flow has been run.
    pub counter: String,
    pub snapshot_title: String,
    pub snapshot_id: String,
    pub nice: String,
    pub speed: String,
    pub input: String,
    pub output: String,
    pub error: String,
    pub group: String,
    pub group_type: GroupType,
    pub run_type: RunType,
    /// Comma-separated MPI flavors the flow needs; empty if none.
    pub mpi_flavor: String,
    /// Daemon that owns the MPI run.
    pub mpi_owner: String,
    pub nprocs: String,
    /// `addr,weight,addr,weight,...` of the selected daemons.
    pub servers_list: String,
}

/// Side effects requested by the job after a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// The aggregate status changed.
    StatusChanged {
        old: JobStatus,
        new: JobStatus,
        parameter: String,
    },
    /// Issues were reported; carries the new text.
    Issued(String),
    /// The task with this fraction must be killed on its daemon.
    KillTask(u32),
}

/// A logical execution request composed of `total` tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Server-assigned id.
    pub id: JobId,

    /// Submission metadata.
    pub info: JobInfo,

    /// Job this one waits on, if any. Lookup only.
    pub parent_id: Option<JobId>,

    /// Fan-out, fixed at submission.
    pub total: u32,

    /// When the job was submitted.
    pub submit_date: DateTime<Utc>,

    tasks: BTreeMap<u32, Task>,
    status: JobStatus,
    status_parameter: String,
    has_run: bool,
    has_issued: bool,
    issues: String,
    children: Vec<JobId>,
}

impl Job {
    /// Create a new Job in the INITIAL status.
    pub fn new(id: JobId, info: JobInfo, total: u32) -> Self {
        Self {
            id,
            info,
            parent_id: None,
            total,
            submit_date: Utc::now(),
            tasks: BTreeMap::new(),
            status: JobStatus::Initial,
            status_parameter: String::new(),
            has_run: false,
            has_issued: false,
            issues: String::new(),
            children: Vec::new(),
        }
    }

    /// Builder method to set the parent job.
    pub fn with_parent(mut self, parent: Option<JobId>) -> Self {
        self.parent_id = parent;
        self
    }

    /// Stored aggregate status.
    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Parameter of the last status change (a date, or a parent id).
    pub fn status_parameter(&self) -> &str {
        &self.status_parameter
    }

    /// Issues accumulated from all tasks.
    pub fn issues(&self) -> &str {
        &self.issues
    }

    /// Whether the RUNNING transition already happened.
    pub fn has_run(&self) -> bool {
        self.has_run
    }

    /// Attached tasks in fraction order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task(&self, fraction: u32) -> Option<&Task> {
        self.tasks.get(&fraction)
    }

    pub fn n_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// True once every fraction has been attached.
    pub fn is_complete(&self) -> bool {
        self.tasks.len() == self.total as usize
    }

    /// Jobs queued behind this one, in dispatch order.
    pub fn children(&self) -> &[JobId] {
        &self.children
    }

    /// Status computed from the attached tasks only.
    ///
    /// Without tasks, with every fraction attached, or once the job ended
    /// this is the stored status. In between, the first FAILED, FINISHED,
    /// CANCELED or QUEUED task decides; if every attached task runs the job
    /// runs. Any other mix is rejected.
    pub fn partial_status(&self) -> Result<JobStatus, CoreError> {
        if self.tasks.is_empty() || self.is_complete() || self.status.is_terminal() {
            return Ok(self.status);
        }

        if let Some(task) = self.tasks.values().find(|t| {
            matches!(
                t.status,
                JobStatus::Failed | JobStatus::Finished | JobStatus::Canceled | JobStatus::Queued
            )
        }) {
            return Ok(task.status);
        }

        if self.tasks.values().all(|t| t.status == JobStatus::Running) {
            return Ok(JobStatus::Running);
        }

        Err(CoreError::InconsistentPartialStatus {
            job: self.id.to_string(),
            statuses: self
                .tasks
                .values()
                .map(|t| t.status.as_wire())
                .collect::<Vec<_>>()
                .join(","),
        })
    }

    /// Whether a kill request makes sense now.
    pub fn can_kill(&self) -> Result<bool, CoreError> {
        Ok(matches!(
            self.partial_status()?,
            JobStatus::Queued | JobStatus::Running
        ))
    }

    /// Whether the job may be closed.
    pub fn can_close(&self) -> Result<bool, CoreError> {
        Ok(self.partial_status()?.is_terminal())
    }

    /// Attach a task reported by a daemon.
    pub fn attach_task(&mut self, task: Task) -> Result<Vec<JobEvent>, CoreError> {
        if task.fraction == 0 || task.fraction > self.total {
            return Err(CoreError::InvalidInput(format!(
                "fraction {} out of range for job {} (total {})",
                task.fraction, self.id, self.total
            )));
        }
        if self.tasks.contains_key(&task.fraction) {
            return Err(CoreError::DuplicateFraction {
                job: self.id.to_string(),
                fraction: task.fraction,
            });
        }

        let mut events = Vec::new();
        if !task.issues.is_empty() {
            self.issues.push_str(&task.issues);
            events.push(JobEvent::Issued(task.issues.clone()));
        }
        if self.status.is_terminal() && !task.is_terminal() {
            events.push(JobEvent::KillTask(task.fraction));
        }
        self.tasks.insert(task.fraction, task);
        Ok(events)
    }

    /// Apply a status reported for one fraction and re-aggregate.
    pub fn update_task(
        &mut self,
        fraction: u32,
        status: JobStatus,
        parameter: &str,
    ) -> Result<Vec<JobEvent>, CoreError> {
        let task = self
            .tasks
            .get_mut(&fraction)
            .ok_or_else(|| CoreError::TaskNotFound(format!("{}:{}", self.id, fraction)))?;
        task.set_status(status, parameter)?;
        self.aggregate(fraction, status, parameter)
    }

    fn aggregate(
        &mut self,
        fraction: u32,
        status: JobStatus,
        parameter: &str,
    ) -> Result<Vec<JobEvent>, CoreError> {
        if self.status.is_terminal() {
            let live = self.tasks.get(&fraction).is_some_and(|t| !t.is_terminal());
            return Ok(if live {
                vec![JobEvent::KillTask(fraction)]
            } else {
                Vec::new()
            });
        }

        if !self.is_complete() && !matches!(status, JobStatus::Canceled | JobStatus::Failed) {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        match status {
            JobStatus::Issued => {
                if !self.has_issued {
                    self.has_issued = true;
                    if !parameter.is_empty() {
                        self.issues.push_str(parameter);
                    }
                    events.push(JobEvent::Issued(parameter.to_string()));
                }
            }
            JobStatus::Running => {
                if !self.has_run {
                    self.has_run = true;
                    events.push(self.change_status(JobStatus::Running, parameter));
                }
            }
            JobStatus::Requeued | JobStatus::Initial => {}
            JobStatus::Queued => {
                if self.total != 1 {
                    return Err(CoreError::InvalidStateTransition {
                        from: self.status.to_string(),
                        to: format!("{} (fraction {fraction} of {})", status, self.total),
                    });
                }
                events.push(self.change_status(JobStatus::Queued, parameter));
            }
            JobStatus::Canceled | JobStatus::Failed => {
                events.push(self.change_status(status, parameter));
                events.extend(
                    self.tasks
                        .values()
                        .filter(|t| t.fraction != fraction && !t.is_terminal())
                        .map(|t| JobEvent::KillTask(t.fraction)),
                );
            }
            JobStatus::Finished => {
                if self
                    .tasks
                    .values()
                    .all(|t| t.status == JobStatus::Finished)
                {
                    events.push(self.change_status(JobStatus::Finished, parameter));
                }
            }
        }
        Ok(events)
    }

    fn change_status(&mut self, new: JobStatus, parameter: &str) -> JobEvent {
        let old = self.status;
        self.status = new;
        self.status_parameter = parameter.to_string();
        JobEvent::StatusChanged {
            old,
            new,
            parameter: parameter.to_string(),
        }
    }

    /// Fail the job without contacting any daemon.
    pub fn fail(&mut self, issue: &str) -> Vec<JobEvent> {
        let mut events = Vec::new();
        if !issue.is_empty() {
            self.issues.push_str(issue);
            events.push(JobEvent::Issued(issue.to_string()));
        }
        if !self.status.is_terminal() {
            events.push(self.change_status(JobStatus::Failed, ""));
        }
        events
    }

    /// Mark the job as waiting on `parent`.
    pub fn queue_behind(&mut self, parent: &JobId) -> JobEvent {
        self.parent_id = Some(parent.clone());
        self.change_status(JobStatus::Queued, parent.as_str())
    }

    /// Cancel a job that never reached a daemon.
    pub fn cancel_unqueued(&mut self) -> Result<JobEvent, CoreError> {
        if !self.tasks.is_empty() || self.status != JobStatus::Queued {
            return Err(CoreError::NotQueued(self.id.to_string()));
        }
        self.parent_id = None;
        Ok(self.change_status(JobStatus::Canceled, ""))
    }

    /// Queue `child` to run after this job reaches a terminal status.
    pub fn append_child(&mut self, child: JobId) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::InvalidStateTransition {
                from: self.status.to_string(),
                to: format!("parent of {child}"),
            });
        }
        self.children.push(child);
        Ok(())
    }

    /// Take every queued child, leaving the queue empty.
    pub fn take_children(&mut self) -> Vec<JobId> {
        std::mem::take(&mut self.children)
    }

    /// Replace `child` by `replacement`, in place. Returns false if `child`
    /// is not queued behind this job.
    pub fn splice_child(&mut self, child: &JobId, replacement: Vec<JobId>) -> bool {
        match self.children.iter().position(|c| c == child) {
            Some(pos) => {
                self.children.splice(pos..=pos, replacement);
                true
            }
            None => false,
        }
    }

    /// Append daemon output to a task.
    pub fn append_output(&mut self, fraction: u32, text: &str) -> Result<(), CoreError> {
        let task = self
            .tasks
            .get_mut(&fraction)
            .ok_or_else(|| CoreError::TaskNotFound(format!("{}:{}", self.id, fraction)))?;
        task.append_output(text);
        Ok(())
    }

    /// Command line of a task, with a header naming the fraction and daemon
    /// when the job is split.
    pub fn command_line(&self, fraction: u32) -> Option<String> {
        let task = self.tasks.get(&fraction)?;
        if self.total == 1 {
            return Some(task.cmd_line.clone());
        }
        Some(format!(
            "Command line for task {} of {} (Server: {})\n{}",
            fraction, self.total, task.daemon, task.cmd_line
        ))
    }

    /// Earliest start of any task.
    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.tasks.values().filter_map(|t| t.start_date).min()
    }

    /// Latest finish of any task.
    pub fn finish_date(&self) -> Option<DateTime<Utc>> {
        self.tasks.values().filter_map(|t| t.finish_date).max()
    }

    /// Fractions still alive, with the daemon running them.
    pub fn live_tasks(&self) -> Vec<(u32, DaemonAddress)> {
        self.tasks
            .values()
            .filter(|t| !t.is_terminal())
            .map(|t| (t.fraction, t.daemon.clone()))
            .collect()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job {} ({}/{} tasks, {})", self.id, self.tasks.len(), self.total, self.status)
    }
}

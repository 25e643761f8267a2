//! Job submission, dispatch, task reports and queueing.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use maestro_core::{
    ClientId, CoreError, DaemonAddress, Job, JobEvent, JobId, JobInfo, JobStatus, Task, TaskKey,
};
use maestro_proto::{client, daemon, Message, Uri};

use super::{job_order, Coordinator};
use crate::error::RequestError;
use crate::runner::{select_daemons, Runner};

/// Build the submission metadata of a `/run` request.
pub(crate) fn job_info(uri: &Uri) -> Result<JobInfo, RequestError> {
    let p = |key: &str| uri.param_or_empty(key).to_string();
    Ok(JobInfo {
        temp_id: p("temp_id"),
        flow_id: p("flow_id"),
        title: p("title"),
        description: p("description"),
        hostname: p("hostname"),
        counter: p("counter"),
        snapshot_title: p("snapshot_title"),
        snapshot_id: p("snapshot_id"),
        nice: p("nice"),
        speed: p("speed"),
        input: p("input"),
        output: p("output"),
        error: p("error"),
        group: p("group"),
        group_type: uri.param_or_empty("group_type").parse()?,
        run_type: uri.param_or_empty("run_type").parse()?,
        mpi_flavor: p("mpi"),
        mpi_owner: String::new(),
        nprocs: p("nprocs"),
        servers_list: String::new(),
    })
}

impl Coordinator {
    /// Resolve a job id sent by a client; it may be one of its temp ids.
    pub(crate) fn resolve_job(&self, client: &ClientId, raw: &str) -> Result<JobId, CoreError> {
        let id = JobId::new(raw);
        if self.jobs.contains_key(&id) {
            return Ok(id);
        }
        self.clients
            .get(client)
            .and_then(|c| c.client.resolve_job(raw))
            .filter(|id| self.jobs.contains_key(*id))
            .cloned()
            .ok_or_else(|| CoreError::JobNotFound(raw.to_string()))
    }

    /// Submit a job.
    pub(crate) fn submit(
        &mut self,
        requester: &ClientId,
        uri: &Uri,
        flow: String,
    ) -> Result<JobId, RequestError> {
        let mut info = job_info(uri)?;
        let parent = match uri.param("parent_id").filter(|p| !p.is_empty()) {
            Some(raw) => self.resolve_job(requester, raw).ok(),
            None => None,
        };

        self.next_job += 1;
        let id = JobId::from_counter(self.next_job);
        if let Some(link) = self.clients.get_mut(requester) {
            link.client.remember_temp_id(info.temp_id.clone(), id.clone());
        }

        let selected = select_daemons(self.daemons.values(), &info);
        if selected.is_empty() {
            let issue = if info.group.is_empty() {
                "No eligible daemon for this job".to_string()
            } else {
                format!("No eligible daemon in group '{}'", info.group)
            };
            warn!(job_id = %id, group = %info.group, "No eligible daemon");
            let mut job = Job::new(id.clone(), info, 0);
            let events = job.fail(&issue);
            self.broadcast(client::job_def(&job));
            self.jobs.insert(id.clone(), job);
            self.apply_job_events(&id, events);
            return Ok(id);
        }

        let runner = Runner::new(
            id.clone(),
            selected,
            &info,
            flow,
            uri.param_or_empty("paths"),
            self.clients.get(requester).map(|l| &l.client),
        );
        runner.describe(&mut info);
        let mut job = Job::new(id.clone(), info, runner.total());

        let live_parent = parent.filter(|p| {
            self.jobs
                .get(p)
                .is_some_and(|parent| !parent.status().is_terminal())
        });
        info!(
            job_id = %id,
            title = %job.info.title,
            total = job.total,
            parent = ?live_parent,
            "Job submitted"
        );

        match live_parent {
            Some(parent_id) => {
                if let Some(parent) = self.jobs.get_mut(&parent_id) {
                    parent.append_child(id.clone())?;
                }
                let queued = job.queue_behind(&parent_id);
                self.broadcast(client::job_def(&job));
                self.jobs.insert(id.clone(), job);
                self.runners.insert(id.clone(), runner);
                self.apply_job_events(&id, vec![queued]);
            }
            None => {
                self.broadcast(client::job_def(&job));
                self.jobs.insert(id.clone(), job);
                self.dispatch(runner);
            }
        }
        Ok(id)
    }

    /// Send the `RUN` orders of a job, or fail it when its daemons left.
    fn dispatch(&mut self, runner: Runner) {
        let id = runner.job_id().clone();
        match runner.orders(&self.daemons) {
            Ok(orders) => {
                let mut plan = BTreeMap::new();
                let mut undelivered = None;
                for (address, run) in orders {
                    if !self.send_daemon(&address, Message::from(&run)) {
                        warn!(job_id = %id, address = %address, "Run order not delivered");
                        undelivered.get_or_insert_with(|| address.clone());
                    }
                    plan.insert(run.fraction, address);
                }
                self.job_def_queue.push_back(id.clone());
                self.planned.insert(id.clone(), plan);
                if let Some(address) = undelivered {
                    self.fail_undefined(&id, &address);
                }
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "Dispatch failed");
                let events = match self.jobs.get_mut(&id) {
                    Some(job) => job.fail(&e.to_string()),
                    None => return,
                };
                self.apply_job_events(&id, events);
            }
        }
    }

    /// Carry out the side effects a job asked for.
    pub(super) fn apply_job_events(&mut self, job_id: &JobId, events: Vec<JobEvent>) {
        for event in events {
            match event {
                JobEvent::Issued(_) => {
                    if let Some(job) = self.jobs.get(job_id) {
                        self.broadcast(client::job_issues(job_id, job.issues()));
                    }
                }
                JobEvent::KillTask(fraction) => self.kill_task(job_id, fraction),
                JobEvent::StatusChanged {
                    old,
                    new,
                    parameter,
                } => {
                    info!(job_id = %job_id, from = %old, to = %new, "Job status changed");
                    if new == JobStatus::Running {
                        self.mark_ready(job_id);
                        continue;
                    }
                    self.broadcast(client::job_status(job_id, new, &parameter));
                    if new.is_terminal() {
                        self.planned.remove(job_id);
                        self.mark_ready(job_id);
                        self.release_children(job_id);
                    }
                }
            }
        }
    }

    /// Allow the definition of `job_id` to leave the queue.
    fn mark_ready(&mut self, job_id: &JobId) {
        if self.job_def_queue.contains(job_id) {
            self.ready.insert(job_id.clone());
            self.release_job_defs();
        } else if self
            .jobs
            .get(job_id)
            .is_some_and(|j| j.status() == JobStatus::Running)
        {
            self.announce_running(job_id);
        }
    }

    /// Pop every ready job from the front of the definition queue.
    fn release_job_defs(&mut self) {
        while let Some(front) = self.job_def_queue.front() {
            if !self.ready.contains(front) {
                break;
            }
            let Some(id) = self.job_def_queue.pop_front() else {
                break;
            };
            self.ready.remove(&id);
            if let Some(job) = self.jobs.get(&id) {
                debug!(job_id = %id, "Releasing job definition");
                self.broadcast(client::job_def(job));
                if job.status() == JobStatus::Running {
                    self.announce_running(&id);
                }
            }
        }
    }

    /// Broadcast RUNNING, at most once per job.
    fn announce_running(&mut self, job_id: &JobId) {
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        if self.running_announced.insert(job_id.clone()) {
            self.broadcast(client::job_status(
                job_id,
                JobStatus::Running,
                job.status_parameter(),
            ));
        }
    }

    /// Dispatch every job queued behind a job that just terminated.
    fn release_children(&mut self, job_id: &JobId) {
        let children = match self.jobs.get_mut(job_id) {
            Some(job) => job.take_children(),
            None => return,
        };
        for child in children {
            match self.runners.remove(&child) {
                Some(runner) => {
                    info!(job_id = %child, parent = %job_id, "Releasing queued job");
                    self.dispatch(runner);
                }
                None => debug!(job_id = %child, "Queued job already gone"),
            }
        }
    }

    /// Fail every job that still waits for `address` to define one of its
    /// tasks. Called once the daemon can no longer answer a `RUN`.
    pub(super) fn fail_undefined_on(&mut self, address: &DaemonAddress) {
        let mut stranded: Vec<JobId> = self
            .planned
            .iter()
            .filter(|(_, plan)| plan.values().any(|a| a == address))
            .map(|(id, _)| id.clone())
            .collect();
        stranded.sort_by_key(job_order);
        for id in stranded {
            self.fail_undefined(&id, address);
        }
    }

    /// Fail a job whose `RUN` order to `address` went unanswered, killing
    /// the tasks other daemons already started.
    fn fail_undefined(&mut self, id: &JobId, address: &DaemonAddress) {
        self.planned.remove(id);
        let Some(job) = self.jobs.get_mut(id) else {
            return;
        };
        if job.status().is_terminal() {
            return;
        }
        warn!(job_id = %id, address = %address, "Daemon left before defining its tasks");
        let live: Vec<u32> = job
            .tasks()
            .filter(|t| !t.is_terminal())
            .map(|t| t.fraction)
            .collect();
        let mut events = job.fail(&format!(
            "Daemon {address} was lost before starting its tasks"
        ));
        events.extend(live.into_iter().map(JobEvent::KillTask));
        self.apply_job_events(id, events);
    }

    /// Send `KIL` for one task, unless it already ended.
    fn kill_task(&mut self, job_id: &JobId, fraction: u32) {
        let Some(task) = self.jobs.get(job_id).and_then(|j| j.task(fraction)) else {
            return;
        };
        if task.is_terminal() {
            return;
        }
        let address = task.daemon.clone();
        if self.daemons.get(&address).is_some_and(|d| d.disconnecting) {
            return;
        }
        debug!(job_id = %job_id, fraction, address = %address, "Killing task");
        self.send_daemon(&address, daemon::kill(job_id, fraction));
    }

    pub(super) fn on_task_defined(
        &mut self,
        address: &DaemonAddress,
        key: TaskKey,
        issues: String,
        cmd_line: String,
        external_id: String,
    ) {
        if self.tasks.contains_key(&key) {
            warn!(task = %key, address = %address, "Task defined twice");
            return;
        }
        let Some(job) = self.jobs.get_mut(&key.job) else {
            warn!(task = %key, address = %address, "Task defined for an unknown job");
            return;
        };

        let task = Task::new(key.job.clone(), key.fraction, address.clone())
            .with_cmd_line(cmd_line)
            .with_issues(issues)
            .with_external_id(external_id);
        let events = match job.attach_task(task) {
            Ok(events) => events,
            Err(e) => {
                warn!(task = %key, error = %e, "Task rejected");
                return;
            }
        };
        let cmd = job.command_line(key.fraction).unwrap_or_default();

        debug!(task = %key, address = %address, "Task defined");
        if let Some(plan) = self.planned.get_mut(&key.job) {
            plan.remove(&key.fraction);
            if plan.is_empty() {
                self.planned.remove(&key.job);
            }
        }
        self.tasks.insert(key.clone(), address.clone());
        if let Some(daemon) = self.daemons.get_mut(address) {
            daemon.task_started();
        }
        self.broadcast(client::job_cmd(&key.job, key.fraction, &cmd));
        self.apply_job_events(&key.job, events);
    }

    pub(super) fn on_task_status(
        &mut self,
        address: &DaemonAddress,
        key: TaskKey,
        status: JobStatus,
        parameter: &str,
    ) {
        match self.tasks.get(&key) {
            Some(owner) if owner == address => {}
            Some(owner) => {
                warn!(task = %key, address = %address, owner = %owner, "Status from a daemon not owning the task");
                return;
            }
            None => {
                warn!(task = %key, address = %address, "Status for an unknown task");
                return;
            }
        }

        debug!(task = %key, status = %status, "Task status");
        match self.update_task(&key, status, parameter) {
            Ok(events) => self.apply_job_events(&key.job, events),
            Err(e) => warn!(task = %key, status = %status, error = %e, "Task status rejected"),
        }
    }

    /// Update one task and keep the owning daemon's counter in step.
    pub(super) fn update_task(
        &mut self,
        key: &TaskKey,
        status: JobStatus,
        parameter: &str,
    ) -> Result<Vec<JobEvent>, CoreError> {
        let job = self
            .jobs
            .get_mut(&key.job)
            .ok_or_else(|| CoreError::JobNotFound(key.job.to_string()))?;
        let was_live = job.task(key.fraction).is_some_and(|t| !t.is_terminal());
        let events = job.update_task(key.fraction, status, parameter)?;
        let now_done = job.task(key.fraction).is_some_and(Task::is_terminal);

        if was_live && now_done {
            if let Some(daemon) = self
                .tasks
                .get(key)
                .and_then(|owner| self.daemons.get_mut(owner))
            {
                daemon.task_completed();
            }
        }
        Ok(events)
    }

    pub(super) fn on_task_output(&mut self, address: &DaemonAddress, key: TaskKey, text: &str) {
        if self.tasks.get(&key) != Some(address) {
            warn!(task = %key, address = %address, "Output for a task this daemon does not own");
            return;
        }
        let Some(job) = self.jobs.get_mut(&key.job) else {
            return;
        };
        if let Err(e) = job.append_output(key.fraction, text) {
            warn!(task = %key, error = %e, "Output dropped");
            return;
        }
        self.broadcast(client::job_output(&key.job, key.fraction, text));
    }

    /// Kill a job. A job still waiting on its parent is unqueued instead.
    pub(crate) fn kill_job(&mut self, id: &JobId) -> Result<(), RequestError> {
        if self.runners.contains_key(id) {
            return self.unqueue(id);
        }
        let job = self
            .jobs
            .get(id)
            .ok_or_else(|| CoreError::JobNotFound(id.to_string()))?;
        if !job.can_kill()? {
            return Err(CoreError::NotKillable(id.to_string()).into());
        }

        let live = job.live_tasks();
        info!(job_id = %id, tasks = live.len(), "Killing job");
        for (fraction, address) in live {
            self.send_daemon(&address, daemon::kill(id, fraction));
        }
        Ok(())
    }

    /// Cancel a job waiting on its parent, moving its own queued children
    /// up to that parent in its place.
    pub(crate) fn unqueue(&mut self, id: &JobId) -> Result<(), RequestError> {
        let job = self
            .jobs
            .get(id)
            .ok_or_else(|| CoreError::JobNotFound(id.to_string()))?;
        let parent_id = match &job.parent_id {
            Some(parent)
                if self.runners.contains_key(id)
                    && job.status() == JobStatus::Queued
                    && job.n_tasks() == 0 =>
            {
                parent.clone()
            }
            _ => return Err(CoreError::NotQueued(id.to_string()).into()),
        };

        let grandchildren = match self.jobs.get_mut(id) {
            Some(job) => job.take_children(),
            None => Vec::new(),
        };
        let spliced = self
            .jobs
            .get_mut(&parent_id)
            .is_some_and(|parent| parent.splice_child(id, grandchildren.clone()));
        if !spliced {
            if let Some(job) = self.jobs.get_mut(id) {
                for child in grandchildren {
                    let _ = job.append_child(child);
                }
            }
            return Err(CoreError::NotQueued(id.to_string()).into());
        }

        info!(job_id = %id, parent = %parent_id, moved = grandchildren.len(), "Unqueueing job");
        for child in &grandchildren {
            let Some(child_job) = self.jobs.get_mut(child) else {
                continue;
            };
            let queued = child_job.queue_behind(&parent_id);
            let def = client::job_def(child_job);
            self.broadcast(def);
            self.apply_job_events(child, vec![queued]);
        }

        self.runners.remove(id);
        let canceled = match self.jobs.get_mut(id) {
            Some(job) => job.cancel_unqueued()?,
            None => return Ok(()),
        };
        self.apply_job_events(id, vec![canceled]);
        Ok(())
    }

    /// Close a terminal job: free its tasks on their daemons and forget it.
    pub(crate) fn close_job(&mut self, id: &JobId) -> Result<(), RequestError> {
        let job = self
            .jobs
            .get(id)
            .ok_or_else(|| CoreError::JobNotFound(id.to_string()))?;
        if !job.can_close()? {
            return Err(CoreError::NotClosable(id.to_string()).into());
        }
        let Some(job) = self.jobs.remove(id) else {
            return Ok(());
        };

        for task in job.tasks() {
            let key = task.key();
            let owner = self.tasks.remove(&key).unwrap_or_else(|| task.daemon.clone());
            let Some(daemon) = self.daemons.get_mut(&owner) else {
                continue;
            };
            if !task.is_terminal() {
                daemon.task_completed();
            }
            if daemon.is_logged() {
                self.send_daemon(&owner, daemon::clear(id, task.fraction));
            }
        }

        self.runners.remove(id);
        self.job_def_queue.retain(|j| j != id);
        self.ready.remove(id);
        self.running_announced.remove(id);
        info!(job_id = %id, closed_at = %Utc::now().to_rfc3339(), "Job closed");
        self.release_job_defs();
        Ok(())
    }
}

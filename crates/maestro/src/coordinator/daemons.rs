//! Daemon connection state machine, connect-all and daemon management.

use tracing::{debug, info, warn};

use maestro_core::{
    split_tags, ClientId, CoreError, Daemon, DaemonAddress, DaemonErrorKind, DaemonInfo,
    DaemonState, JobStatus, TaskKey,
};
use maestro_proto::{client, daemon, DaemonMessage, Frame, HttpResponse, PROTOCOL_VERSION};

use super::{ConnectAll, Coordinator, Prompt};
use crate::error::RequestError;
use crate::event::Event;

/// What a confirmed teardown request does after killing the tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Teardown {
    Disconnect,
    Stop,
    Remove,
}

impl Teardown {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnect => "disconnect",
            Self::Stop => "stop",
            Self::Remove => "remove",
        }
    }
}

/// How a tag request changes the tag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TagChange {
    Replace,
    Insert,
    Remove,
}

impl Coordinator {
    fn daemon(&self, address: &DaemonAddress) -> Result<&Daemon, CoreError> {
        self.daemons
            .get(address)
            .ok_or_else(|| CoreError::DaemonNotFound(address.to_string()))
    }

    fn daemon_mut(&mut self, address: &DaemonAddress) -> Result<&mut Daemon, CoreError> {
        self.daemons
            .get_mut(address)
            .ok_or_else(|| CoreError::DaemonNotFound(address.to_string()))
    }

    fn broadcast_status(&self, address: &DaemonAddress) {
        if let Some(daemon) = self.daemons.get(address) {
            self.broadcast(client::server_status(daemon));
        }
    }

    /// Add a daemon, or merge `tags` into the existing record.
    /// Returns true when a new record was created.
    pub(crate) fn add_daemon<'a>(
        &mut self,
        address: &DaemonAddress,
        tags: impl IntoIterator<Item = &'a str>,
    ) -> bool {
        if let Some(existing) = self.daemons.get_mut(address) {
            if existing.merge_tags(tags) {
                let msg = client::server_tags(existing);
                self.broadcast(msg);
                if self.persisted.contains(address) {
                    self.persist();
                }
            }
            return false;
        }

        let daemon = Daemon::new(address.clone()).with_tags(tags);
        info!(address = %address, tags = %daemon.tags_string(), "Daemon added");
        self.broadcast(client::server_status(&daemon));
        self.broadcast(client::server_tags(&daemon));
        self.broadcast(client::autoconnect(&daemon));
        self.daemons.insert(address.clone(), daemon);
        true
    }

    /// Start a connect attempt. A daemon already connecting or logged in
    /// is left alone.
    pub(crate) fn connect_daemon(
        &mut self,
        address: &DaemonAddress,
        origin: Option<ClientId>,
    ) -> Result<(), CoreError> {
        let daemon = self.daemon_mut(address)?;
        if daemon.state() != DaemonState::Disconnected {
            debug!(address = %address, state = %daemon.state(), "Daemon already connected");
            return Ok(());
        }
        daemon.set_state(DaemonState::Run)?;
        daemon.disconnecting = false;

        self.next_generation += 1;
        let link = self
            .connector
            .open(address, self.next_generation, self.events.clone());
        if let Some(old) = self.links.insert(address.clone(), link) {
            old.close();
        }
        match origin {
            Some(id) => self.connect_origin.insert(address.clone(), id),
            None => self.connect_origin.remove(address),
        };

        info!(address = %address, generation = self.next_generation, "Connecting daemon");
        self.broadcast_status(address);
        Ok(())
    }

    pub(super) fn on_daemon_connected(&mut self, address: &DaemonAddress) {
        let password = self.passwords.get(address).map(String::as_str);
        let ini = daemon::ini(PROTOCOL_VERSION, &self.config.hostname, password);
        debug!(address = %address, "Sending handshake");
        self.send_daemon(address, ini);
    }

    pub(super) fn on_daemon_frame(&mut self, address: &DaemonAddress, frame: Frame) {
        let msg = match frame {
            Frame::Message(msg) => msg,
            other => {
                debug!(address = %address, frame = ?other, "Ignoring HTTP-style frame from daemon");
                return;
            }
        };

        match DaemonMessage::try_from(msg) {
            Ok(DaemonMessage::Ret(info)) => self.on_handshake(address, info),
            Ok(DaemonMessage::Err { kind, detail }) => {
                self.on_handshake_refused(address, &kind, &detail)
            }
            Ok(DaemonMessage::TaskDefined {
                job_id,
                fraction,
                issues,
                cmd_line,
                external_id,
            }) => self.on_task_defined(
                address,
                TaskKey::new(job_id, fraction),
                issues,
                cmd_line,
                external_id,
            ),
            Ok(DaemonMessage::Status {
                job_id,
                fraction,
                status,
                parameter,
            }) => self.on_task_status(address, TaskKey::new(job_id, fraction), status, &parameter),
            Ok(DaemonMessage::Output {
                job_id,
                fraction,
                text,
            }) => self.on_task_output(address, TaskKey::new(job_id, fraction), &text),
            Err(e) => warn!(address = %address, error = %e, "Malformed daemon message"),
        }
    }

    fn on_handshake(&mut self, address: &DaemonAddress, info: DaemonInfo) {
        let Some(daemon) = self.daemons.get(address) else {
            return;
        };
        if daemon.state() != DaemonState::Run {
            warn!(address = %address, state = %daemon.state(), "Unexpected handshake reply");
            return;
        }

        if let Some((kind, message)) = self.admission_error(address, &info) {
            self.fail_daemon(address, kind, message);
            return;
        }

        match daemon.known_id.clone() {
            Some(known) if known != info.daemon_id => {
                let message = format!(
                    "Daemon identity changed from '{}' to '{}'",
                    known, info.daemon_id
                );
                self.fail_daemon(address, DaemonErrorKind::Ssh, message);
            }
            Some(_) => {
                if let Some(daemon) = self.daemons.get_mut(address) {
                    daemon.set_info(info);
                }
                self.login(address);
            }
            None => {
                let daemon_id = info.daemon_id.clone();
                let hostname = info.hostname.clone();
                if let Some(daemon) = self.daemons.get_mut(address) {
                    daemon.set_info(info);
                    if let Err(e) = daemon.set_state(DaemonState::AwaitingAnswer) {
                        warn!(address = %address, error = %e, "Cannot suspend connect");
                        return;
                    }
                }
                info!(address = %address, daemon_id = %daemon_id, "Asking to trust a new daemon");
                self.prompts
                    .insert(address.clone(), Prompt::Identity { daemon_id: daemon_id.clone() });
                self.broadcast_status(address);
                let text = format!(
                    "The daemon on {hostname} ({address}) identifies itself as '{daemon_id}'. Trust it?"
                );
                self.send_prompt(address, client::question(address, "Unknown daemon", &text));
            }
        }
    }

    fn on_handshake_refused(&mut self, address: &DaemonAddress, kind: &str, detail: &str) {
        match kind {
            "password" => {
                let Some(daemon) = self.daemons.get_mut(address) else {
                    return;
                };
                if let Err(e) = daemon.set_state(DaemonState::AwaitingAnswer) {
                    warn!(address = %address, error = %e, "Unexpected password request");
                    return;
                }
                info!(address = %address, "Daemon asks for a password");
                self.prompts.insert(address.clone(), Prompt::Password);
                self.broadcast_status(address);
                self.send_prompt(address, client::password(address));
            }
            "protocol" => self.fail_daemon(
                address,
                DaemonErrorKind::Protocol,
                format!("Protocol version mismatch: maestro {PROTOCOL_VERSION}, daemon {detail}"),
            ),
            _ => self.fail_daemon(address, DaemonErrorKind::ConnectionRefused, detail),
        }
    }

    /// Why a daemon reporting `info` may not join: another NFS domain, or a
    /// daemon id already held by another address.
    fn admission_error(
        &self,
        address: &DaemonAddress,
        info: &DaemonInfo,
    ) -> Option<(DaemonErrorKind, String)> {
        if let Some(pinned) = &self.pinned_nfsid {
            if *pinned != info.nfsid {
                let message = format!(
                    "NFS id '{}' differs from the active NFS id '{}'",
                    info.nfsid, pinned
                );
                return Some((DaemonErrorKind::Nfs, message));
            }
        }

        if info.daemon_id.is_empty() {
            return None;
        }
        self.daemons
            .values()
            .find(|other| {
                other.address != *address
                    && (other.known_id.as_deref() == Some(info.daemon_id.as_str())
                        || (other.state() != DaemonState::Disconnected
                            && other.info().is_some_and(|i| i.daemon_id == info.daemon_id)))
            })
            .map(|other| {
                let message = format!(
                    "Daemon id '{}' is already registered by {}",
                    info.daemon_id, other.address
                );
                (DaemonErrorKind::Id, message)
            })
    }

    /// Re-check admission against the current state, failing the daemon when
    /// it no longer fits. A prompt may have been answered after another
    /// daemon pinned the NFS id or claimed the same daemon id.
    fn still_admissible(&mut self, address: &DaemonAddress) -> bool {
        let Some(info) = self.daemons.get(address).and_then(|d| d.info().cloned()) else {
            return true;
        };
        match self.admission_error(address, &info) {
            Some((kind, message)) => {
                self.fail_daemon(address, kind, message);
                false
            }
            None => true,
        }
    }

    /// Complete the handshake.
    fn login(&mut self, address: &DaemonAddress) {
        if !self.still_admissible(address) {
            return;
        }
        let Some(daemon) = self.daemons.get_mut(address) else {
            return;
        };
        if let Err(e) = daemon.set_state(DaemonState::Logged) {
            warn!(address = %address, error = %e, "Cannot log daemon in");
            return;
        }
        daemon.canceled = false;
        let nfsid = daemon.info().map(|i| i.nfsid.clone()).unwrap_or_default();

        if self.pinned_nfsid.is_none() {
            info!(nfsid = %nfsid, "NFS id pinned");
            self.pinned_nfsid = Some(nfsid);
        }
        info!(address = %address, "Daemon logged in");

        self.persisted.insert(address.clone());
        self.persist();
        self.connect_origin.remove(address);
        self.broadcast_status(address);
        if let Some(daemon) = self.daemons.get(address) {
            self.broadcast(client::mpi(daemon));
        }
        self.connect_all_settled(address);
    }

    /// Drop the connection with an error.
    pub(super) fn fail_daemon(
        &mut self,
        address: &DaemonAddress,
        kind: DaemonErrorKind,
        message: impl Into<String>,
    ) {
        let message = message.into();
        if let Some(link) = self.links.remove(address) {
            link.close();
        }
        self.prompts.remove(address);
        self.connect_origin.remove(address);
        if let Some(daemon) = self.daemons.get_mut(address) {
            daemon.disconnect_with(kind, message.clone());
        }
        warn!(address = %address, kind = %kind, message = %message, "Daemon disconnected with error");
        self.broadcast_status(address);
        self.fail_undefined_on(address);
        self.connect_all_settled(address);
    }

    pub(super) fn on_daemon_closed(&mut self, address: &DaemonAddress, reason: Option<String>) {
        self.links.remove(address);
        self.prompts.remove(address);
        self.connect_origin.remove(address);
        let reconnect_delay = self.config.reconnect_delay();

        let Some(daemon) = self.daemons.get_mut(address) else {
            return;
        };
        let was = daemon.state();
        if was == DaemonState::Disconnected {
            return;
        }
        let reason = reason.unwrap_or_else(|| "Connection closed".to_string());
        daemon.disconnect_with(DaemonErrorKind::ConnectionRefused, reason);
        let retry = was == DaemonState::Logged
            && daemon.autoconnect
            && daemon.error().is_some_and(|e| !e.kind.is_terminal());

        info!(address = %address, was = %was, retry, "Daemon transport closed");
        self.broadcast_status(address);
        self.fail_undefined_on(address);
        if retry {
            self.schedule(
                reconnect_delay,
                Event::Reconnect {
                    address: address.clone(),
                },
            );
        }
        self.connect_all_settled(address);
    }

    pub(super) fn on_reconnect_timer(&mut self, address: &DaemonAddress) {
        let eligible = self.daemons.get(address).is_some_and(|d| {
            d.autoconnect
                && d.state() == DaemonState::Disconnected
                && !d.error().is_some_and(|e| e.kind.is_terminal())
        });
        if eligible {
            info!(address = %address, "Reconnecting daemon");
            if let Err(e) = self.connect_daemon(address, None) {
                warn!(address = %address, error = %e, "Reconnect failed");
            }
        }
    }

    /// Answer the identity question of a daemon.
    pub(crate) fn answer_identity(
        &mut self,
        address: &DaemonAddress,
        accept: bool,
    ) -> Result<(), RequestError> {
        let daemon_id = match self.prompts.get(address) {
            Some(Prompt::Identity { daemon_id }) => daemon_id.clone(),
            _ => {
                let state = self.daemon(address)?.state();
                return Err(CoreError::InvalidStateTransition {
                    from: state.to_string(),
                    to: "identity answer".to_string(),
                }
                .into());
            }
        };
        self.prompts.remove(address);

        if !accept {
            self.fail_daemon(address, DaemonErrorKind::Ssh, "Daemon identity refused");
            return Ok(());
        }
        if !self.still_admissible(address) {
            return Ok(());
        }
        self.daemon_mut(address)?.known_id = Some(daemon_id);
        self.login(address);
        Ok(())
    }

    /// Record the password of a daemon and resume its connect if it asked.
    pub(crate) fn answer_password(
        &mut self,
        address: &DaemonAddress,
        password: &str,
    ) -> Result<(), RequestError> {
        self.daemon(address)?;
        self.passwords.insert(address.clone(), password.to_string());
        if self.prompts.get(address) != Some(&Prompt::Password) {
            return Ok(());
        }
        self.prompts.remove(address);
        self.daemon_mut(address)?.set_state(DaemonState::Run)?;
        self.broadcast_status(address);
        let ini = daemon::ini(PROTOCOL_VERSION, &self.config.hostname, Some(password));
        if !self.send_daemon(address, ini) {
            self.fail_daemon(address, DaemonErrorKind::ConnectionRefused, "Link lost");
        }
        Ok(())
    }

    /// Connect, one at a time, every autoconnect daemon that is down.
    pub(crate) fn connect_all(&mut self, origin: Option<ClientId>) {
        let candidates: Vec<DaemonAddress> = self
            .daemons
            .values()
            .filter(|d| d.autoconnect && d.state() == DaemonState::Disconnected)
            .map(|d| d.address.clone())
            .collect();
        if let Some(id) = origin {
            for address in &candidates {
                self.connect_origin.insert(address.clone(), id.clone());
            }
        }
        info!(candidates = candidates.len(), "Connecting all daemons");

        let sweep = self.connect_all.get_or_insert_with(ConnectAll::default);
        for address in candidates {
            if sweep.current.as_ref() != Some(&address) && !sweep.pending.contains(&address) {
                sweep.pending.push_back(address);
            }
        }
        if sweep.current.is_none() {
            self.advance_connect_all();
        }
    }

    fn advance_connect_all(&mut self) {
        let timeout = self.config.connect_timeout();
        loop {
            let Some(sweep) = self.connect_all.as_mut() else {
                return;
            };
            let Some(address) = sweep.pending.pop_front() else {
                debug!("Connect-all finished");
                self.connect_all = None;
                return;
            };
            let still_down = self
                .daemons
                .get(&address)
                .is_some_and(|d| d.autoconnect && d.state() == DaemonState::Disconnected);
            if !still_down {
                continue;
            }

            let origin = self.connect_origin.get(&address).cloned();
            if let Err(e) = self.connect_daemon(&address, origin) {
                warn!(address = %address, error = %e, "Connect-all skipped daemon");
                continue;
            }
            if let Some(sweep) = self.connect_all.as_mut() {
                sweep.current = Some(address.clone());
            }
            self.schedule(
                timeout,
                Event::ConnectTimeout {
                    address,
                    generation: self.next_generation,
                },
            );
            return;
        }
    }

    /// The current connect-all candidate reached LOGGED or DISCONNECTED.
    fn connect_all_settled(&mut self, address: &DaemonAddress) {
        let is_current = self
            .connect_all
            .as_ref()
            .is_some_and(|s| s.current.as_ref() == Some(address));
        if is_current {
            if let Some(sweep) = self.connect_all.as_mut() {
                sweep.current = None;
            }
            self.advance_connect_all();
        }
    }

    pub(super) fn on_connect_timeout(&mut self, address: &DaemonAddress, generation: u64) {
        let is_current = self
            .connect_all
            .as_ref()
            .is_some_and(|s| s.current.as_ref() == Some(address));
        let same_attempt =
            self.links.get(address).map(|l| l.generation()) == Some(generation);
        let stalled = self
            .daemons
            .get(address)
            .is_some_and(|d| d.state().is_connecting());
        if !(is_current && same_attempt && stalled) {
            return;
        }

        warn!(address = %address, "Connect attempt timed out, moving on");
        if let Some(link) = self.links.remove(address) {
            link.close();
        }
        self.prompts.remove(address);
        if let Some(daemon) = self.daemons.get_mut(address) {
            daemon.disconnect_with(DaemonErrorKind::ConnectionRefused, "Connection attempt timed out");
            daemon.canceled = true;
        }
        self.broadcast_status(address);
        self.connect_all_settled(address);
    }

    /// Drop and restart the connection of a daemon.
    pub(crate) fn reconnect(
        &mut self,
        address: &DaemonAddress,
        origin: ClientId,
    ) -> Result<(), RequestError> {
        let daemon = self.daemon_mut(address)?;
        if daemon.state() != DaemonState::Disconnected {
            daemon.set_state(DaemonState::Disconnected)?;
            if let Some(link) = self.links.remove(address) {
                link.close();
            }
            self.prompts.remove(address);
            self.broadcast_status(address);
        }
        self.connect_daemon(address, Some(origin))?;
        Ok(())
    }

    /// Disconnect, stop or remove a daemon. With uncompleted tasks and no
    /// confirmation, only asks the requester to confirm.
    pub(crate) fn teardown_daemon(
        &mut self,
        address: &DaemonAddress,
        action: Teardown,
        confirmed: bool,
        requester: &ClientId,
    ) -> Result<HttpResponse, RequestError> {
        let uncompleted = self.daemon(address)?.uncompleted_tasks();
        if uncompleted > 0 && !confirmed {
            info!(
                address = %address,
                action = action.as_str(),
                uncompleted,
                "Asking confirmation before teardown"
            );
            self.send_client(requester, client::confirm(address, action.as_str(), uncompleted));
            return Ok(HttpResponse::new(202, "confirmation required"));
        }

        self.daemon_mut(address)?.disconnecting = true;
        self.kill_daemon_tasks(address);
        self.fail_undefined_on(address);
        if action == Teardown::Stop {
            self.send_daemon(address, daemon::quit());
        }

        if let Some(link) = self.links.remove(address) {
            link.close();
        }
        self.prompts.remove(address);
        self.connect_origin.remove(address);
        let daemon = self.daemon_mut(address)?;
        daemon.disconnecting = false;
        match action {
            Teardown::Stop => daemon.disconnect_with(DaemonErrorKind::Stop, "Stopped on request"),
            Teardown::Disconnect | Teardown::Remove => {
                daemon.set_state(DaemonState::Disconnected)?;
                daemon.clear_error();
            }
        }
        info!(address = %address, action = action.as_str(), "Daemon torn down");
        self.broadcast_status(address);
        self.connect_all_settled(address);

        if action == Teardown::Remove {
            self.daemons.remove(address);
            self.passwords.remove(address);
            if self.persisted.remove(address) {
                self.persist();
            }
            self.broadcast(client::server_removed(address));
        }
        Ok(HttpResponse::ok())
    }

    /// Kill every live task of a daemon and settle them as CANCELED.
    fn kill_daemon_tasks(&mut self, address: &DaemonAddress) {
        let mut keys: Vec<TaskKey> = self
            .tasks
            .iter()
            .filter(|(key, owner)| {
                *owner == address
                    && self
                        .jobs
                        .get(&key.job)
                        .and_then(|j| j.task(key.fraction))
                        .is_some_and(|t| !t.is_terminal())
            })
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();

        for key in &keys {
            self.send_daemon(address, daemon::kill(&key.job, key.fraction));
        }

        let now = chrono::Utc::now().to_rfc3339();
        let mut settled = Vec::new();
        for key in &keys {
            match self.update_task(key, JobStatus::Canceled, &now) {
                Ok(events) => settled.push((key.job.clone(), events)),
                Err(e) => warn!(task = %key, error = %e, "Cannot cancel task"),
            }
        }
        for (job_id, events) in settled {
            self.apply_job_events(&job_id, events);
        }
    }

    /// Change the tags of a daemon.
    pub(crate) fn change_tags(
        &mut self,
        address: &DaemonAddress,
        change: TagChange,
        tags: &str,
    ) -> Result<(), RequestError> {
        let daemon = self.daemon_mut(address)?;
        let changed = match change {
            TagChange::Replace => daemon.replace_tags(split_tags(tags)),
            TagChange::Insert => daemon.merge_tags(split_tags(tags)),
            TagChange::Remove => split_tags(tags).fold(false, |acc, t| daemon.remove_tag(t) || acc),
        };
        if changed {
            let msg = client::server_tags(daemon);
            debug!(address = %address, tags = %daemon.tags_string(), "Daemon tags changed");
            self.broadcast(msg);
            self.persist();
        }
        Ok(())
    }

    /// Turn autoconnect on or off.
    pub(crate) fn set_autoconnect(
        &mut self,
        address: &DaemonAddress,
        autoconnect: bool,
    ) -> Result<(), RequestError> {
        let daemon = self.daemon_mut(address)?;
        if daemon.autoconnect != autoconnect {
            daemon.autoconnect = autoconnect;
            let msg = client::autoconnect(daemon);
            self.broadcast(msg);
            self.persist();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{addr, node, with_code, Harness};
    use super::*;
    use crate::event::DaemonEvent;
    use crate::store::DaemonEntry;
    use maestro_proto::code;

    fn known(daemon_id: &str, autoconnect: bool) -> DaemonEntry {
        DaemonEntry {
            tags: Vec::new(),
            autoconnect,
            daemon_id: Some(daemon_id.to_string()),
        }
    }

    #[tokio::test]
    async fn test_adding_daemon_twice_merges_tags() {
        let mut h = Harness::new();
        let mut gui = h.client();
        let a = h.connect(&gui, "node1", "a,b");

        let resp = h.request(&gui, "/server?address=node1:2127;tags=b,c");
        assert_eq!(resp.status, 200);
        assert_eq!(h.coord.daemons.len(), 1);
        assert_eq!(h.daemon(&a).tags_string(), "a,b,c");
        assert_eq!(h.opens(&a), 1);

        let msgs = gui.messages();
        let tags = with_code(&msgs, code::SERVER_TAGS);
        assert_eq!(tags.last().unwrap().args[1], "a,b,c");
    }

    #[tokio::test]
    async fn test_first_handshake_asks_to_trust_identity() {
        let mut h = Harness::new();
        let mut gui = h.client();
        let a = h.connect(&gui, "node1", "");

        let ini = h.sent(&a);
        assert_eq!(ini.len(), 1);
        assert_eq!(ini[0].code, code::INI);
        assert_eq!(ini[0].args, vec![PROTOCOL_VERSION, "maestro-test"]);

        h.daemon_says(&a, DaemonMessage::Ret(node("node1", "nfs-a", "id-1", 8)));
        assert_eq!(h.daemon(&a).state(), DaemonState::AwaitingAnswer);
        let msgs = gui.messages();
        let questions = with_code(&msgs, code::QUESTION);
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].args[0], "node1:2127");

        let resp = h.request(&gui, "/ssh-answer?address=node1;response=yes");
        assert_eq!(resp.status, 200);
        assert!(h.daemon(&a).is_logged());
        assert_eq!(h.stored()[&a].daemon_id.as_deref(), Some("id-1"));

        let msgs = gui.messages();
        assert_eq!(with_code(&msgs, code::MPI).len(), 1);
        let status = with_code(&msgs, code::SERVER_STATUS);
        assert_eq!(status.last().unwrap().args[2], "logged");
    }

    #[tokio::test]
    async fn test_refused_identity_disconnects() {
        let mut h = Harness::new();
        let gui = h.client();
        let a = h.connect(&gui, "node1", "");
        h.daemon_says(&a, DaemonMessage::Ret(node("node1", "nfs-a", "id-1", 8)));

        let resp = h.request(&gui, "/ssh-answer?address=node1;response=no");
        assert_eq!(resp.status, 200);
        let daemon = h.daemon(&a);
        assert_eq!(daemon.state(), DaemonState::Disconnected);
        assert_eq!(daemon.error().unwrap().kind, DaemonErrorKind::Ssh);
        assert!(h.link_closed(&a));
        assert!(h.stored().is_empty());
    }

    #[tokio::test]
    async fn test_answer_without_question_is_a_conflict() {
        let mut h = Harness::new();
        let gui = h.client();
        h.connect(&gui, "node1", "");

        let resp = h.request(&gui, "/ssh-answer?address=node1;response=yes");
        assert_eq!(resp.status, 409);
        let resp = h.request(&gui, "/ssh-answer?address=ghost;response=yes");
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn test_known_daemon_logs_in_without_prompt() {
        let mut h = Harness::with_store(&[("node1", known("id-1", true))]);
        let mut gui = h.client();
        let a = h.connect(&gui, "node1", "");
        h.daemon_says(&a, DaemonMessage::Ret(node("node1", "nfs-a", "id-1", 8)));

        assert!(h.daemon(&a).is_logged());
        assert!(gui.codes().iter().all(|c| c != code::QUESTION));
    }

    #[tokio::test]
    async fn test_changed_identity_is_refused() {
        let mut h = Harness::with_store(&[("node1", known("id-1", true))]);
        let gui = h.client();
        let a = h.connect(&gui, "node1", "");
        h.daemon_says(&a, DaemonMessage::Ret(node("node1", "nfs-a", "id-2", 8)));

        let daemon = h.daemon(&a);
        assert_eq!(daemon.state(), DaemonState::Disconnected);
        assert_eq!(daemon.error().unwrap().kind, DaemonErrorKind::Ssh);
        assert!(h.link_closed(&a));
        assert_eq!(h.stored()[&a].daemon_id.as_deref(), Some("id-1"));
    }

    #[tokio::test]
    async fn test_daemon_from_other_nfs_domain_is_rejected() {
        let mut h = Harness::new();
        let gui = h.client();
        h.login(&gui, "node1", "", node("node1", "nfs-a", "id-1", 8));

        let b = h.connect(&gui, "node2", "");
        h.daemon_says(&b, DaemonMessage::Ret(node("node2", "nfs-b", "id-2", 8)));

        let daemon = h.daemon(&b);
        assert_eq!(daemon.state(), DaemonState::Disconnected);
        assert_eq!(daemon.error().unwrap().kind, DaemonErrorKind::Nfs);
        assert!(h.link_closed(&b));
        assert_eq!(h.coord.pinned_nfsid.as_deref(), Some("nfs-a"));
    }

    #[tokio::test]
    async fn test_duplicate_daemon_id_is_rejected() {
        let mut h = Harness::new();
        let gui = h.client();
        h.login(&gui, "node1", "", node("node1", "nfs-a", "id-1", 8));

        let b = h.connect(&gui, "node1-alias", "");
        h.daemon_says(&b, DaemonMessage::Ret(node("node1", "nfs-a", "id-1", 8)));

        assert_eq!(h.daemon(&b).error().unwrap().kind, DaemonErrorKind::Id);
        assert_eq!(h.daemon(&b).state(), DaemonState::Disconnected);
    }

    #[tokio::test]
    async fn test_pending_identities_from_two_nfs_domains() {
        let mut h = Harness::new();
        let gui = h.client();
        let a = h.connect(&gui, "node1", "");
        let b = h.connect(&gui, "node2", "");
        h.daemon_says(&a, DaemonMessage::Ret(node("node1", "nfs-a", "id-1", 8)));
        h.daemon_says(&b, DaemonMessage::Ret(node("node2", "nfs-b", "id-2", 8)));
        assert_eq!(h.daemon(&a).state(), DaemonState::AwaitingAnswer);
        assert_eq!(h.daemon(&b).state(), DaemonState::AwaitingAnswer);

        let resp = h.request(&gui, &format!("/ssh-answer?address={a};response=yes"));
        assert_eq!(resp.status, 200);
        let resp = h.request(&gui, &format!("/ssh-answer?address={b};response=yes"));
        assert_eq!(resp.status, 200);

        assert_eq!(h.daemon(&a).state(), DaemonState::Logged);
        assert_eq!(h.coord.pinned_nfsid.as_deref(), Some("nfs-a"));
        let daemon = h.daemon(&b);
        assert_eq!(daemon.state(), DaemonState::Disconnected);
        assert_eq!(daemon.error().unwrap().kind, DaemonErrorKind::Nfs);
        assert!(daemon.known_id.is_none());
        assert!(h.link_closed(&b));
        assert!(!h.stored().contains_key(&b));
    }

    #[tokio::test]
    async fn test_id_of_a_pending_daemon_cannot_be_claimed() {
        let mut h = Harness::new();
        let gui = h.client();
        let a = h.connect(&gui, "node1", "");
        let b = h.connect(&gui, "node1-alias", "");
        h.daemon_says(&a, DaemonMessage::Ret(node("node1", "nfs-a", "id-1", 8)));
        h.daemon_says(&b, DaemonMessage::Ret(node("node1", "nfs-a", "id-1", 8)));
        assert_eq!(h.daemon(&b).error().unwrap().kind, DaemonErrorKind::Id);

        let resp = h.request(&gui, &format!("/ssh-answer?address={b};response=yes"));
        assert_eq!(resp.status, 409);
        h.request(&gui, &format!("/ssh-answer?address={a};response=yes"));

        assert_eq!(h.daemon(&a).state(), DaemonState::Logged);
        assert_eq!(h.daemon(&b).state(), DaemonState::Disconnected);
        assert_eq!(h.daemon(&b).error().unwrap().kind, DaemonErrorKind::Id);
    }

    #[tokio::test]
    async fn test_password_prompt_resends_handshake() {
        let mut h = Harness::new();
        let mut gui = h.client();
        let a = h.connect(&gui, "node1", "");
        h.sent(&a);

        h.daemon_says(
            &a,
            DaemonMessage::Err {
                kind: "password".to_string(),
                detail: String::new(),
            },
        );
        assert_eq!(h.daemon(&a).state(), DaemonState::AwaitingAnswer);
        let msgs = gui.messages();
        assert_eq!(with_code(&msgs, code::PASSWORD).len(), 1);

        let resp = h.request(&gui, "/set-password?address=node1;pass=s3cret");
        assert_eq!(resp.status, 200);
        assert_eq!(h.daemon(&a).state(), DaemonState::Run);
        let sent = h.sent(&a);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].args, vec![PROTOCOL_VERSION, "maestro-test", "s3cret"]);
    }

    #[tokio::test]
    async fn test_protocol_mismatch_is_terminal() {
        let mut h = Harness::new();
        let gui = h.client();
        let a = h.connect(&gui, "node1", "");
        h.daemon_says(
            &a,
            DaemonMessage::Err {
                kind: "protocol".to_string(),
                detail: "0.9".to_string(),
            },
        );

        let error = h.daemon(&a).error().unwrap();
        assert_eq!(error.kind, DaemonErrorKind::Protocol);
        assert!(error.message.contains("0.9"));
        assert_eq!(h.daemon(&a).state(), DaemonState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_all_goes_one_at_a_time_with_watchdog() {
        let mut h = Harness::with_store(&[
            ("node1", known("id-1", true)),
            ("node2", known("id-2", true)),
            ("node3", known("id-3", false)),
        ]);
        let (n1, n2, n3) = (addr("node1"), addr("node2"), addr("node3"));
        let gui = h.client();

        let resp = h.request(&gui, "/connect-daemons");
        assert_eq!(resp.status, 200);
        assert_eq!(h.opens(&n1), 1);
        assert_eq!(h.opens(&n2), 0);

        let stalled = h.generation(&n1);
        h.coord.handle(Event::ConnectTimeout {
            address: n1.clone(),
            generation: stalled,
        });
        let daemon = h.daemon(&n1);
        assert_eq!(daemon.state(), DaemonState::Disconnected);
        assert!(daemon.canceled);
        assert_eq!(daemon.error().unwrap().kind, DaemonErrorKind::ConnectionRefused);
        assert!(h.link_closed(&n1));
        assert_eq!(h.opens(&n2), 1);

        // A second firing of the same watchdog changes nothing.
        h.coord.handle(Event::ConnectTimeout {
            address: n1.clone(),
            generation: stalled,
        });
        assert_eq!(h.daemon(&n2).state(), DaemonState::Run);

        h.daemon_event(&n2, DaemonEvent::Connected);
        h.daemon_says(&n2, DaemonMessage::Ret(node("node2", "nfs-a", "id-2", 8)));
        assert!(h.daemon(&n2).is_logged());
        assert!(h.coord.connect_all.is_none());
        assert_eq!(h.opens(&n3), 0);
    }

    #[tokio::test]
    async fn test_disconnect_with_running_tasks_requires_confirmation() {
        let mut h = Harness::new();
        let mut gui = h.client();
        let a = h.login(&gui, "node1", "", node("node1", "nfs-a", "id-1", 8));
        let j1 = h.submit(&gui, "title=first");
        let j2 = h.submit(&gui, "title=second");
        for job in [&j1, &j2] {
            h.task_defined(&a, job, 1);
            h.task_status(&a, job, 1, JobStatus::Running);
        }
        h.sent(&a);
        gui.messages();
        assert_eq!(h.daemon(&a).uncompleted_tasks(), 2);

        let resp = h.request(&gui, "/disconnect?address=node1");
        assert_eq!(resp.status, 202);
        let msgs = gui.messages();
        let confirm = with_code(&msgs, code::CONFIRM);
        assert_eq!(confirm.len(), 1);
        assert_eq!(confirm[0].args, vec!["node1:2127", "disconnect", "2"]);
        assert!(h.daemon(&a).is_logged());
        assert!(h.sent(&a).is_empty());

        let resp = h.request(&gui, "/disconnect?address=node1;confirm=yes");
        assert_eq!(resp.status, 200);
        let sent = h.sent(&a);
        assert_eq!(with_code(&sent, code::KIL).len(), 2);
        assert!(h.link_closed(&a));

        let daemon = h.daemon(&a);
        assert_eq!(daemon.state(), DaemonState::Disconnected);
        assert!(daemon.error().is_none());
        assert_eq!(daemon.uncompleted_tasks(), 0);
        assert_eq!(h.job(&j1).status(), JobStatus::Canceled);
        assert_eq!(h.job(&j2).status(), JobStatus::Canceled);
    }

    #[tokio::test]
    async fn test_stop_sends_quit_and_is_not_retried() {
        let mut h = Harness::new();
        let gui = h.client();
        let a = h.login(&gui, "node1", "", node("node1", "nfs-a", "id-1", 8));

        let resp = h.request(&gui, "/stop?address=node1");
        assert_eq!(resp.status, 200);
        let sent = h.sent(&a);
        assert_eq!(sent.last().unwrap().code, code::QUT);
        assert!(h.link_closed(&a));
        assert_eq!(h.daemon(&a).error().unwrap().kind, DaemonErrorKind::Stop);

        h.coord.handle(Event::Reconnect { address: a.clone() });
        assert_eq!(h.opens(&a), 1);
    }

    #[tokio::test]
    async fn test_remove_forgets_daemon() {
        let mut h = Harness::new();
        let mut gui = h.client();
        let a = h.login(&gui, "node1", "", node("node1", "nfs-a", "id-1", 8));
        assert!(h.stored().contains_key(&a));
        gui.messages();

        let resp = h.request(&gui, "/remove?address=node1");
        assert_eq!(resp.status, 200);
        assert!(!h.coord.daemons.contains_key(&a));
        assert!(h.stored().is_empty());
        let msgs = gui.messages();
        let removed = with_code(&msgs, code::SERVER_REMOVED);
        assert_eq!(removed[0].args, vec!["node1:2127"]);
    }

    #[tokio::test]
    async fn test_tags_and_autoconnect_are_persisted() {
        let mut h = Harness::new();
        let mut gui = h.client();
        let a = h.login(&gui, "node1", "batch", node("node1", "nfs-a", "id-1", 8));

        assert_eq!(h.request(&gui, "/tag-insert?server=node1;tag=gpu").status, 200);
        assert_eq!(h.stored()[&a].tags, vec!["batch", "gpu"]);

        assert_eq!(h.request(&gui, "/tag-remove?server=node1;tag=batch").status, 200);
        assert_eq!(h.stored()[&a].tags, vec!["gpu"]);

        assert_eq!(h.request(&gui, "/server-tags?server=node1;tags=x,y").status, 200);
        assert_eq!(h.stored()[&a].tags, vec!["x", "y"]);

        gui.messages();
        assert_eq!(h.request(&gui, "/autoconnect?server=node1;ac=off").status, 200);
        assert!(!h.stored()[&a].autoconnect);
        let msgs = gui.messages();
        assert_eq!(with_code(&msgs, code::AUTOCONNECT)[0].args, vec!["node1:2127", "off"]);

        assert_eq!(h.request(&gui, "/autoconnect?server=node1;ac=maybe").status, 400);
    }

    #[tokio::test]
    async fn test_transport_drop_reconnects_logged_daemon() {
        let mut h = Harness::with_config(|c| c.reconnect_delay_secs = 0);
        let gui = h.client();
        let a = h.login(&gui, "node1", "", node("node1", "nfs-a", "id-1", 8));
        let first = h.generation(&a);

        h.daemon_event(&a, DaemonEvent::Closed(Some("Connection reset by peer".to_string())));
        let error = h.daemon(&a).error().unwrap();
        assert_eq!(error.kind, DaemonErrorKind::ConnectionRefused);
        assert_eq!(error.message, "Connection reset by peer");

        let event = h.events.recv().await.unwrap();
        assert!(matches!(&event, Event::Reconnect { address } if *address == a));
        h.coord.handle(event);
        assert_eq!(h.opens(&a), 2);
        assert_eq!(h.daemon(&a).state(), DaemonState::Run);

        // Late events of the dropped link are ignored.
        h.coord.handle(Event::Daemon {
            address: a.clone(),
            generation: first,
            event: DaemonEvent::Closed(None),
        });
        assert_eq!(h.daemon(&a).state(), DaemonState::Run);
    }
}

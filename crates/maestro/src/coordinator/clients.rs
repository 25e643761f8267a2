//! Client sessions: handshake, state replay and request routing.

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use maestro_core::{split_tags, Client, ClientId, Job, JobStatus};
use maestro_proto::client::{self, ClientIni};
use maestro_proto::{code, Frame, HttpRequest, HttpResponse, Message, PROTOCOL_VERSION};

use super::daemons::{TagChange, Teardown};
use super::{job_order, ClientLink, Coordinator};
use crate::error::RequestError;

impl Coordinator {
    pub(super) fn on_client_connected(&mut self, id: ClientId, tx: mpsc::UnboundedSender<Frame>) {
        debug!(client_id = %id, "Client connected");
        self.clients.insert(
            id.clone(),
            ClientLink {
                client: Client::new(id),
                tx,
            },
        );
    }

    pub(super) fn on_client_closed(&mut self, id: &ClientId) {
        if self.clients.remove(id).is_some() {
            info!(client_id = %id, "Client disconnected");
        }
        self.connect_origin.retain(|_, origin| origin != id);
    }

    pub(super) fn on_client_frame(&mut self, id: &ClientId, frame: Frame) {
        match frame {
            Frame::Message(msg) if msg.code == code::CLIENT_INI => self.on_client_ini(id, &msg),
            Frame::Message(msg) => {
                warn!(client_id = %id, code = %msg.code, "Unexpected message from client")
            }
            Frame::Request(req) => {
                let response = self.respond(id, req);
                self.send_client(id, response);
            }
            Frame::Response(resp) => {
                debug!(client_id = %id, status = resp.status, "Ignoring response from client")
            }
        }
    }

    fn on_client_ini(&mut self, id: &ClientId, msg: &Message) {
        let ini = match ClientIni::try_from(msg) {
            Ok(ini) => ini,
            Err(e) => {
                warn!(client_id = %id, error = %e, "Malformed client handshake");
                self.send_client(id, client::err("protocol", &e.to_string()));
                self.clients.remove(id);
                return;
            }
        };
        if ini.version != PROTOCOL_VERSION {
            warn!(
                client_id = %id,
                version = %ini.version,
                expected = PROTOCOL_VERSION,
                "Client protocol mismatch"
            );
            self.send_client(id, client::err("protocol", PROTOCOL_VERSION));
            self.clients.remove(id);
            return;
        }

        let Some(link) = self.clients.get_mut(id) else {
            return;
        };
        link.client
            .identify(ini.session_id.clone(), ini.cookie.clone(), &ini.display);
        info!(
            client_id = %id,
            session = %ini.session_id,
            display = %link.client.display(),
            "Client identified"
        );

        self.send_client(id, client::ret(ini.clock_diff(Utc::now())));
        for msg in self.replay() {
            self.send_client(id, msg);
        }
    }

    /// Everything a new client needs to rebuild the current state.
    fn replay(&self) -> Vec<Message> {
        let mut out = Vec::new();
        for daemon in self.daemons.values() {
            out.push(client::server_status(daemon));
            out.push(client::server_tags(daemon));
            out.push(client::autoconnect(daemon));
            if daemon.is_logged() {
                out.push(client::mpi(daemon));
            }
        }

        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| job_order(&j.id));
        for job in jobs {
            let status = job.partial_status().unwrap_or(job.status());
            // RUNNING is not announced while the definition waits its turn.
            let status = if status == JobStatus::Running && self.job_def_queue.contains(&job.id) {
                JobStatus::Initial
            } else {
                status
            };
            out.push(client::job_def_with_status(job, status));
            for task in job.tasks() {
                let cmd = job.command_line(task.fraction).unwrap_or_default();
                out.push(client::job_cmd(&job.id, task.fraction, &cmd));
                if !task.output.is_empty() {
                    out.push(client::job_output(&job.id, task.fraction, &task.output));
                }
            }
            if !job.issues().is_empty() {
                out.push(client::job_issues(&job.id, job.issues()));
            }
        }
        out
    }

    /// Answer one client request, turning failures into error responses.
    pub(crate) fn respond(&mut self, client: &ClientId, req: HttpRequest) -> HttpResponse {
        let path = req.uri.path.clone();
        match self.handle_request(client, req) {
            Ok(response) => response,
            Err(e) => {
                warn!(client_id = %client, path = %path, error = %e, "Request failed");
                HttpResponse::new(e.status(), e.to_string())
            }
        }
    }

    /// Route one client request.
    fn handle_request(
        &mut self,
        client: &ClientId,
        req: HttpRequest,
    ) -> Result<HttpResponse, RequestError> {
        let identified = self
            .clients
            .get(client)
            .is_some_and(|c| c.client.is_identified());
        if !identified {
            return Err(RequestError::NotIdentified);
        }

        let uri = &req.uri;
        debug!(client_id = %client, method = %req.method, uri = %uri, "Client request");
        match uri.path.as_str() {
            "/server" => {
                let address = self.daemon_address(uri.require("address")?);
                self.add_daemon(&address, split_tags(uri.param_or_empty("tags")));
                if let Some(pass) = uri.param("pass").filter(|p| !p.is_empty()) {
                    self.answer_password(&address, pass)?;
                }
                self.connect_daemon(&address, Some(client.clone()))?;
            }
            "/set-password" => {
                let address = self.daemon_address(uri.require("address")?);
                self.answer_password(&address, uri.param_or_empty("pass"))?;
            }
            "/ssh-answer" => {
                let address = self.daemon_address(uri.require("address")?);
                self.answer_identity(&address, uri.flag("response"))?;
            }
            "/connect-daemons" => self.connect_all(Some(client.clone())),
            "/reconnect" => {
                let address = self.daemon_address(uri.require("address")?);
                self.reconnect(&address, client.clone())?;
            }
            "/disconnect" | "/stop" | "/remove" => {
                let action = match uri.path.as_str() {
                    "/stop" => Teardown::Stop,
                    "/remove" => Teardown::Remove,
                    _ => Teardown::Disconnect,
                };
                let address = self.daemon_address(uri.require("address")?);
                return self.teardown_daemon(&address, action, uri.flag("confirm"), client);
            }
            "/run" => {
                let id = self.submit(client, uri, req.body.clone())?;
                return Ok(HttpResponse::new(200, id.into_inner()));
            }
            "/kill" => {
                let id = self.resolve_job(client, uri.require("id")?)?;
                self.kill_job(&id)?;
            }
            "/unqueue" => {
                let id = self.resolve_job(client, uri.require("id")?)?;
                self.unqueue(&id)?;
            }
            "/close" => {
                let id = self.resolve_job(client, uri.require("id")?)?;
                self.close_job(&id)?;
            }
            "/server-tags" => {
                let address = self.daemon_address(uri.require("server")?);
                self.change_tags(&address, TagChange::Replace, uri.param_or_empty("tags"))?;
            }
            "/tag-insert" => {
                let address = self.daemon_address(uri.require("server")?);
                self.change_tags(&address, TagChange::Insert, uri.require("tag")?)?;
            }
            "/tag-remove" => {
                let address = self.daemon_address(uri.require("server")?);
                self.change_tags(&address, TagChange::Remove, uri.require("tag")?)?;
            }
            "/autoconnect" => {
                let address = self.daemon_address(uri.require("server")?);
                let on = match uri.param_or_empty("ac") {
                    "on" | "yes" | "true" | "1" => true,
                    "off" | "no" | "false" | "0" => false,
                    other => {
                        return Err(RequestError::BadRequest(format!(
                            "autoconnect must be on or off, got '{other}'"
                        )))
                    }
                };
                self.set_autoconnect(&address, on)?;
            }
            other => return Err(RequestError::UnknownPath(other.to_string())),
        }
        Ok(HttpResponse::ok())
    }
}

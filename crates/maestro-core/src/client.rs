//! Client sessions: one per connected GUI.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{ClientId, JobId};

/// A connected GUI session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    /// Identity of the protocol connection.
    pub id: ClientId,

    /// Session id the GUI announced in its handshake. Set once.
    pub session_id: Option<String>,

    /// X11 magic cookie forwarded to daemons.
    pub cookie: String,

    /// Host the GUI display lives on.
    pub display_host: String,

    /// Display port, when the GUI announced one.
    pub display_port: Option<u16>,

    temp_ids: HashMap<String, JobId>,
}

impl Client {
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            session_id: None,
            cookie: String::new(),
            display_host: String::new(),
            display_port: None,
            temp_ids: HashMap::new(),
        }
    }

    /// True once the handshake completed.
    pub fn is_identified(&self) -> bool {
        self.session_id.is_some()
    }

    /// Record the handshake. The session id can only be set once.
    pub fn identify(&mut self, session_id: impl Into<String>, cookie: impl Into<String>, display: &str) {
        if self.session_id.is_none() {
            self.session_id = Some(session_id.into());
        }
        self.cookie = cookie.into();
        let (host, port) = parse_display(display);
        self.display_host = host;
        self.display_port = port;
    }

    /// `host:port` of the display, if known.
    pub fn display(&self) -> String {
        match self.display_port {
            Some(port) => format!("{}:{}", self.display_host, port),
            None => self.display_host.clone(),
        }
    }

    /// Remember which server id a client-local temp id became.
    pub fn remember_temp_id(&mut self, temp_id: impl Into<String>, job: JobId) {
        let temp_id = temp_id.into();
        if !temp_id.is_empty() {
            self.temp_ids.insert(temp_id, job);
        }
    }

    /// Resolve an id sent by this client, which may be a temp id.
    pub fn resolve_job(&self, id: &str) -> Option<&JobId> {
        self.temp_ids.get(id)
    }
}

fn parse_display(display: &str) -> (String, Option<u16>) {
    match display.rsplit_once(':') {
        Some((host, port)) => match port.split('.').next().and_then(|p| p.parse().ok()) {
            Some(port) => (host.to_string(), Some(port)),
            None => (display.to_string(), None),
        },
        None => (display.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_sets_session_once() {
        let mut client = Client::new(ClientId::generate());
        assert!(!client.is_identified());
        client.identify("gui-1", "cookie", "desk:10.0");
        client.identify("gui-2", "cookie2", "desk:11");
        assert_eq!(client.session_id.as_deref(), Some("gui-1"));
        assert_eq!(client.cookie, "cookie2");
        assert_eq!(client.display(), "desk:11");
    }

    #[test]
    fn test_display_without_port() {
        let mut client = Client::new(ClientId::generate());
        client.identify("gui", "", "localhost");
        assert_eq!(client.display_port, None);
        assert_eq!(client.display(), "localhost");
    }

    #[test]
    fn test_temp_ids_resolve() {
        let mut client = Client::new(ClientId::generate());
        client.remember_temp_id("tmp-7", JobId::new("3"));
        client.remember_temp_id("", JobId::new("4"));
        assert_eq!(client.resolve_job("tmp-7"), Some(&JobId::new("3")));
        assert_eq!(client.resolve_job(""), None);
    }
}

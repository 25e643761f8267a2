//! Socket-free harness for coordinator tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

use maestro_core::{ClientId, Daemon, DaemonAddress, DaemonInfo, DaemonState, Job, JobId, JobStatus};
use maestro_proto::client::ClientIni;
use maestro_proto::{
    code, DaemonMessage, Frame, HttpRequest, HttpResponse, Message, RunCommand, Uri,
    PROTOCOL_VERSION,
};

use super::Coordinator;
use crate::config::Config;
use crate::connector::{Connector, DaemonLink};
use crate::event::{DaemonEvent, Event, EventSender};
use crate::store::{DaemonEntry, DaemonStore};

type Opened = (DaemonAddress, u64, UnboundedReceiver<Frame>);

/// Connector handing out in-memory links.
#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    opened: Arc<Mutex<Vec<Opened>>>,
}

impl Connector for FakeConnector {
    fn open(&self, address: &DaemonAddress, generation: u64, _events: EventSender) -> DaemonLink {
        let (tx, rx) = mpsc::unbounded_channel();
        self.opened
            .lock()
            .unwrap()
            .push((address.clone(), generation, rx));
        DaemonLink::new(generation, tx, CancellationToken::new())
    }
}

/// Daemon side of an in-memory link.
struct FakeLink {
    generation: u64,
    rx: UnboundedReceiver<Frame>,
    received: Vec<Message>,
    closed: bool,
}

impl FakeLink {
    fn pump(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(Frame::Message(msg)) => self.received.push(msg),
                Ok(_) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }
}

/// A client session seen from the client side.
pub(crate) struct TestClient {
    pub id: ClientId,
    rx: UnboundedReceiver<Frame>,
}

impl TestClient {
    /// Every message received since the last call.
    pub fn messages(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            if let Frame::Message(msg) = frame {
                out.push(msg);
            }
        }
        out
    }

    pub fn codes(&mut self) -> Vec<String> {
        self.messages().into_iter().map(|m| m.code).collect()
    }

    /// Whether the maestro dropped this session.
    pub fn is_dropped(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(_) => continue,
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
    }
}

pub(crate) fn node(host: &str, nfsid: &str, daemon_id: &str, ncores: u32) -> DaemonInfo {
    DaemonInfo {
        hostname: host.to_string(),
        server_type: "linux".to_string(),
        model_name: "Xeon".to_string(),
        memory: "64G".to_string(),
        nfsid: nfsid.to_string(),
        ncores,
        clock: 2000.0,
        daemon_id: daemon_id.to_string(),
        mpi_flavors: vec!["openmpi".to_string()],
    }
}

pub(crate) fn addr(raw: &str) -> DaemonAddress {
    DaemonAddress::with_default_port(raw, 2127)
}

/// Messages with `code` out of `msgs`.
pub(crate) fn with_code<'a>(msgs: &'a [Message], code: &str) -> Vec<&'a Message> {
    msgs.iter().filter(|m| m.code == code).collect()
}

pub(crate) struct Harness {
    pub coord: Coordinator,
    pub events: UnboundedReceiver<Event>,
    opened: Arc<Mutex<Vec<Opened>>>,
    links: HashMap<DaemonAddress, FakeLink>,
    opens: Vec<DaemonAddress>,
    dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config {
            store_path: dir.path().join("servers.toml"),
            autoconnect_on_start: false,
            hostname: "maestro-test".to_string(),
            ..Default::default()
        };
        tweak(&mut config);
        Self::build(config, dir)
    }

    /// A harness whose key-file already lists `entries`.
    pub fn with_store(entries: &[(&str, DaemonEntry)]) -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.toml");
        let addresses: Vec<DaemonAddress> = entries.iter().map(|(a, _)| addr(a)).collect();
        DaemonStore::new(&path)
            .save(
                addresses
                    .iter()
                    .zip(entries.iter().map(|(_, e)| e.clone())),
            )
            .unwrap();
        let config = Config {
            store_path: path,
            autoconnect_on_start: false,
            hostname: "maestro-test".to_string(),
            ..Default::default()
        };
        Self::build(config, dir)
    }

    fn build(config: Config, dir: TempDir) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let connector = FakeConnector::default();
        let opened = connector.opened.clone();
        let coord = Coordinator::new(config, Box::new(connector), tx).unwrap();
        Self {
            coord,
            events,
            opened,
            links: HashMap::new(),
            opens: Vec::new(),
            dir,
        }
    }

    pub fn stored(&self) -> BTreeMap<DaemonAddress, DaemonEntry> {
        DaemonStore::new(self.dir.path().join("servers.toml"))
            .load()
            .unwrap()
    }

    /// Open a client session and complete its handshake.
    pub fn client(&mut self) -> TestClient {
        let mut client = self.raw_client();
        self.client_ini(&client, PROTOCOL_VERSION);
        client.messages();
        client
    }

    /// Open a client session without handshake.
    pub fn raw_client(&mut self) -> TestClient {
        let id = ClientId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        self.coord.handle(Event::ClientConnected { id: id.clone(), tx });
        TestClient { id, rx }
    }

    pub fn client_ini(&mut self, client: &TestClient, version: &str) {
        let ini = ClientIni {
            display: "gui-host:0".to_string(),
            version: version.to_string(),
            cookie: "cookie".to_string(),
            session_id: format!("session-{}", client.id),
            clock: chrono::Utc::now().to_rfc3339(),
            has_maestro: true,
        };
        self.coord.handle(Event::ClientFrame {
            id: client.id.clone(),
            frame: Frame::Message(Message::from(&ini)),
        });
    }

    pub fn request(&mut self, client: &TestClient, uri: &str) -> HttpResponse {
        self.request_with_body(client, uri, "")
    }

    pub fn request_with_body(&mut self, client: &TestClient, uri: &str, body: &str) -> HttpResponse {
        let uri: Uri = uri.parse().unwrap();
        self.coord
            .respond(&client.id, HttpRequest::put(uri).with_body(body))
    }

    fn sync_links(&mut self) {
        for (address, generation, rx) in self.opened.lock().unwrap().drain(..) {
            self.opens.push(address.clone());
            self.links.insert(
                address,
                FakeLink {
                    generation,
                    rx,
                    received: Vec::new(),
                    closed: false,
                },
            );
        }
    }

    /// Number of connect attempts made towards `address`.
    pub fn opens(&mut self, address: &DaemonAddress) -> usize {
        self.sync_links();
        self.opens.iter().filter(|a| *a == address).count()
    }

    pub fn generation(&mut self, address: &DaemonAddress) -> u64 {
        self.sync_links();
        self.links[address].generation
    }

    /// Messages the maestro sent to `address` since the last call.
    pub fn sent(&mut self, address: &DaemonAddress) -> Vec<Message> {
        self.sync_links();
        match self.links.get_mut(address) {
            Some(link) => {
                link.pump();
                std::mem::take(&mut link.received)
            }
            None => Vec::new(),
        }
    }

    /// Whether the maestro closed its current link to `address`.
    pub fn link_closed(&mut self, address: &DaemonAddress) -> bool {
        self.sync_links();
        let link = self.links.get_mut(address).unwrap();
        link.pump();
        link.closed
    }

    pub fn daemon_event(&mut self, address: &DaemonAddress, event: DaemonEvent) {
        let generation = self.generation(address);
        self.coord.handle(Event::Daemon {
            address: address.clone(),
            generation,
            event,
        });
    }

    pub fn daemon_says(&mut self, address: &DaemonAddress, msg: DaemonMessage) {
        let frame = Frame::Message(Message::from(&msg));
        self.daemon_event(address, DaemonEvent::Frame(frame));
    }

    /// Add a daemon through `/server` and bring its transport up.
    pub fn connect(&mut self, client: &TestClient, raw: &str, tags: &str) -> DaemonAddress {
        let resp = self.request(client, &format!("/server?address={raw};tags={tags}"));
        assert_eq!(resp.status, 200, "{}", resp.body);
        let address = addr(raw);
        self.daemon_event(&address, DaemonEvent::Connected);
        address
    }

    /// Connect, handshake and trust a daemon.
    pub fn login(&mut self, client: &TestClient, raw: &str, tags: &str, info: DaemonInfo) -> DaemonAddress {
        let address = self.connect(client, raw, tags);
        self.daemon_says(&address, DaemonMessage::Ret(info));
        if self.daemon(&address).state() == DaemonState::AwaitingAnswer {
            let resp = self.request(client, &format!("/ssh-answer?address={address};response=yes"));
            assert_eq!(resp.status, 200, "{}", resp.body);
        }
        assert_eq!(self.daemon(&address).state(), DaemonState::Logged);
        self.sent(&address);
        address
    }

    pub fn submit(&mut self, client: &TestClient, query: &str) -> JobId {
        let resp = self.request_with_body(client, &format!("/run?{query}"), "<flow/>");
        assert_eq!(resp.status, 200, "{}", resp.body);
        JobId::new(resp.body)
    }

    /// `RUN` orders sent to `address` since the last call.
    pub fn run_orders(&mut self, address: &DaemonAddress) -> Vec<RunCommand> {
        self.sent(address)
            .iter()
            .filter(|m| m.code == code::RUN)
            .map(|m| RunCommand::try_from(m).unwrap())
            .collect()
    }

    pub fn task_defined(&mut self, address: &DaemonAddress, job: &JobId, fraction: u32) {
        self.daemon_says(
            address,
            DaemonMessage::TaskDefined {
                job_id: job.clone(),
                fraction,
                issues: String::new(),
                cmd_line: format!("run-flow {job} {fraction}"),
                external_id: String::new(),
            },
        );
    }

    pub fn task_status(&mut self, address: &DaemonAddress, job: &JobId, fraction: u32, status: JobStatus) {
        self.daemon_says(
            address,
            DaemonMessage::Status {
                job_id: job.clone(),
                fraction,
                status,
                parameter: "2026-03-01T10:00:00Z".to_string(),
            },
        );
    }

    pub fn daemon(&self, address: &DaemonAddress) -> &Daemon {
        &self.coord.daemons[address]
    }

    pub fn job(&self, id: &JobId) -> &Job {
        &self.coord.jobs[id]
    }
}

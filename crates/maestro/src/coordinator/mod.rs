//! The coordinator: single owner of every daemon, job and client.
//!
//! All state lives in one [`Coordinator`] value driven by [`Coordinator::run`].
//! Connection tasks, timers and the admin surface only talk to it through
//! the [`Event`] queue, so handlers mutate state synchronously and in
//! arrival order without any lock.
//!
//! Handlers are split by concern:
//! - `daemons`: connection state machine, connect-all, prompts, tags
//! - `jobs`: submission, dispatch, task reports, queueing, kill and close
//! - `clients`: handshake, replay and request routing

mod clients;
mod daemons;
mod jobs;

#[cfg(test)]
mod testing;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use maestro_core::{
    Client, ClientId, Daemon, DaemonAddress, Job, JobId, TaskKey,
};
use maestro_proto::{Frame, Message};

use crate::config::Config;
use crate::connector::{Connector, DaemonLink};
use crate::error::StoreError;
use crate::event::{DaemonEvent, Event, EventSender};
use crate::runner::Runner;
use crate::snapshot::{DaemonView, JobView, Snapshot};
use crate::store::{DaemonEntry, DaemonStore};

/// A connected client and the queue feeding its socket.
struct ClientLink {
    client: Client,
    tx: mpsc::UnboundedSender<Frame>,
}

/// Why a daemon connect is suspended in AWAITING_ANSWER.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Prompt {
    /// First handshake: trust the reported daemon id?
    Identity { daemon_id: String },
    /// The daemon asked for a password.
    Password,
}

/// Progress of a connect-all sweep.
#[derive(Debug, Default)]
struct ConnectAll {
    pending: VecDeque<DaemonAddress>,
    current: Option<DaemonAddress>,
}

/// Owner of the whole maestro state.
pub struct Coordinator {
    config: Config,
    connector: Box<dyn Connector>,
    events: EventSender,
    store: DaemonStore,

    daemons: BTreeMap<DaemonAddress, Daemon>,
    links: HashMap<DaemonAddress, DaemonLink>,
    /// Daemons written to the key-file.
    persisted: BTreeSet<DaemonAddress>,
    prompts: HashMap<DaemonAddress, Prompt>,
    passwords: HashMap<DaemonAddress, String>,
    /// Client that issued the current connect attempt of a daemon.
    connect_origin: HashMap<DaemonAddress, ClientId>,
    connect_all: Option<ConnectAll>,
    /// NFS id of the first daemon that logged in.
    pinned_nfsid: Option<String>,
    next_generation: u64,

    jobs: HashMap<JobId, Job>,
    /// Global task registry: which daemon runs each task.
    tasks: HashMap<TaskKey, DaemonAddress>,
    /// Plans of jobs waiting on a parent.
    runners: HashMap<JobId, Runner>,
    /// Fractions sent with `RUN` whose daemon has not defined the task yet.
    planned: HashMap<JobId, BTreeMap<u32, DaemonAddress>>,
    /// Dispatched jobs whose definition is broadcast in submission order.
    job_def_queue: VecDeque<JobId>,
    ready: HashSet<JobId>,
    running_announced: HashSet<JobId>,
    next_job: u64,

    clients: HashMap<ClientId, ClientLink>,
}

impl Coordinator {
    /// Create a coordinator, loading the key-file and the seed daemons.
    pub fn new(
        config: Config,
        connector: Box<dyn Connector>,
        events: EventSender,
    ) -> Result<Self, StoreError> {
        let store = DaemonStore::new(&config.store_path);
        let entries = store.load()?;

        let mut coordinator = Self {
            config,
            connector,
            events,
            store,
            daemons: BTreeMap::new(),
            links: HashMap::new(),
            persisted: BTreeSet::new(),
            prompts: HashMap::new(),
            passwords: HashMap::new(),
            connect_origin: HashMap::new(),
            connect_all: None,
            pinned_nfsid: None,
            next_generation: 0,
            jobs: HashMap::new(),
            tasks: HashMap::new(),
            runners: HashMap::new(),
            planned: HashMap::new(),
            job_def_queue: VecDeque::new(),
            ready: HashSet::new(),
            running_announced: HashSet::new(),
            next_job: 0,
            clients: HashMap::new(),
        };

        for (address, entry) in entries {
            coordinator.persisted.insert(address.clone());
            coordinator
                .daemons
                .insert(address.clone(), entry.into_daemon(address));
        }
        for raw in coordinator.config.seed_daemons.clone() {
            let address = coordinator.daemon_address(&raw);
            coordinator
                .daemons
                .entry(address.clone())
                .or_insert_with(|| Daemon::new(address));
        }

        info!(
            daemons = coordinator.daemons.len(),
            store = %coordinator.store.path().display(),
            "Coordinator initialized"
        );
        Ok(coordinator)
    }

    /// Start-up actions taken once the loop is about to run.
    pub fn start(&mut self) {
        if self.config.autoconnect_on_start {
            self.connect_all(None);
        }
    }

    /// Process events until the queue closes or `shutdown` fires.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>, shutdown: CancellationToken) {
        self.start();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }

        info!(links = self.links.len(), "Coordinator stopping");
        for (_, link) in self.links.drain() {
            link.close();
        }
    }

    /// Apply one event.
    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Daemon {
                address,
                generation,
                event,
            } => {
                if self.links.get(&address).map(DaemonLink::generation) != Some(generation) {
                    debug!(address = %address, generation, "Ignoring event of a stale link");
                    return;
                }
                match event {
                    DaemonEvent::Connected => self.on_daemon_connected(&address),
                    DaemonEvent::Frame(frame) => self.on_daemon_frame(&address, frame),
                    DaemonEvent::Closed(reason) => self.on_daemon_closed(&address, reason),
                }
            }
            Event::ClientConnected { id, tx } => self.on_client_connected(id, tx),
            Event::ClientFrame { id, frame } => self.on_client_frame(&id, frame),
            Event::ClientClosed { id } => self.on_client_closed(&id),
            Event::ConnectTimeout {
                address,
                generation,
            } => self.on_connect_timeout(&address, generation),
            Event::Reconnect { address } => self.on_reconnect_timer(&address),
            Event::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Read-only view of the state.
    pub fn snapshot(&self) -> Snapshot {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| job_order(&j.id));

        Snapshot {
            daemons: self
                .daemons
                .values()
                .map(|d| DaemonView {
                    address: d.address.clone(),
                    hostname: d.info().map(|i| i.hostname.clone()).unwrap_or_default(),
                    state: d.state(),
                    autoconnect: d.autoconnect,
                    tags: d.tags().map(str::to_string).collect(),
                    uncompleted_tasks: d.uncompleted_tasks(),
                    error: d.error().map(|e| e.kind),
                })
                .collect(),
            jobs: jobs
                .into_iter()
                .map(|j| JobView {
                    id: j.id.clone(),
                    title: j.info.title.clone(),
                    status: j.partial_status().unwrap_or(j.status()),
                    total: j.total,
                    tasks: j.n_tasks(),
                    parent_id: j.parent_id.clone(),
                })
                .collect(),
            clients: self.clients.values().filter(|c| c.client.is_identified()).count(),
        }
    }

    /// Normalize a daemon address sent by a client or the CLI.
    fn daemon_address(&self, raw: &str) -> DaemonAddress {
        DaemonAddress::with_default_port(raw, self.config.daemon_port)
    }

    /// Send `msg` to every identified client.
    fn broadcast(&self, msg: Message) {
        for link in self.clients.values().filter(|c| c.client.is_identified()) {
            let _ = link.tx.send(Frame::Message(msg.clone()));
        }
    }

    fn send_client(&self, id: &ClientId, frame: impl Into<Frame>) {
        if let Some(link) = self.clients.get(id) {
            let _ = link.tx.send(frame.into());
        }
    }

    /// Send a prompt about `address` to the client that issued its connect,
    /// or to every client when the connect was automatic.
    fn send_prompt(&self, address: &DaemonAddress, msg: Message) {
        match self
            .connect_origin
            .get(address)
            .filter(|id| self.clients.contains_key(*id))
        {
            Some(id) => self.send_client(id, msg),
            None => self.broadcast(msg),
        }
    }

    /// Queue a message to a daemon. Returns false when it has no link.
    fn send_daemon(&self, address: &DaemonAddress, msg: Message) -> bool {
        match self.links.get(address) {
            Some(link) => link.send(msg),
            None => false,
        }
    }

    /// Deliver `event` to the loop after `delay`.
    fn schedule(&self, delay: Duration, event: Event) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }

    /// Rewrite the key-file with every persisted daemon.
    fn persist(&self) {
        let entries = self
            .persisted
            .iter()
            .filter_map(|a| self.daemons.get(a).map(|d| (a, DaemonEntry::from(d))));
        if let Err(e) = self.store.save(entries) {
            error!(error = %e, path = %self.store.path().display(), "Failed to write key-file");
        }
    }
}

/// Sort key putting counter-issued job ids in submission order.
fn job_order(id: &JobId) -> (u64, String) {
    (id.as_str().parse().unwrap_or(u64::MAX), id.to_string())
}

//! Events processed by the coordinator loop.
//!
//! Every connection task, timer and admin handler talks to the coordinator
//! through this single queue, so all state is mutated from one place.

use tokio::sync::{mpsc, oneshot};

use maestro_core::{ClientId, DaemonAddress};
use maestro_proto::Frame;

use crate::snapshot::Snapshot;

/// Sender half of the coordinator queue.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Something happened on a daemon link.
#[derive(Debug)]
pub enum DaemonEvent {
    /// The transport is up; the handshake can start.
    Connected,
    /// A frame arrived from the daemon.
    Frame(Frame),
    /// The transport is gone, with the reason when it failed.
    Closed(Option<String>),
}

/// Input of the coordinator.
#[derive(Debug)]
pub enum Event {
    /// Output of a daemon link. `generation` identifies the connect attempt
    /// so events of a superseded link are ignored.
    Daemon {
        address: DaemonAddress,
        generation: u64,
        event: DaemonEvent,
    },

    /// A client socket was accepted.
    ClientConnected {
        id: ClientId,
        tx: mpsc::UnboundedSender<Frame>,
    },

    /// A frame arrived from a client.
    ClientFrame { id: ClientId, frame: Frame },

    /// A client socket closed.
    ClientClosed { id: ClientId },

    /// Connect-all watchdog fired for one attempt.
    ConnectTimeout {
        address: DaemonAddress,
        generation: u64,
    },

    /// Autoconnect retry after a transport drop.
    Reconnect { address: DaemonAddress },

    /// Admin surface asks for a read-only view of the state.
    Snapshot(oneshot::Sender<Snapshot>),
}

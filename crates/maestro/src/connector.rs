//! Daemon links: one task per connect attempt.
//!
//! The coordinator never touches sockets. It asks a [`Connector`] for a
//! [`DaemonLink`], pushes frames into it and receives everything the link
//! observes as [`Event::Daemon`] events.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use maestro_core::DaemonAddress;
use maestro_proto::{Frame, MaestroCodec, Message};

use crate::error::ConnectError;
use crate::event::{DaemonEvent, Event, EventSender};

/// Handle on one connect attempt.
///
/// Dropping the handle closes the link once the frames already queued have
/// been written.
#[derive(Debug)]
pub struct DaemonLink {
    generation: u64,
    tx: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
}

impl DaemonLink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<Frame>, cancel: CancellationToken) -> Self {
        Self {
            generation,
            tx,
            cancel,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a message. Returns false when the link task is gone.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(Frame::Message(msg)).is_ok()
    }

    /// Abort a pending connect and close the link after queued frames.
    pub fn close(self) {
        self.cancel.cancel();
    }
}

/// Opens daemon links.
pub trait Connector: Send {
    fn open(&self, address: &DaemonAddress, generation: u64, events: EventSender) -> DaemonLink;
}

/// Connector over plain TCP.
#[derive(Debug, Default, Clone)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn open(&self, address: &DaemonAddress, generation: u64, events: EventSender) -> DaemonLink {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run_link(
            address.clone(),
            generation,
            events,
            rx,
            cancel.clone(),
        ));
        DaemonLink::new(generation, tx, cancel)
    }
}

async fn run_link(
    address: DaemonAddress,
    generation: u64,
    events: EventSender,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
) {
    let notify = |event: DaemonEvent| {
        events
            .send(Event::Daemon {
                address: address.clone(),
                generation,
                event,
            })
            .is_ok()
    };

    debug!(address = %address, generation, "Connecting to daemon");
    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(address = %address, "Connect aborted");
            return;
        }
        result = TcpStream::connect(address.as_str()) => result,
    };
    let stream = match connected {
        Ok(stream) => stream,
        Err(source) => {
            let err = ConnectError::Connect {
                address: address.clone(),
                source,
            };
            warn!(error = %err, "Daemon connection failed");
            notify(DaemonEvent::Closed(Some(err.to_string())));
            return;
        }
    };

    info!(address = %address, "Daemon transport up");
    if !notify(DaemonEvent::Connected) {
        return;
    }

    let mut framed = Framed::new(stream, MaestroCodec::new());
    let reason: Option<ConnectError> = loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = framed.send(frame).await {
                        break Some(e.into());
                    }
                }
                None => break None,
            },
            inbound = framed.next() => match inbound {
                Some(Ok(frame)) => {
                    if !notify(DaemonEvent::Frame(frame)) {
                        break None;
                    }
                }
                Some(Err(e)) => break Some(e.into()),
                None => break Some(ConnectError::ClosedByPeer),
            },
        }
    };

    if let Some(err) = &reason {
        warn!(address = %address, error = %err, "Daemon link lost");
    } else {
        debug!(address = %address, "Daemon link closed");
    }
    notify(DaemonEvent::Closed(reason.map(|e| e.to_string())));
}

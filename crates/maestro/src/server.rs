//! Client listener and service wiring.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use maestro_core::ClientId;
use maestro_proto::MaestroCodec;

use crate::config::Config;
use crate::connector::TcpConnector;
use crate::coordinator::Coordinator;
use crate::event::{Event, EventSender};
use crate::http;

/// Accept client sockets until `shutdown` fires.
pub async fn serve_clients(listener: TcpListener, events: EventSender, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let id = ClientId::generate();
                debug!(client_id = %id, peer = %peer, "Client socket accepted");
                tokio::spawn(run_client(id, stream, events.clone(), shutdown.child_token()));
            }
            Err(e) => warn!(error = %e, "Failed to accept client"),
        }
    }
}

/// Pump frames between one client socket and the coordinator.
///
/// The session ends when either side closes; frames the coordinator queued
/// before dropping the session are still written.
async fn run_client(
    id: ClientId,
    stream: TcpStream,
    events: EventSender,
    shutdown: CancellationToken,
) {
    let (tx, mut outbound) = mpsc::unbounded_channel();
    if events
        .send(Event::ClientConnected { id: id.clone(), tx })
        .is_err()
    {
        return;
    }

    let mut framed = Framed::new(stream, MaestroCodec::new());
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = framed.send(frame).await {
                        warn!(client_id = %id, error = %e, "Write to client failed");
                        break;
                    }
                }
                None => break,
            },
            inbound = framed.next() => match inbound {
                Some(Ok(frame)) => {
                    let event = Event::ClientFrame { id: id.clone(), frame };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(client_id = %id, error = %e, "Malformed client frame");
                    break;
                }
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }

    let _ = events.send(Event::ClientClosed { id });
}

/// Run the maestro until `shutdown` fires or one of its servers stops.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = config.listen_addr.parse()?;
    let http_addr: SocketAddr = config.http_addr.parse()?;

    let (events, rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(config, Box::new(TcpConnector), events.clone())?;

    let client_listener = TcpListener::bind(listen_addr).await?;
    let http_listener = TcpListener::bind(http_addr).await?;
    info!(listen_addr = %listen_addr, http_addr = %http_addr, "Starting maestro");

    let http_shutdown = shutdown.clone();
    let http_server = axum::serve(http_listener, http::create_router(events.clone()))
        .with_graceful_shutdown(async move { http_shutdown.cancelled().await });

    tokio::select! {
        _ = coordinator.run(rx, shutdown.clone()) => info!("Coordinator stopped"),
        _ = serve_clients(client_listener, events, shutdown.clone()) => info!("Client listener stopped"),
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
    }

    shutdown.cancel();
    Ok(())
}

//! GeBR maestro library.
//!
//! The maestro connects to a fleet of daemons, dispatches flows submitted by
//! GUI clients across them and aggregates the per-daemon task reports into
//! job status. All state is owned by the [`Coordinator`] event loop.

pub mod config;
pub mod connector;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod http;
pub mod metrics;
pub mod runner;
pub mod server;
pub mod snapshot;
pub mod store;

pub use config::Config;
pub use connector::{Connector, DaemonLink, TcpConnector};
pub use coordinator::Coordinator;
pub use error::{ConnectError, DispatchError, RequestError, StoreError};
pub use event::{DaemonEvent, Event, EventSender};
pub use snapshot::Snapshot;
pub use store::{DaemonEntry, DaemonStore};

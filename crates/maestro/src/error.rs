//! Service-level errors.

use thiserror::Error;

use maestro_core::{CoreError, DaemonAddress};
use maestro_proto::ProtoError;

/// Key-file errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Key-file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key-file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize key-file: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Transport errors on a daemon link.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Connection to {address} failed: {source}")]
    Connect {
        address: DaemonAddress,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection closed by peer")]
    ClosedByPeer,

    #[error(transparent)]
    Protocol(#[from] ProtoError),
}

/// Dispatch errors raised when a job is handed to its daemons.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Daemon {0} is not logged in")]
    DaemonUnavailable(DaemonAddress),
}

/// Failure of a client request, mapped onto a response code.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Unknown request path: {0}")]
    UnknownPath(String),

    #[error("Handshake required before requests")]
    NotIdentified,

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Proto(#[from] ProtoError),
}

impl RequestError {
    /// Response code carried back to the client.
    pub fn status(&self) -> u16 {
        match self {
            Self::BadRequest(_) | Self::Proto(_) => 400,
            Self::NotIdentified => 403,
            Self::UnknownPath(_) => 404,
            Self::Core(
                CoreError::JobNotFound(_) | CoreError::TaskNotFound(_) | CoreError::DaemonNotFound(_),
            ) => 404,
            Self::Core(CoreError::InvalidInput(_)) => 400,
            Self::Core(_) => 409,
        }
    }
}

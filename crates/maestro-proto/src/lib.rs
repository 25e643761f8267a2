//! Wire protocol of the GeBR maestro.
//!
//! This crate contains:
//! - Old-style `CODE SIZE ARGS` messages and their argument framing
//! - HTTP-style requests and responses carried on the same sockets
//! - A `tokio-util` codec multiplexing both
//! - Converters between messages and domain types, for daemons and clients

pub mod client;
pub mod codec;
pub mod daemon;
pub mod error;
pub mod http;
pub mod message;
pub mod uri;

/// Protocol version exchanged in every handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

// Re-export commonly used types
pub use codec::{Frame, MaestroCodec};
pub use daemon::{DaemonMessage, RunCommand};
pub use error::ProtoError;
pub use http::{HttpRequest, HttpResponse, Method};
pub use message::{code, Message};
pub use uri::Uri;

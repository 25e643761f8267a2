//! Protocol errors.

use thiserror::Error;

/// Errors raised while framing or interpreting protocol messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Transport error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message code not part of the protocol.
    #[error("Unknown message code: {0}")]
    UnknownCode(String),

    /// Argument size field is not a number.
    #[error("Invalid argument size: {0}")]
    InvalidSize(String),

    /// Argument list does not follow `len|value` framing.
    #[error("Malformed arguments: {0}")]
    MalformedArguments(String),

    /// Message carries the wrong number of arguments.
    #[error("Message '{code}' expects {expected} arguments, got {got}")]
    ArgumentCount {
        code: String,
        expected: usize,
        got: usize,
    },

    /// HTTP-style message could not be parsed.
    #[error("Malformed HTTP message: {0}")]
    MalformedHttp(String),

    /// Field value could not be interpreted.
    #[error("Invalid field '{field}': {value}")]
    InvalidField { field: &'static str, value: String },
}

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors this library reports to callers and over the wire.
///
/// Variants carry rendered messages instead of error sources so values can be
/// serialized into responses and cloned into broadcast events.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// The frame could not be decoded into a request.
    #[error("the request `{0}` could not be decoded (bad JSON?)")]
    BadJson(String),

    /// A required field was missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Port settings failed validation, or the driver cannot express them.
    #[error("invalid port configuration: {0}")]
    InvalidConfig(String),

    /// The scanner found no port with the given name.
    #[error("port not found: {0}")]
    PortNotFound(String),

    /// No session exists for the given port name.
    #[error("port is not open: {0}")]
    PortNotOpen(String),

    /// The session id does not match the session holding the port.
    #[error("invalid session ID")]
    InvalidSession,

    /// Another session already holds the port.
    #[error("port is locked by another client")]
    PortLocked,

    /// The session was closed while the operation was in flight.
    #[error("port has been closed")]
    PortClosed,

    /// The driver reported a read/write failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// The request-level read timeout expired.
    #[error("read timeout")]
    ReadTimeout,

    /// The websocket transport failed.
    #[error("websocket issue: {0}")]
    Transport(String),

    /// An unexpected problem; likely a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error should terminate a streaming read loop.
    ///
    /// A vanished session counts: once the port closes and unindexes, the
    /// loop's session id can never become valid again.
    pub fn is_fatal_for_streaming(&self) -> bool {
        matches!(
            self,
            Error::PortClosed | Error::InvalidSession | Error::PortNotOpen(_)
        )
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

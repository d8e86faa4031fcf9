use std::io;
use switchboard_core::{InterfaceRefParseError, ProtocolError, RemoteError};

/// Errors surfaced by connection operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer answered with an error.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// An application reference whose version is not a valid range.
    #[error(transparent)]
    InvalidVersionRange(#[from] InterfaceRefParseError),
    /// The connection closed before the operation completed.
    #[error("connection closed")]
    Closed,
    #[error("remote interface '{interface}' has no method '{method}'")]
    UnknownRemoteMethod { interface: String, method: String },
}

impl Error {
    /// The remote error, if the peer answered with one.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Error::Remote(err) => Some(err),
            _ => None,
        }
    }
}

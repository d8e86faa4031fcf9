//! Core types and wire format for Switchboard.
//!
//! This crate provides the protocol primitives: the message envelope, the
//! standardized error codes, versioned references and frame delimiting. The
//! connection state machine lives in `switchboard-connection`.

mod error;
pub mod framing;
mod interface_ref;
pub mod message;
mod version;

pub use error::{ErrorCode, ProtocolError, RemoteError};
pub use framing::FrameCodec;
pub use interface_ref::{InterfaceRef, InterfaceRefParseError};
pub use message::{Frame, Kind, Message};
pub use version::{Version, VersionRange, VersionRangeError, parse_version};

/// Re-exported so handler signatures don't need a direct dependency.
pub use serde_json::{self, Value, json};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Only handshake messages are accepted.
    AwaitingHandshake,
    /// Session established; all message kinds are accepted.
    HandshakeDone,
    /// Transport closed.
    Closed,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        !matches!(self, ConnectionState::Closed)
    }
}

//! Switchboard server.
//!
//! Wraps every accepted transport in a server-role connection, resolves
//! handshakes against a versioned application index, authenticates through
//! an [`AuthPolicy`] and keeps the set of connected clients.

mod auth;
mod config;
mod server;

pub use auth::{AuthPolicy, SimpleAuthPolicy};
pub use config::{ConfigError, HANDSHAKE_TIMEOUT_MS, ServerConfig};
pub use server::{Server, ServerBuilder, ServerEvent};

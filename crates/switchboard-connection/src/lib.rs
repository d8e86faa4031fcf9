//! Protocol connections for Switchboard.
//!
//! A [`Connection`] runs the protocol over a [`Transport`]: handshake,
//! calls and callbacks, events, inspection, ping and heartbeat. Incoming
//! calls are served by an [`Application`]; server-role connections resolve
//! their application through a [`SessionHost`] during the handshake.
//!
//! ```no_run
//! use std::sync::Arc;
//! use switchboard_connection::{Application, Connection, Transport};
//!
//! # async fn demo(stream: tokio::net::TcpStream) -> Result<(), Box<dyn std::error::Error>> {
//! let app = Arc::new(Application::empty());
//! let conn = Connection::client(Transport::tcp(stream), app);
//! conn.handshake("calc@^1.0.0", None, None).await?;
//! let sum = conn.call_method("math", "add", vec![1.into(), 2.into()]).await?;
//! # let _ = sum;
//! # Ok(())
//! # }
//! ```

mod application;
mod connection;
mod driver;
mod error;
mod proxy;
pub mod registry;
pub mod transport;

pub use application::{Application, ApplicationBuilder, Method, MethodResult, RegistryError};
pub use connection::{Connection, ConnectionEvent, Role, SessionGrant, SessionHost, SessionInfo};
pub use error::Error;
pub use proxy::{RemoteMethod, RemoteProxy};
pub use registry::{AppIndex, Registry};
pub use transport::{Transport, TransportKind};

pub use switchboard_core::{ConnectionState, ErrorCode, InterfaceRef, RemoteError, Value, json};

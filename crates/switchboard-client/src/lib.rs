//! Client-side connection setup for Switchboard.
//!
//! A [`Client`] opens a transport, handshakes through its [`ConnectPolicy`]
//! and optionally inspects remote interfaces up front.

mod client;
mod config;
mod policy;

pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use policy::{ConnectPolicy, SimpleConnectPolicy};

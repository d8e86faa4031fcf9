//! Chat room over Switchboard.
//!
//! Start a server, then join from as many terminals as you like:
//!   cargo run -p switchboard-demo-chat -- serve --port 8001 --ws-port 8002
//!   cargo run -p switchboard-demo-chat -- join --name alice --server 127.0.0.1:8001

mod client;
mod protocol;
mod server;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use switchboard_server::ServerConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chat", about = "Chat room over Switchboard")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the chat server.
    Serve {
        #[arg(long, default_value_t = 8001)]
        port: u16,
        /// Also accept WebSocket connections on this port.
        #[arg(long)]
        ws_port: Option<u16>,
        /// TOML server configuration.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Join a running server.
    Join {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "127.0.0.1:8001")]
        server: SocketAddr,
        /// Heartbeat period in milliseconds.
        #[arg(long)]
        heartbeat_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("chat=info".parse()?))
        .init();

    match Cli::parse().command {
        Command::Serve { port, ws_port, config } => {
            let config = match config {
                Some(path) => ServerConfig::load(path)?,
                None => ServerConfig::default(),
            };
            let tcp: SocketAddr = ([127, 0, 0, 1], port).into();
            let ws = ws_port.map(|port| SocketAddr::from(([127, 0, 0, 1], port)));
            tracing::info!("Starting chat server on {}", tcp);
            server::run(config, tcp, ws).await
        }
        Command::Join { name, server, heartbeat_ms } => {
            client::run(server, name, heartbeat_ms.map(Duration::from_millis)).await
        }
    }
}

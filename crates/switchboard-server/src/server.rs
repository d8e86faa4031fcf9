//! Server: accepts transports, answers handshakes against a versioned
//! application index and tracks live clients.

use crate::auth::{AuthPolicy, SimpleAuthPolicy};
use crate::config::ServerConfig;
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use switchboard_connection::{
    AppIndex, Application, Connection, Error, Registry, RegistryError, SessionGrant, SessionHost,
    Transport,
};
use switchboard_core::RemoteError;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Server lifecycle notifications.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client completed its handshake.
    Connect(Connection),
    /// A connected client went away.
    Disconnect(Connection),
    HandshakeRequest {
        connection: Connection,
        application: String,
        strategy: String,
    },
    HandshakeTimeout(Connection),
    ConnectionError { connection: Connection, error: String },
}

struct Shared {
    registry: Registry,
    auth: Arc<dyn AuthPolicy>,
    config: ServerConfig,
    clients: RwLock<HashMap<u64, Connection>>,
    events: broadcast::Sender<ServerEvent>,
}

impl Shared {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl SessionHost for Shared {
    fn handshake_timeout(&self) -> Option<Duration> {
        Some(self.config.handshake_timeout())
    }

    fn resolve_application(&self, name: &str, version: Option<&str>) -> Option<Arc<Application>> {
        self.registry.resolve(name, version)
    }

    async fn start_session(
        &self,
        connection: &Connection,
        application: &Arc<Application>,
        strategy: &str,
        credentials: &Value,
    ) -> Result<SessionGrant, RemoteError> {
        self.auth
            .start_session(connection, application, strategy, credentials)
            .await
    }

    fn handshake_requested(&self, connection: &Connection, application: &str, strategy: &str) {
        self.emit(ServerEvent::HandshakeRequest {
            connection: connection.clone(),
            application: application.to_string(),
            strategy: strategy.to_string(),
        });
    }

    fn session_started(&self, connection: &Connection) {
        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(connection.id(), connection.clone());
        if let Some(interval) = self.config.heartbeat_interval() {
            let _ = connection.start_heartbeat(interval);
        }
        tracing::debug!("Client {} connected", connection.id());
        self.emit(ServerEvent::Connect(connection.clone()));
    }

    fn handshake_timed_out(&self, connection: &Connection) {
        self.emit(ServerEvent::HandshakeTimeout(connection.clone()));
    }

    fn connection_error(&self, connection: &Connection, error: &Error) {
        self.emit(ServerEvent::ConnectionError {
            connection: connection.clone(),
            error: error.to_string(),
        });
    }

    fn connection_closed(&self, connection: &Connection) {
        let removed = self
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&connection.id());
        if let Some(connection) = removed {
            tracing::debug!("Client {} disconnected", connection.id());
            self.emit(ServerEvent::Disconnect(connection));
        }
    }
}

/// A protocol server.
///
/// Cloning is cheap; clones share the application index and client set.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Run the protocol over an accepted transport.
    pub fn accept(&self, transport: Transport) -> Connection {
        Connection::server(transport, self.shared.clone())
    }

    /// Bind `addr` and serve delimiter-framed TCP connections until the
    /// listener fails.
    ///
    /// A method handler panic on any served connection resumes out of this
    /// future once that connection has closed.
    pub async fn listen_tcp(&self, addr: SocketAddr) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Listening on tcp://{}", listener.local_addr()?);
        self.serve_tcp(listener).await
    }

    pub async fn serve_tcp(&self, listener: TcpListener) -> io::Result<()> {
        let mut running: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, client_addr) = accepted?;
                    tracing::debug!("Accepted tcp connection from {}", client_addr);
                    let max = self.shared.config.max_message_size;
                    let transport = Transport::framed_with_max_message_size(stream, max)
                        .with_peer_addr(Some(client_addr));
                    let connection = self.accept(transport);
                    running.push(Box::pin(async move { connection.join().await }));
                }
                Some(()) = running.next(), if !running.is_empty() => {}
            }
        }
    }

    /// Bind `addr` and serve WebSocket connections until the listener fails.
    pub async fn listen_ws(&self, addr: SocketAddr) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Listening on ws://{}", listener.local_addr()?);
        self.serve_ws(listener).await
    }

    /// Like [`Server::serve_tcp`], with a WebSocket upgrade per connection.
    pub async fn serve_ws(&self, listener: TcpListener) -> io::Result<()> {
        let mut running: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, client_addr) = accepted?;
                    let server = self.clone();
                    running.push(Box::pin(async move {
                        match server.upgrade(stream, client_addr).await {
                            Ok(connection) => connection.join().await,
                            Err(e) => tracing::warn!("WebSocket upgrade failed for {}: {}", client_addr, e),
                        }
                    }));
                }
                Some(()) = running.next(), if !running.is_empty() => {}
            }
        }
    }

    async fn upgrade(
        &self,
        stream: TcpStream,
        client_addr: SocketAddr,
    ) -> Result<Connection, tokio_tungstenite::tungstenite::Error> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        tracing::debug!("Accepted websocket connection from {}", client_addr);
        Ok(self.accept(Transport::websocket(ws).with_peer_addr(Some(client_addr))))
    }

    /// Replace the application index. Established sessions keep the
    /// application they were bound to.
    pub fn update_applications(&self, applications: Vec<Application>) -> Result<(), RegistryError> {
        self.shared.registry.replace(AppIndex::new(applications)?);
        Ok(())
    }

    pub fn update_index(&self, index: AppIndex) {
        self.shared.registry.replace(index);
    }

    pub fn resolve_application(&self, name: &str, version: Option<&str>) -> Option<Arc<Application>> {
        self.shared.registry.resolve(name, version)
    }

    /// Emit an event to every connected client.
    pub fn broadcast(&self, interface: &str, event: &str, args: Vec<Value>) {
        for client in self.clients() {
            if client.emit_remote_event(interface, event, args.clone()).is_err() {
                tracing::debug!("Skipping closed client {} in broadcast", client.id());
            }
        }
    }

    /// Clients that completed the handshake and are still connected.
    pub fn clients(&self) -> Vec<Connection> {
        self.shared
            .clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn client(&self, id: u64) -> Option<Connection> {
        self.shared
            .clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}

/// Builder for [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    applications: Vec<Application>,
    index: Option<AppIndex>,
    auth: Option<Arc<dyn AuthPolicy>>,
    config: ServerConfig,
}

impl ServerBuilder {
    pub fn application(mut self, application: Application) -> Self {
        self.applications.push(application);
        self
    }

    pub fn applications(mut self, applications: impl IntoIterator<Item = Application>) -> Self {
        self.applications.extend(applications);
        self
    }

    /// Use a pre-built index instead of the application list.
    pub fn index(mut self, index: AppIndex) -> Self {
        self.index = Some(index);
        self
    }

    /// Defaults to [`SimpleAuthPolicy`].
    pub fn auth_policy(mut self, policy: impl AuthPolicy) -> Self {
        self.auth = Some(Arc::new(policy));
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn build(self) -> Result<Server, RegistryError> {
        let index = match self.index {
            Some(index) => index,
            None => AppIndex::new(self.applications)?,
        };
        let auth: Arc<dyn AuthPolicy> = match self.auth {
            Some(auth) => auth,
            None => Arc::new(SimpleAuthPolicy),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Server {
            shared: Arc::new(Shared {
                registry: Registry::new(index),
                auth,
                config: self.config,
                clients: RwLock::new(HashMap::new()),
                events,
            }),
        })
    }
}

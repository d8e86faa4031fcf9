//! Dialing and handshaking client connections.

use crate::config::ClientConfig;
use crate::policy::{ConnectPolicy, SimpleConnectPolicy};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use switchboard_connection::{Application, Connection, Error, RemoteProxy, Transport};
use tokio::net::{TcpStream, ToSocketAddrs};

/// Opens client connections: binds the local application, runs the
/// connect policy and starts the heartbeat.
#[derive(Clone)]
pub struct Client {
    application: Arc<Application>,
    policy: Arc<dyn ConnectPolicy>,
    config: ClientConfig,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Run the protocol over `transport` and handshake with `app`.
    ///
    /// The connection is closed if the handshake fails.
    pub async fn connect(&self, app: &str, transport: Transport) -> Result<Connection, Error> {
        let connection = Connection::client(transport, self.application.clone());
        let session = match self.policy.connect(app, &connection).await {
            Ok(session) => session,
            Err(e) => {
                connection.close();
                return Err(e);
            }
        };
        tracing::debug!("Connected to {} (session {})", app, session);

        if let Some(interval) = self.config.heartbeat_interval() {
            connection.start_heartbeat(interval)?;
        }
        Ok(connection)
    }

    pub async fn connect_tcp(&self, app: &str, addr: impl ToSocketAddrs) -> Result<Connection, Error> {
        let stream = TcpStream::connect(addr).await?;
        let peer_addr = stream.peer_addr().ok();
        let transport = Transport::framed_with_max_message_size(stream, self.config.max_message_size)
            .with_peer_addr(peer_addr);
        self.connect(app, transport).await
    }

    /// Connect over a WebSocket at `url` (`ws://` or `wss://`).
    pub async fn connect_ws(&self, app: &str, url: &str) -> Result<Connection, Error> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(io::Error::other)?;
        self.connect(app, Transport::websocket(ws)).await
    }

    /// Connect, then inspect each of `interfaces`.
    ///
    /// The first failing inspect fails the whole operation and closes the
    /// connection.
    pub async fn connect_and_inspect(
        &self,
        app: &str,
        transport: Transport,
        interfaces: &[&str],
    ) -> Result<(Connection, HashMap<String, RemoteProxy>), Error> {
        let connection = self.connect(app, transport).await?;

        let mut proxies = HashMap::with_capacity(interfaces.len());
        for interface in interfaces {
            match connection.inspect_interface(interface).await {
                Ok(proxy) => {
                    proxies.insert(interface.to_string(), proxy);
                }
                Err(e) => {
                    connection.close();
                    return Err(e);
                }
            }
        }
        Ok((connection, proxies))
    }

    pub fn application(&self) -> &Arc<Application> {
        &self.application
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

/// Builder for [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    application: Option<Application>,
    policy: Option<Arc<dyn ConnectPolicy>>,
    config: ClientConfig,
}

impl ClientBuilder {
    /// Application serving calls the server makes back to this client.
    /// Defaults to one with no interfaces.
    pub fn application(mut self, application: Application) -> Self {
        self.application = Some(application);
        self
    }

    /// Defaults to [`SimpleConnectPolicy`] with the configured credentials.
    pub fn connect_policy(mut self, policy: impl ConnectPolicy) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    pub fn credentials(mut self, login: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.login = Some(login.into());
        self.config.password = Some(password.into());
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn build(self) -> Client {
        let policy: Arc<dyn ConnectPolicy> = match self.policy {
            Some(policy) => policy,
            None => Arc::new(SimpleConnectPolicy::new(
                self.config.login.clone(),
                self.config.password.clone(),
            )),
        };
        Client {
            application: Arc::new(self.application.unwrap_or_else(Application::empty)),
            policy,
            config: self.config,
        }
    }
}

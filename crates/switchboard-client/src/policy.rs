//! How a client authenticates during the handshake.

use async_trait::async_trait;
use switchboard_connection::{Connection, Error};

/// Performs the handshake for a freshly opened client connection.
#[async_trait]
pub trait ConnectPolicy: Send + Sync + 'static {
    /// Handshake with `app` (`name` or `name@range`) and return the session id.
    async fn connect(&self, app: &str, connection: &Connection) -> Result<String, Error>;
}

/// Logs in when both login and password are set, otherwise connects
/// anonymously.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimpleConnectPolicy {
    login: Option<String>,
    password: Option<String>,
}

impl SimpleConnectPolicy {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn new(login: Option<String>, password: Option<String>) -> Self {
        Self { login, password }
    }

    pub fn with_credentials(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(Some(login.into()), Some(password.into()))
    }
}

#[async_trait]
impl ConnectPolicy for SimpleConnectPolicy {
    async fn connect(&self, app: &str, connection: &Connection) -> Result<String, Error> {
        connection
            .handshake(app, self.login.as_deref(), self.password.as_deref())
            .await
    }
}

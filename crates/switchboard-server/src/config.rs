//! Server configuration.
//!
//! ```toml
//! handshake_timeout_ms = 3000
//! heartbeat_interval_ms = 5000
//! max_message_size = 8388608
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use switchboard_core::framing::MAX_MESSAGE_SIZE;

/// Default time a new connection has to complete its handshake.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub handshake_timeout_ms: u64,
    /// Heartbeat period for established sessions; unset or zero disables it.
    pub heartbeat_interval_ms: Option<u64>,
    /// Largest accepted frame on byte-stream transports.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
            heartbeat_interval_ms: None,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid server config: {0}")]
    Toml(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.handshake_timeout(), Duration::from_secs(3));
        assert_eq!(config.heartbeat_interval(), None);
        assert_eq!(config.max_message_size, 8 * 1024 * 1024);
    }

    #[test]
    fn partial_override() {
        let config = ServerConfig::from_toml_str("heartbeat_interval_ms = 250").unwrap();
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_millis(250)));
        assert_eq!(config.handshake_timeout_ms, HANDSHAKE_TIMEOUT_MS);
    }

    #[test]
    fn zero_heartbeat_disables() {
        let config = ServerConfig::from_toml_str("heartbeat_interval_ms = 0").unwrap();
        assert_eq!(config.heartbeat_interval(), None);
    }

    #[test]
    fn rejects_wrong_types() {
        let err = ServerConfig::from_toml_str("handshake_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn missing_file() {
        let err = ServerConfig::load("/nonexistent/switchboard.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

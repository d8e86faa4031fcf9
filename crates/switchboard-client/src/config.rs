//! Client configuration.
//!
//! ```toml
//! heartbeat_interval_ms = 5000
//! login = "alice"
//! password = "secret"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use switchboard_core::framing::MAX_MESSAGE_SIZE;

/// Client settings, loadable from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Heartbeat period once connected; unset or zero disables it.
    pub heartbeat_interval_ms: Option<u64>,
    pub login: Option<String>,
    pub password: Option<String>,
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: None,
            login: None,
            password: None,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_credentials() {
        let config = ClientConfig::from_toml_str(
            r#"
            login = "alice"
            password = "secret"
            heartbeat_interval_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.login.as_deref(), Some("alice"));
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_secs(1)));
        assert_eq!(config.max_message_size, MAX_MESSAGE_SIZE);
    }

    #[test]
    fn empty_is_default() {
        assert_eq!(ClientConfig::from_toml_str("").unwrap(), ClientConfig::default());
    }
}

//! Session authentication.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use switchboard_connection::{Application, Connection, SessionGrant};
use switchboard_core::message::STRATEGY_ANONYMOUS;
use switchboard_core::{ErrorCode, RemoteError};
use uuid::Uuid;

/// Decides whether a handshake may start a session.
///
/// `strategy` is the handshake's strategy verb (`anonymous` when the client
/// sent none) and `credentials` its payload, e.g. `["login", "password"]`
/// for the `login` strategy.
#[async_trait]
pub trait AuthPolicy: Send + Sync + 'static {
    async fn start_session(
        &self,
        connection: &Connection,
        application: &Arc<Application>,
        strategy: &str,
        credentials: &Value,
    ) -> Result<SessionGrant, RemoteError>;
}

/// Accepts anonymous sessions only.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleAuthPolicy;

#[async_trait]
impl AuthPolicy for SimpleAuthPolicy {
    async fn start_session(
        &self,
        _connection: &Connection,
        _application: &Arc<Application>,
        strategy: &str,
        _credentials: &Value,
    ) -> Result<SessionGrant, RemoteError> {
        if strategy != STRATEGY_ANONYMOUS {
            return Err(ErrorCode::AuthFailed.into());
        }
        Ok(SessionGrant {
            username: None,
            session_id: Uuid::new_v4().to_string(),
        })
    }
}

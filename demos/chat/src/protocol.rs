//! Chat payloads carried as call and event arguments.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Application name and version the chat server registers.
pub const APPLICATION: &str = "chat@1.0.0";
/// Interface holding the room methods and events.
pub const ROOM: &str = "room";

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub from: String,
    pub text: String,
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

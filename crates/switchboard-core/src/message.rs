//! Protocol messages.
//!
//! Every message is a JSON object with up to two keys. The first key names
//! the kind and holds a header array `[id, target?, version?]`; the second
//! key (the verb) carries the payload and, for calls and events, doubles as
//! the method or event name:
//!
//! ```text
//! {"call":[1,"auth"],"signIn":["user","pass"]}
//! {"callback":[1],"ok":[true]}
//! {"handshake":[0,"app","^1.2.0"],"login":["user","pass"]}
//! ```
//!
//! An empty object is a heartbeat, not a message.

use crate::error::{ProtocolError, RemoteError};
use crate::InterfaceRef;
use serde_json::{Map, Value};
use std::fmt;

/// The seven message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Handshake,
    Call,
    Callback,
    Event,
    Inspect,
    Ping,
    Pong,
}

impl Kind {
    pub const ALL: [Kind; 7] = [
        Kind::Handshake,
        Kind::Call,
        Kind::Callback,
        Kind::Event,
        Kind::Inspect,
        Kind::Ping,
        Kind::Pong,
    ];

    /// The envelope key for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Handshake => "handshake",
            Kind::Call => "call",
            Kind::Callback => "callback",
            Kind::Event => "event",
            Kind::Inspect => "inspect",
            Kind::Ping => "ping",
            Kind::Pong => "pong",
        }
    }

    pub fn from_key(key: &str) -> Option<Kind> {
        Kind::ALL.into_iter().find(|k| k.as_str() == key)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verb of a successful callback or handshake response.
pub const VERB_OK: &str = "ok";
/// Verb of a failed callback or handshake response.
pub const VERB_ERROR: &str = "error";
/// Authentication strategy verb for login/password handshakes.
pub const STRATEGY_LOGIN: &str = "login";
/// Strategy assumed when a handshake carries no strategy verb.
pub const STRATEGY_ANONYMOUS: &str = "anonymous";

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: Kind,
    pub id: i64,
    pub target: Option<InterfaceRef>,
    pub verb: Option<String>,
    pub payload: Value,
}

impl Message {
    /// A bare message with no target and no verb.
    pub fn new(kind: Kind, id: i64) -> Self {
        Self {
            kind,
            id,
            target: None,
            verb: None,
            payload: Value::Null,
        }
    }

    fn with_target(mut self, target: InterfaceRef) -> Self {
        self.target = Some(target);
        self
    }

    fn with_verb(mut self, verb: impl Into<String>, payload: Value) -> Self {
        self.verb = Some(verb.into());
        self.payload = payload;
        self
    }

    pub fn call(id: i64, interface: &str, method: &str, args: Vec<Value>) -> Self {
        Self::new(Kind::Call, id)
            .with_target(InterfaceRef::new(interface))
            .with_verb(method, Value::Array(args))
    }

    pub fn callback_ok(id: i64, values: Vec<Value>) -> Self {
        Self::new(Kind::Callback, id).with_verb(VERB_OK, Value::Array(values))
    }

    pub fn callback_error(id: i64, error: &RemoteError) -> Self {
        Self::new(Kind::Callback, id).with_verb(VERB_ERROR, error.to_wire())
    }

    pub fn event(id: i64, interface: &str, event: &str, args: Vec<Value>) -> Self {
        Self::new(Kind::Event, id)
            .with_target(InterfaceRef::new(interface))
            .with_verb(event, Value::Array(args))
    }

    /// A handshake request; credentials add a `login` strategy.
    pub fn handshake_request(id: i64, app: &InterfaceRef, credentials: Option<(&str, &str)>) -> Self {
        let message = Self::new(Kind::Handshake, id).with_target(app.clone());
        match credentials {
            Some((login, password)) => message.with_verb(
                STRATEGY_LOGIN,
                Value::Array(vec![login.into(), password.into()]),
            ),
            None => message,
        }
    }

    pub fn handshake_ok(id: i64, session_id: &str) -> Self {
        Self::new(Kind::Handshake, id).with_verb(VERB_OK, Value::String(session_id.to_string()))
    }

    pub fn handshake_error(id: i64, error: &RemoteError) -> Self {
        Self::new(Kind::Handshake, id).with_verb(VERB_ERROR, error.to_wire())
    }

    pub fn inspect(id: i64, interface: &str) -> Self {
        Self::new(Kind::Inspect, id).with_target(InterfaceRef::new(interface))
    }

    pub fn ping(id: i64) -> Self {
        Self::new(Kind::Ping, id)
    }

    pub fn pong(id: i64) -> Self {
        Self::new(Kind::Pong, id)
    }

    /// Name of the targeted interface or application.
    pub fn target_name(&self) -> Option<&str> {
        self.target.as_ref().map(InterfaceRef::name)
    }

    /// The payload as an argument list; a scalar payload is one argument.
    pub fn args(&self) -> Vec<Value> {
        match &self.payload {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        }
    }

    pub fn is_verb(&self, verb: &str) -> bool {
        self.verb.as_deref() == Some(verb)
    }

    /// Build the envelope object.
    pub fn to_value(&self) -> Value {
        let mut header = vec![Value::from(self.id)];
        if let Some(target) = &self.target {
            header.push(Value::String(target.name().to_string()));
            if let Some(version) = target.version() {
                header.push(Value::String(version.to_string()));
            }
        }

        let mut envelope = Map::new();
        envelope.insert(self.kind.as_str().to_string(), Value::Array(header));
        if let Some(verb) = &self.verb {
            envelope.insert(verb.clone(), self.payload.clone());
        }
        Value::Object(envelope)
    }

    /// Serialize to the wire text of one frame (without delimiter).
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Empty object: liveness signal only.
    Heartbeat,
    Message(Message),
    /// A well-formed object that carries no known kind key.
    Unrecognized(Value),
}

/// Encoded heartbeat frame.
pub const HEARTBEAT: &str = "{}";

/// Decode the text of one frame.
pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    from_value(value)
}

/// Classify a decoded value tree.
pub fn from_value(value: Value) -> Result<Frame, ProtocolError> {
    let Value::Object(map) = &value else {
        return Err(ProtocolError::NotAnObject(value.to_string()));
    };

    if map.is_empty() {
        return Ok(Frame::Heartbeat);
    }

    let kinds: Vec<(&String, Kind)> = map
        .keys()
        .filter_map(|key| Kind::from_key(key).map(|kind| (key, kind)))
        .collect();

    let (kind_key, kind) = match kinds.as_slice() {
        [] => return Ok(Frame::Unrecognized(value)),
        [single] => *single,
        many => {
            return Err(ProtocolError::AmbiguousKind(
                many.iter().map(|(key, _)| (*key).clone()).collect(),
            ));
        }
    };

    let header = map
        .get(kind_key)
        .and_then(Value::as_array)
        .ok_or(ProtocolError::InvalidHeader { kind: kind.as_str() })?;
    let id = header
        .first()
        .and_then(Value::as_i64)
        .ok_or(ProtocolError::InvalidHeader { kind: kind.as_str() })?;

    let target = header.get(1).and_then(Value::as_str).map(|name| {
        match header.get(2).and_then(Value::as_str) {
            Some(version) => InterfaceRef::versioned(name, version),
            None => InterfaceRef::new(name),
        }
    });

    let verb = map.iter().find(|(key, _)| *key != kind_key);

    Ok(Frame::Message(Message {
        kind,
        id,
        target,
        verb: verb.map(|(key, _)| key.clone()),
        payload: verb.map(|(_, payload)| payload.clone()).unwrap_or(Value::Null),
    }))
}

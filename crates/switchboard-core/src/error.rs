//! Peer-visible protocol errors.
//!
//! Errors travel inside `callback` and `handshake` messages as an array
//! `[code]` or `[code, message]`. The standardized codes below are stable
//! and carry default messages, so the message is only put on the wire when
//! it differs from (or has no) default.

use serde_json::Value;

/// Standardized protocol error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum ErrorCode {
    /// Generic application error (used for plain string errors).
    Generic = 1,
    AppNotFound = 10,
    AuthFailed = 11,
    InterfaceNotFound = 12,
    InterfaceIncompatible = 13,
    MethodNotFound = 14,
    NotAServer = 15,
    InternalApiError = 16,
    InvalidSignature = 17,
}

impl ErrorCode {
    /// Map a numeric code to a standardized code, if it is one.
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            10 => Self::AppNotFound,
            11 => Self::AuthFailed,
            12 => Self::InterfaceNotFound,
            13 => Self::InterfaceIncompatible,
            14 => Self::MethodNotFound,
            15 => Self::NotAServer,
            16 => Self::InternalApiError,
            17 => Self::InvalidSignature,
            1 => Self::Generic,
            _ => return None,
        })
    }

    /// The numeric wire value.
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Default human-readable message. `Generic` has none.
    pub fn default_message(self) -> Option<&'static str> {
        match self {
            Self::Generic => None,
            Self::AppNotFound => Some("Application not found"),
            Self::AuthFailed => Some("Authentication failed"),
            Self::InterfaceNotFound => Some("Interface not found"),
            Self::InterfaceIncompatible => Some("Incompatible interface"),
            Self::MethodNotFound => Some("Method not found"),
            Self::NotAServer => Some("Not a server"),
            Self::InternalApiError => Some("Internal API error"),
            Self::InvalidSignature => Some("Invalid signature"),
        }
    }
}

/// An error reported by (or to) the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("remote error {code}: {message}")]
pub struct RemoteError {
    code: i64,
    message: String,
}

impl RemoteError {
    /// Create an error for `code` with its default message.
    pub fn new(code: impl Into<i64>) -> Self {
        let code = code.into();
        Self {
            code,
            message: default_message_for(code),
        }
    }

    /// Create an error with an explicit message.
    pub fn with_message(code: impl Into<i64>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        if message.is_empty() {
            return Self::new(code);
        }
        Self { code, message }
    }

    /// A free-form application error, sent as `[1, message]`.
    pub fn other(message: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::Generic, message)
    }

    pub fn code(&self) -> i64 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The standardized code, if this is one.
    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code.code()
    }

    /// Encode as the wire array.
    ///
    /// The message is omitted for standardized codes and whenever it is just
    /// the code rendered as a string.
    pub fn to_wire(&self) -> Value {
        let standard = self.kind().and_then(ErrorCode::default_message).is_some();
        let meaningful = !self.message.is_empty() && self.message != self.code.to_string();

        if meaningful && !standard {
            Value::Array(vec![self.code.into(), self.message.clone().into()])
        } else {
            Value::Array(vec![self.code.into()])
        }
    }

    /// Decode from a wire array `[code, message?]`.
    ///
    /// Anything that is not such an array decodes to a generic error carrying
    /// the raw value as its message.
    pub fn from_wire(value: &Value) -> Self {
        let Some(items) = value.as_array() else {
            return Self::other(value.to_string());
        };
        let Some(code) = items.first().and_then(Value::as_i64) else {
            return Self::other(value.to_string());
        };
        match items.get(1).and_then(Value::as_str) {
            Some(message) => Self::with_message(code, message),
            None => Self::new(code),
        }
    }
}

fn default_message_for(code: i64) -> String {
    ErrorCode::from_code(code)
        .and_then(ErrorCode::default_message)
        .map(str::to_string)
        .unwrap_or_else(|| code.to_string())
}

impl From<ErrorCode> for i64 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

impl From<ErrorCode> for RemoteError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

impl From<String> for RemoteError {
    fn from(message: String) -> Self {
        Self::other(message)
    }
}

impl From<&str> for RemoteError {
    fn from(message: &str) -> Self {
        Self::other(message)
    }
}

/// Error decoding a frame into a protocol message.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message must be an object, got: {0}")]
    NotAnObject(String),
    #[error("message has more than one kind key: {0:?}")]
    AmbiguousKind(Vec<String>),
    #[error("'{kind}' header must be an array starting with an integer message id")]
    InvalidHeader { kind: &'static str },
}

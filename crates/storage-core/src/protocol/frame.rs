//! Wire frames exchanged between endpoints.
//!
//! Each transport message carries exactly one JSON frame, tagged by `type`:
//!
//! ```text
//! {"type":"request","id":7,"name":"getItem","payload":{"key":"a"}}
//! {"type":"response","id":7,"payload":{"value":1}}
//! {"type":"response","id":7,"error":{"code":"storage","message":"..."}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};

/// Maximum frame size (16MB). Larger messages are dropped unread.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Machine-readable category of an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    /// The access policy denies this operation
    Forbidden,
    /// The handshake has not completed yet
    NotConnected,
    /// The backing store rejected the operation
    Storage,
    /// The request payload could not be decoded
    BadRequest,
    /// No handler is registered under the requested name
    UnknownRequest,
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Forbidden => "forbidden",
            Self::NotConnected => "notConnected",
            Self::Storage => "storage",
            Self::BadRequest => "badRequest",
            Self::UnknownRequest => "unknownRequest",
        };
        f.write_str(s)
    }
}

/// Error carried by a response frame in place of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn forbidden(operation: &str) -> Self {
        Self::new(
            ErrorCode::Forbidden,
            format!("Operation '{}' is not permitted", operation),
        )
    }

    pub fn not_connected() -> Self {
        Self::new(ErrorCode::NotConnected, "Storage is not connected yet")
    }

    pub fn unknown_request(name: &str) -> Self {
        Self::new(
            ErrorCode::UnknownRequest,
            format!("No handler for request '{}'", name),
        )
    }
}

impl Display for ErrorReply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Outcome of a request as seen by the requester.
pub type Reply = Result<Value, ErrorReply>;

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    Request {
        id: u64,
        name: String,
        #[serde(default)]
        payload: Value,
    },
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorReply>,
    },
}

impl Frame {
    pub fn request(id: u64, name: impl Into<String>, payload: Value) -> Self {
        Self::Request {
            id,
            name: name.into(),
            payload,
        }
    }

    /// Build a response frame from a reply. A `null` payload is left off the wire.
    pub fn response(id: u64, reply: Reply) -> Self {
        match reply {
            Ok(Value::Null) => Self::Response {
                id,
                payload: None,
                error: None,
            },
            Ok(payload) => Self::Response {
                id,
                payload: Some(payload),
                error: None,
            },
            Err(error) => Self::Response {
                id,
                payload: None,
                error: Some(error),
            },
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => *id,
        }
    }

    /// Serialize to UTF-8 JSON bytes.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Try to parse a frame from raw bytes.
    ///
    /// Returns `None` for anything that is not a well-formed frame.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

/// Collapse the optional payload/error pair of a response into a reply.
///
/// An error wins over a payload if a peer sends both.
pub fn into_reply(payload: Option<Value>, error: Option<ErrorReply>) -> Reply {
    match error {
        Some(error) => Err(error),
        None => Ok(payload.unwrap_or(Value::Null)),
    }
}

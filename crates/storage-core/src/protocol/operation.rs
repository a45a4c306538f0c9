//! Storage operations and their request/response payloads.
//!
//! Names and payload field names are camelCase on the wire, matching the
//! browser storage API the client mirrors.

use crate::access::Access;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};

/// Name of the handshake request the proxy sends to the client.
pub const CONNECT: &str = "connect";

/// A named storage operation served by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetItem,
    SetItem,
    RemoveItem,
    Clear,
    Length,
    Key,
    Keys,
}

impl Operation {
    /// Every operation, in registration order.
    pub const ALL: [Operation; 7] = [
        Self::GetItem,
        Self::SetItem,
        Self::RemoveItem,
        Self::Clear,
        Self::Length,
        Self::Key,
        Self::Keys,
    ];

    /// Wire name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetItem => "getItem",
            Self::SetItem => "setItem",
            Self::RemoveItem => "removeItem",
            Self::Clear => "clear",
            Self::Length => "length",
            Self::Key => "key",
            Self::Keys => "keys",
        }
    }

    /// Access category the permission gate checks for this operation.
    pub fn access(&self) -> Access {
        match self {
            Self::GetItem | Self::Length | Self::Key | Self::Keys => Access::Read,
            Self::SetItem | Self::RemoveItem | Self::Clear => Access::Write,
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of `getItem` and `removeItem`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRequest {
    pub key: String,
}

/// Payload of `setItem`. A missing value stores `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetItemRequest {
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

/// Payload of `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRequest {
    pub index: KeyIndex,
}

/// Any JSON integer. Negative and oversized indices are valid requests that
/// are never in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyIndex {
    Unsigned(u64),
    Signed(i64),
}

impl KeyIndex {
    /// The index as a position in the store, if it can name one.
    pub fn position(self) -> Option<usize> {
        match self {
            Self::Unsigned(index) => usize::try_from(index).ok(),
            Self::Signed(index) => usize::try_from(index).ok(),
        }
    }
}

impl From<i64> for KeyIndex {
    fn from(index: i64) -> Self {
        Self::Signed(index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetItemResponse {
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LengthResponse {
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyResponse {
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeysResponse {
    pub keys: Vec<String>,
}

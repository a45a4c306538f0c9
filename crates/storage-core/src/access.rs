//! Read/write permission gate.
//!
//! The policy is fixed when a proxy is constructed. Every operation handler
//! consults it before touching the backing store.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("No read or write access granted")]
    NoAccess,
}

/// Category of access an operation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Access {
    Read,
    Write,
}

/// What a caller observes when the gate denies its request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DenialPolicy {
    /// Drop the request without replying. The caller never hears back.
    #[default]
    Silent,
    /// Reply with a `forbidden` error naming the operation.
    Reject,
}

/// Immutable read/write flag pair.
///
/// At least one flag is always set: a policy granting nothing cannot be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPolicy {
    read: bool,
    write: bool,
}

impl AccessPolicy {
    pub fn new(read: bool, write: bool) -> Result<Self, AccessError> {
        if !read && !write {
            return Err(AccessError::NoAccess);
        }
        Ok(Self { read, write })
    }

    pub fn can_read(&self) -> bool {
        self.read
    }

    pub fn can_write(&self) -> bool {
        self.write
    }

    /// Check whether an access category is granted.
    pub fn allows(&self, access: Access) -> bool {
        match access {
            Access::Read => self.read,
            Access::Write => self.write,
        }
    }
}

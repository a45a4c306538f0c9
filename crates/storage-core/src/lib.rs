//! storage-core: Permission-gated storage proxy over a message transport.
//!
//! This crate provides:
//! - The storage proxy (handshake, read/write gate, operation dispatch)
//! - The wire protocol (frames, operations, error replies)
//! - KeyValueStore/StoreFactory and Transport trait abstractions
//! - An in-memory store and an in-process channel transport
//! - The client counterpart that drives a remote proxy

pub mod access;
pub mod channel;
pub mod client;
pub mod protocol;
pub mod proxy;
pub mod store;
pub mod transport;

pub use access::{Access, AccessError, AccessPolicy, DenialPolicy};
pub use channel::{pair, Endpoint};
pub use client::{ClientError, StorageClient};
pub use protocol::{ErrorCode, ErrorReply, Frame, Operation};
pub use proxy::{ProxyError, ProxyOptions, StorageProxy};
pub use store::{
    InMemoryStore, InMemoryStoreFactory, KeyValueStore, StoreConfig, StoreError, StoreFactory,
};
pub use transport::{handler, Handler, Responder, Transport, TransportError};

//! storage-daemon library: Exposes the daemon components for testing.
//!
//! A thin layer over the storage-core proxy that adds a file-backed store,
//! a WebSocket transport and the server that ties them together.

pub mod config;
pub mod connection;
pub mod file_store;
pub mod server;

// Re-export key types for convenience
pub use config::{Args, ConfigError, DaemonConfig};
pub use connection::{connect_client, WsConnection};
pub use file_store::{FileStore, FileStoreFactory};
pub use server::ProxyServer;

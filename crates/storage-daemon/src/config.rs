//! Daemon configuration from command-line flags and environment variables.

use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;
use storage_core::{AccessPolicy, DenialPolicy, ProxyOptions};

/// Directory under the platform data dir used when `--data-dir` is not given.
const DATA_DIR_NAME: &str = "origin-storage";

#[derive(Parser, Debug, Clone)]
#[command(name = "storage-daemon")]
#[command(about = "Permission-gated key-value storage served over WebSocket")]
pub struct Args {
    /// Address to listen on for incoming connections
    #[arg(short, long, env = "ORIGIN_STORAGE_LISTEN", default_value = "127.0.0.1:8787")]
    pub listen: String,

    /// Directory holding the store files (supports ~ for home directory)
    #[arg(long, env = "ORIGIN_STORAGE_DATA_DIR")]
    pub data_dir: Option<String>,

    /// Allow getItem, length, key and keys
    #[arg(long, env = "ORIGIN_STORAGE_READ", default_value_t = true, action = ArgAction::Set)]
    pub read: bool,

    /// Allow setItem, removeItem and clear
    #[arg(long, env = "ORIGIN_STORAGE_WRITE", default_value_t = true, action = ArgAction::Set)]
    pub write: bool,

    /// Answer denied requests with a 'forbidden' error instead of ignoring them
    #[arg(long, env = "ORIGIN_STORAGE_REJECT_DENIED")]
    pub reject_denied: bool,

    /// Seconds to wait for a client's handshake reply
    #[arg(long, env = "ORIGIN_STORAGE_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Let store operations of one connection run concurrently
    #[arg(long, env = "ORIGIN_STORAGE_NO_SERIALIZE")]
    pub no_serialize: bool,

    /// Enable verbose logging
    #[arg(long, env = "ORIGIN_STORAGE_VERBOSE")]
    pub verbose: bool,
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen: String,
    pub data_dir: PathBuf,
    pub proxy: ProxyOptions,
}

impl DaemonConfig {
    /// Validate flags and resolve paths.
    ///
    /// Fails before anything is bound if neither read nor write is allowed.
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        AccessPolicy::new(args.read, args.write).map_err(|_| ConfigError::NoAccess)?;

        let data_dir = match &args.data_dir {
            Some(path) => expand_tilde(path),
            None => dirs::data_dir()
                .map(|dir| dir.join(DATA_DIR_NAME))
                .ok_or(ConfigError::NoDataDir)?,
        };

        let denial = if args.reject_denied {
            DenialPolicy::Reject
        } else {
            DenialPolicy::Silent
        };

        Ok(Self {
            listen: args.listen.clone(),
            data_dir,
            proxy: ProxyOptions {
                read: args.read,
                write: args.write,
                denial,
                connect_timeout: Duration::from_secs(args.connect_timeout_secs),
                serialize_operations: !args.no_serialize,
            },
        })
    }
}

/// Expand ~ or ~/ prefix to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("At least one of --read and --write must be enabled")]
    NoAccess,

    #[error("No platform data directory found; pass --data-dir")]
    NoDataDir,
}

//! storage-daemon: Serves permission-gated key-value storage over WebSocket.
//!
//! Each client connection is answered with a `connect` handshake selecting a
//! store under the data directory, after which the client may read and write
//! according to the daemon's access flags.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use storage_daemon::{Args, DaemonConfig, FileStoreFactory, ProxyServer};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,storage_daemon=debug,storage_core=debug"
    } else {
        "info,storage_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = DaemonConfig::from_args(&args)?;

    info!("Starting storage-daemon");
    info!("Data directory: {:?}", config.data_dir);
    info!(
        "Access: read={}, write={}, denial={:?}",
        config.proxy.read, config.proxy.write, config.proxy.denial
    );

    let factory = Arc::new(FileStoreFactory::new(config.data_dir.clone()));
    let server = ProxyServer::bind(&config.listen, factory, config.proxy.clone()).await?;

    info!("Daemon running. Press Ctrl+C to stop.");

    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down");
    Ok(())
}

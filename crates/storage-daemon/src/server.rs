//! WebSocket server handing each connection its own storage proxy.
//!
//! Every accepted connection gets a `WsConnection` and a `StorageProxy` with
//! the daemon's options. The proxy performs the handshake as soon as the
//! socket is up, then serves requests until the client disconnects. All
//! proxies share one `StoreFactory`, so clients selecting the same store see
//! the same data.

use crate::connection::WsConnection;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use storage_core::{AccessPolicy, ProxyOptions, StorageProxy, StoreFactory};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

/// WebSocket server serving storage proxies.
pub struct ProxyServer {
    listener: TcpListener,
    factory: Arc<dyn StoreFactory>,
    options: ProxyOptions,
    /// Counter for generating connection IDs
    next_conn_id: AtomicU64,
}

impl ProxyServer {
    /// Bind to `listen_addr`.
    ///
    /// Fails before binding if `options` grant neither read nor write access.
    pub async fn bind(
        listen_addr: &str,
        factory: Arc<dyn StoreFactory>,
        options: ProxyOptions,
    ) -> Result<Self> {
        AccessPolicy::new(options.read, options.write)?;

        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            factory,
            options,
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn run(&self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => self.accept_connection(stream, addr),
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    }

    /// Spawn a session for a new TCP connection.
    fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let conn_id = format!("conn-{}", self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let factory = self.factory.clone();
        let options = self.options.clone();

        tokio::spawn(async move {
            let ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    // Health checks (like `nc -z`) connect and immediately close
                    // without completing the WebSocket handshake.
                    let err_str = e.to_string();
                    if err_str.contains("Handshake not finished")
                        || err_str.contains("Connection reset")
                        || err_str.contains("unexpected EOF")
                    {
                        debug!("Connection closed before handshake from {}", addr);
                    } else {
                        error!("WebSocket upgrade failed for {}: {}", addr, e);
                    }
                    return;
                }
            };

            info!("New connection from {} (conn_id: {})", addr, conn_id);
            if let Err(e) = run_session(&conn_id, ws, factory, options).await {
                warn!("Session {} ended: {:#}", conn_id, e);
            }
        });
    }
}

/// Serve one connection until it closes.
async fn run_session(
    conn_id: &str,
    ws: WebSocketStream<TcpStream>,
    factory: Arc<dyn StoreFactory>,
    options: ProxyOptions,
) -> Result<()> {
    let mut conn = WsConnection::new(conn_id);
    let proxy = StorageProxy::new(conn.transport(), factory, options)?;
    conn.start(ws);

    match proxy.connect().await {
        Ok(config) => {
            let policy = proxy.policy();
            info!(
                "{} using store {}/{} (read: {}, write: {})",
                conn_id,
                config.name,
                config.store_name,
                policy.can_read(),
                policy.can_write()
            );
        }
        Err(e) => {
            conn.close().await;
            return Err(e.into());
        }
    }

    conn.closed().await;
    conn.close().await;
    info!("Connection {} closed", conn_id);
    Ok(())
}

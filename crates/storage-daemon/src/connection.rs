//! WebSocket transport for the storage protocol.
//!
//! A `WsConnection` owns an `Endpoint` and bridges it onto a WebSocket
//! stream: a read task feeds inbound messages to the endpoint as frames and a
//! write task sends the endpoint's outgoing frames as binary messages.
//!
//! Handlers must be registered on the endpoint before `start()` so that no
//! inbound request can arrive ahead of them.

use anyhow::Result;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use storage_core::protocol::MAX_MESSAGE_SIZE;
use storage_core::{Endpoint, Frame, StorageClient, StoreConfig, Transport};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, warn};

/// How long `close()` waits for the close frame to be flushed.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// A storage protocol endpoint running over one WebSocket.
pub struct WsConnection {
    /// Connection ID used in logs (e.g., "conn-1")
    id: String,
    endpoint: Endpoint,
    /// Outgoing frames, handed to the write task on `start()`
    outgoing: Option<mpsc::UnboundedReceiver<Frame>>,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

impl WsConnection {
    /// Create a connection whose endpoint is not yet attached to a socket.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let (endpoint, outgoing) = Endpoint::new(id.clone());
        Self {
            id,
            endpoint,
            outgoing: Some(outgoing),
            read_task: None,
            write_task: None,
        }
    }

    /// The endpoint as a shareable transport handle.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.endpoint.clone())
    }

    /// Attach the endpoint to `ws` and spawn the read and write tasks.
    ///
    /// Calling `start()` again has no effect.
    pub fn start<S>(&mut self, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(outgoing) = self.outgoing.take() else {
            warn!("Connection {} already started", self.id);
            return;
        };

        let (write, read) = ws.split();

        let id = self.id.clone();
        let endpoint = self.endpoint.clone();
        self.read_task = Some(tokio::spawn(async move {
            read_loop(id, read, endpoint).await;
        }));

        let id = self.id.clone();
        let endpoint = self.endpoint.clone();
        self.write_task = Some(tokio::spawn(async move {
            write_loop(id, write, outgoing, endpoint).await;
        }));
    }

    /// Wait until the remote side closes the connection.
    pub async fn closed(&mut self) {
        if let Some(task) = self.read_task.take() {
            let _ = task.await;
        }
    }

    /// Close the endpoint and send a close frame to the peer.
    pub async fn close(&mut self) {
        self.endpoint.close();

        if let Some(task) = self.write_task.take() {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, task).await.is_err() {
                debug!("Connection {} did not flush its close frame in time", self.id);
            }
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.endpoint.close();
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let Some(task) = self.write_task.take() {
            task.abort();
        }
    }
}

/// Read loop that feeds inbound frames to the endpoint.
async fn read_loop<S>(id: String, mut read: SplitStream<WebSocketStream<S>>, endpoint: Endpoint)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                let data = match msg {
                    Message::Binary(data) => data.to_vec(),
                    Message::Text(text) => text.into_bytes(),
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Close(_) => {
                        debug!("Received close frame from {}", id);
                        break;
                    }
                    Message::Frame(_) => continue,
                };

                if data.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Message from {} exceeds max size ({} > {}), dropping",
                        id,
                        data.len(),
                        MAX_MESSAGE_SIZE
                    );
                    continue;
                }

                match Frame::from_json(&data) {
                    Some(frame) => endpoint.handle_frame(frame),
                    None => warn!(
                        "Malformed message from {} ({} bytes), dropping",
                        id,
                        data.len()
                    ),
                }
            }
            Some(Err(e)) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Connection {} closed", id);
                    }
                    _ => {
                        error!("WebSocket error on {}: {}", id, e);
                    }
                }
                break;
            }
            None => {
                debug!("Connection {} stream ended", id);
                break;
            }
        }
    }

    endpoint.close();
}

/// Write loop that sends outgoing frames until the endpoint closes.
async fn write_loop<S>(
    id: String,
    mut write: SplitSink<WebSocketStream<S>, Message>,
    mut outgoing: mpsc::UnboundedReceiver<Frame>,
    endpoint: Endpoint,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = outgoing.recv().await {
        let data = match frame.to_json() {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode frame {} for {}: {}", frame.id(), id, e);
                continue;
            }
        };

        if let Err(e) = write.send(Message::Binary(data.into())).await {
            debug!("Failed to send to {}: {}", id, e);
            endpoint.close();
            return;
        }
    }

    let _ = write.close().await;
}

/// Connect to a storage daemon and answer its handshake with `config`.
///
/// Returns once the handshake has been answered. The returned connection
/// must be kept alive for as long as the client is used.
pub async fn connect_client(
    url: &str,
    config: StoreConfig,
) -> Result<(WsConnection, StorageClient)> {
    let (ws, _) = connect_async(url).await?;

    let mut conn = WsConnection::new(url);
    let client = StorageClient::new(conn.transport(), config)?;
    conn.start(ws);
    client.handshake_answered().await?;
    debug!("Handshake with {} answered", url);

    Ok((conn, client))
}

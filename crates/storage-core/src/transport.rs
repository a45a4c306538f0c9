//! Transport trait for request/response messaging with a remote peer.
//!
//! Implementations:
//! - `Endpoint` - Frame-level transport over an outgoing channel (see `channel`)
//! - `WsConnection` (in storage-daemon) - An endpoint bridged onto a WebSocket

use crate::protocol::{ErrorCode, ErrorReply, Reply};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("A handler is already registered for '{0}'")]
    DuplicateHandler(String),

    #[error("Peer rejected request: {0}")]
    Rejected(ErrorReply),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Send failed: {0}")]
    Send(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Request handler: receives the request payload and a single-use responder.
pub type Handler = Arc<dyn Fn(Value, Responder) -> BoxFuture<'static, ()> + Send + Sync>;

/// Single-use reply handle for one inbound request.
///
/// Consuming methods make a second reply impossible. Dropping the responder
/// without replying means the peer never receives an answer.
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<Reply>,
}

impl Responder {
    /// Create a responder and the receiver its reply is delivered to.
    pub fn channel() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Reply with a serializable payload.
    pub fn respond<T: Serialize>(self, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.send(Ok(value)),
            Err(e) => {
                warn!("Failed to serialize reply payload: {}", e);
                self.send(Err(ErrorReply::new(
                    ErrorCode::Storage,
                    format!("Failed to serialize reply: {}", e),
                )));
            }
        }
    }

    /// Reply with an empty acknowledgement.
    pub fn ack(self) {
        self.send(Ok(Value::Null));
    }

    /// Reply with an error.
    pub fn reject(self, error: ErrorReply) {
        self.send(Err(error));
    }

    /// Deliver an already-built reply.
    pub fn send(self, reply: Reply) {
        if self.tx.send(reply).is_err() {
            debug!("Reply discarded: transport already closed");
        }
    }
}

/// Request/response messaging with a single remote peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Register the handler for inbound requests named `name`.
    ///
    /// At most one handler per name.
    fn listen(&self, name: &str, handler: Handler) -> Result<()>;

    /// Send a request to the peer and wait for its single reply.
    ///
    /// Error replies surface as `TransportError::Rejected`.
    async fn request(&self, name: &str, payload: Value) -> Result<Value>;
}

/// Wrap an async closure as a `Handler`.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Value, Responder) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(
        move |payload: Value, responder: Responder| -> BoxFuture<'static, ()> {
            Box::pin(f(payload, responder))
        },
    )
}

/// Send a request, failing with `TransportError::Timeout` if no reply
/// arrives within `timeout`.
pub async fn request_with_timeout(
    transport: &dyn Transport,
    name: &str,
    payload: Value,
    timeout: Duration,
) -> Result<Value> {
    tokio::time::timeout(timeout, transport.request(name, payload))
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
}

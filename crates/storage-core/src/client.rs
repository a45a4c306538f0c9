//! Client side of the storage protocol.
//!
//! The client answers the proxy's `connect` handshake with its `StoreConfig`
//! and exposes typed wrappers around the storage operations. Requests that
//! the proxy denies silently never complete; set a timeout with
//! `with_timeout` to turn that into `TransportError::Timeout`.
//!
//! Operations sent after `handshake_answered()` resolves are served once the
//! proxy has opened its store.

use crate::protocol::operation::{
    GetItemResponse, IndexRequest, KeyRequest, KeyResponse, KeysResponse, LengthResponse,
    SetItemRequest,
};
use crate::protocol::{ErrorReply, Operation, CONNECT};
use crate::store::StoreConfig;
use crate::transport::{handler, request_with_timeout, Transport, TransportError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Unexpected reply to '{operation}': {source}")]
    Decode {
        operation: Operation,
        source: serde_json::Error,
    },

    #[error("Failed to encode request: {0}")]
    Encode(serde_json::Error),

    #[error("Transport closed before the proxy's handshake arrived")]
    NoHandshake,
}

impl ClientError {
    /// The proxy's error reply, if the request was rejected.
    pub fn rejection(&self) -> Option<&ErrorReply> {
        match self {
            Self::Transport(TransportError::Rejected(reply)) => Some(reply),
            _ => None,
        }
    }

    /// True if no reply arrived within the client's timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Timeout(_)))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Typed access to a remote storage proxy.
pub struct StorageClient {
    transport: Arc<dyn Transport>,
    config: StoreConfig,
    timeout: Option<Duration>,
    /// Flips to true once the handshake has been answered
    answered: watch::Receiver<bool>,
}

impl StorageClient {
    /// Create a client and register its handshake handler on `transport`.
    ///
    /// The proxy's `connect` request is answered with `config`.
    pub fn new(transport: Arc<dyn Transport>, config: StoreConfig) -> Result<Self> {
        let reply = serde_json::to_value(&config).map_err(ClientError::Encode)?;
        let (answered_tx, answered) = watch::channel(false);
        let answered_tx = Arc::new(answered_tx);
        transport.listen(
            CONNECT,
            handler(move |_, responder| {
                let reply = reply.clone();
                let answered_tx = answered_tx.clone();
                async move {
                    debug!("Answering storage handshake");
                    responder.send(Ok(reply));
                    answered_tx.send_replace(true);
                }
            }),
        )?;

        Ok(Self {
            transport,
            config,
            timeout: None,
            answered,
        })
    }

    /// Wait until the proxy's `connect` request has been answered.
    ///
    /// Fails with `ClientError::NoHandshake` if the transport closes first.
    pub async fn handshake_answered(&self) -> Result<()> {
        let mut answered = self.answered.clone();
        answered
            .wait_for(|done| *done)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::NoHandshake)
    }

    /// Fail requests that get no reply within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn send(&self, op: Operation, payload: Value) -> Result<Value> {
        let reply = match self.timeout {
            Some(timeout) => {
                request_with_timeout(self.transport.as_ref(), op.name(), payload, timeout).await?
            }
            None => self.transport.request(op.name(), payload).await?,
        };
        Ok(reply)
    }

    async fn call<T: DeserializeOwned>(&self, op: Operation, payload: Value) -> Result<T> {
        let reply = self.send(op, payload).await?;
        serde_json::from_value(reply).map_err(|source| ClientError::Decode {
            operation: op,
            source,
        })
    }

    fn encode<T: Serialize>(payload: T) -> Result<Value> {
        serde_json::to_value(payload).map_err(ClientError::Encode)
    }

    pub async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        let payload = Self::encode(KeyRequest {
            key: key.to_string(),
        })?;
        let reply: GetItemResponse = self.call(Operation::GetItem, payload).await?;
        Ok(reply.value)
    }

    pub async fn set_item<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(ClientError::Encode)?;
        let payload = Self::encode(SetItemRequest {
            key: key.to_string(),
            value,
        })?;
        self.send(Operation::SetItem, payload).await?;
        Ok(())
    }

    pub async fn remove_item(&self, key: &str) -> Result<()> {
        let payload = Self::encode(KeyRequest {
            key: key.to_string(),
        })?;
        self.send(Operation::RemoveItem, payload).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.send(Operation::Clear, Value::Null).await?;
        Ok(())
    }

    pub async fn length(&self) -> Result<usize> {
        let reply: LengthResponse = self.call(Operation::Length, Value::Null).await?;
        Ok(reply.length)
    }

    pub async fn key(&self, index: i64) -> Result<Option<String>> {
        let payload = Self::encode(IndexRequest {
            index: index.into(),
        })?;
        let reply: KeyResponse = self.call(Operation::Key, payload).await?;
        Ok(reply.key)
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        let reply: KeysResponse = self.call(Operation::Keys, Value::Null).await?;
        Ok(reply.keys)
    }
}

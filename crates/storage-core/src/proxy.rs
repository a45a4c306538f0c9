//! The storage proxy: handshake, permission gate and operation dispatch.
//!
//! A `StorageProxy` registers one handler per storage operation on its
//! transport when constructed. `connect()` then asks the remote client which
//! store to use and opens it through the `StoreFactory`. From then on every
//! inbound operation is checked against the access policy, executed against
//! the store and answered exactly once. Denied operations are answered
//! according to the `DenialPolicy`.

use crate::access::{AccessError, AccessPolicy, DenialPolicy};
use crate::protocol::operation::{
    GetItemResponse, IndexRequest, KeyRequest, KeyResponse, KeysResponse, LengthResponse,
    SetItemRequest,
};
use crate::protocol::{ErrorCode, ErrorReply, Operation, CONNECT};
use crate::store::{KeyValueStore, StoreConfig, StoreError, StoreFactory};
use crate::transport::{
    handler, request_with_timeout, Handler, Responder, Transport, TransportError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Default time to wait for the client's handshake reply.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("The storage proxy does not have any read/write access")]
    Configuration(#[from] AccessError),

    #[error("Handshake failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to open store: {0}")]
    Storage(#[from] StoreError),

    #[error("The storage proxy is already connected")]
    AlreadyConnected,
}

/// Construction options for a `StorageProxy`.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Enables getItem, length, key and keys
    pub read: bool,
    /// Enables setItem, removeItem and clear
    pub write: bool,
    /// How denied requests are answered
    pub denial: DenialPolicy,
    /// Upper bound on the handshake exchange
    pub connect_timeout: Duration,
    /// Run store calls one at a time, in arrival order
    pub serialize_operations: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
            denial: DenialPolicy::Silent,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            serialize_operations: true,
        }
    }
}

impl ProxyOptions {
    pub fn read_only() -> Self {
        Self {
            write: false,
            ..Self::default()
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            ..Self::default()
        }
    }
}

/// Failure of a single operation, reported back to its caller.
#[derive(Debug, Error)]
enum OperationError {
    #[error("Invalid '{operation}' request: {source}")]
    BadRequest {
        operation: Operation,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<OperationError> for ErrorReply {
    fn from(err: OperationError) -> Self {
        let code = match err {
            OperationError::BadRequest { .. } => ErrorCode::BadRequest,
            OperationError::Storage(_) => ErrorCode::Storage,
        };
        ErrorReply::new(code, err.to_string())
    }
}

/// Handshake progress, observed by handlers.
#[derive(Clone)]
enum ConnectState {
    Idle,
    Connecting,
    Connected(Arc<dyn KeyValueStore>),
}

struct ProxyInner {
    policy: AccessPolicy,
    denial: DenialPolicy,
    connect_timeout: Duration,
    transport: Arc<dyn Transport>,
    factory: Arc<dyn StoreFactory>,
    state: watch::Sender<ConnectState>,
}

/// An admitted request waiting for its store call.
struct Job {
    op: Operation,
    payload: Value,
    responder: Responder,
}

/// Returns the proxy to `Idle` if a handshake ends without connecting,
/// including when the `connect()` future is dropped.
struct ConnectingGuard<'a>(&'a watch::Sender<ConnectState>);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.send_if_modified(|state| match state {
            ConnectState::Connecting => {
                *state = ConnectState::Idle;
                true
            }
            _ => false,
        });
    }
}

/// Permission-gated proxy exposing a key-value store over a transport.
#[derive(Clone)]
pub struct StorageProxy {
    inner: Arc<ProxyInner>,
}

impl StorageProxy {
    /// Build a proxy and register its operation handlers on `transport`.
    ///
    /// Fails with `ProxyError::Configuration` before touching the transport
    /// if neither read nor write access is granted. With
    /// `serialize_operations` set, this spawns the worker that runs store
    /// calls in arrival order, so it must be called within a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        factory: Arc<dyn StoreFactory>,
        options: ProxyOptions,
    ) -> Result<Self, ProxyError> {
        let policy = AccessPolicy::new(options.read, options.write)?;
        let (state, _) = watch::channel(ConnectState::Idle);

        let proxy = Self {
            inner: Arc::new(ProxyInner {
                policy,
                denial: options.denial,
                connect_timeout: options.connect_timeout,
                transport,
                factory,
                state,
            }),
        };

        let (queue, jobs) = if options.serialize_operations {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        for op in Operation::ALL {
            proxy
                .inner
                .transport
                .listen(op.name(), proxy.handler_for(op, queue.clone()))?;
        }

        // The worker exits once the handlers (and their senders) are gone
        drop(queue);
        if let Some(jobs) = jobs {
            tokio::spawn(drain(Arc::clone(&proxy.inner), jobs));
        }

        debug!(
            "Storage proxy registered (read: {}, write: {}, denial: {:?})",
            policy.can_read(),
            policy.can_write(),
            options.denial
        );
        Ok(proxy)
    }

    pub fn policy(&self) -> AccessPolicy {
        self.inner.policy
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.inner.state.borrow(), ConnectState::Connected(_))
    }

    /// Perform the handshake and open the backing store.
    ///
    /// Sends a single `connect` request and waits up to the configured
    /// timeout for the client's `StoreConfig`. Operations arriving meanwhile
    /// wait for the outcome. On failure the proxy stays unconnected and
    /// `connect()` may be retried.
    pub async fn connect(&self) -> Result<StoreConfig, ProxyError> {
        let claimed = self.inner.state.send_if_modified(|state| match state {
            ConnectState::Idle => {
                *state = ConnectState::Connecting;
                true
            }
            _ => false,
        });
        if !claimed {
            return Err(ProxyError::AlreadyConnected);
        }

        let _connecting = ConnectingGuard(&self.inner.state);
        let (config, store) = self.handshake().await?;
        self.inner.state.send_replace(ConnectState::Connected(store));
        info!(
            "Storage proxy connected to {}/{}",
            config.name, config.store_name
        );
        Ok(config)
    }

    async fn handshake(&self) -> Result<(StoreConfig, Arc<dyn KeyValueStore>), ProxyError> {
        let reply = request_with_timeout(
            self.inner.transport.as_ref(),
            CONNECT,
            Value::Null,
            self.inner.connect_timeout,
        )
        .await?;

        let config = StoreConfig::from_reply(reply)
            .map_err(|e| TransportError::Malformed(format!("Invalid store config: {}", e)))?;
        let store = self.inner.factory.open(&config).await?;
        Ok((config, store))
    }

    /// Gate and queue each request as it arrives; with a `queue`, the
    /// returned future has nothing left to do.
    fn handler_for(&self, op: Operation, queue: Option<mpsc::UnboundedSender<Job>>) -> Handler {
        let inner = Arc::clone(&self.inner);
        handler(move |payload, responder| {
            let mut direct = inner.admit(op, payload, responder);
            if let Some(queue) = &queue {
                if let Some(job) = direct.take() {
                    if queue.send(job).is_err() {
                        debug!("'{}' arrived after the proxy stopped, dropping", op);
                    }
                }
            }

            let inner = Arc::clone(&inner);
            async move {
                if let Some(job) = direct {
                    inner.run(job).await;
                }
            }
        })
    }
}

/// Run queued store calls one at a time, in the order they were admitted.
async fn drain(inner: Arc<ProxyInner>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        inner.run(job).await;
    }
    debug!("Storage proxy queue closed");
}

impl ProxyInner {
    /// Apply the permission gate. Denied requests are answered (or dropped)
    /// here and yield no job.
    fn admit(&self, op: Operation, payload: Value, responder: Responder) -> Option<Job> {
        if !self.policy.allows(op.access()) {
            match self.denial {
                DenialPolicy::Silent => {
                    debug!("Denied '{}' ({:?} access), not replying", op, op.access());
                    drop(responder);
                }
                DenialPolicy::Reject => {
                    debug!("Denied '{}' ({:?} access), rejecting", op, op.access());
                    responder.reject(ErrorReply::forbidden(op.name()));
                }
            }
            return None;
        }
        Some(Job {
            op,
            payload,
            responder,
        })
    }

    async fn run(&self, job: Job) {
        let Job {
            op,
            payload,
            responder,
        } = job;

        let Some(store) = self.store().await else {
            debug!("'{}' received while not connected", op);
            responder.reject(ErrorReply::not_connected());
            return;
        };

        match execute(op, store.as_ref(), payload).await {
            Ok(reply) => responder.send(Ok(reply)),
            Err(err) => {
                warn!("'{}' failed: {}", op, err);
                responder.reject(err.into());
            }
        }
    }

    /// The open store, waiting out a handshake still in flight.
    async fn store(&self) -> Option<Arc<dyn KeyValueStore>> {
        let mut state = self.state.subscribe();
        loop {
            match &*state.borrow_and_update() {
                ConnectState::Connected(store) => return Some(store.clone()),
                ConnectState::Idle => return None,
                ConnectState::Connecting => {}
            }
            if state.changed().await.is_err() {
                return None;
            }
        }
    }
}

fn parse<T: DeserializeOwned>(op: Operation, payload: Value) -> Result<T, OperationError> {
    serde_json::from_value(payload).map_err(|source| OperationError::BadRequest {
        operation: op,
        source,
    })
}

fn encode<T: Serialize>(payload: T) -> Result<Value, OperationError> {
    serde_json::to_value(payload).map_err(|e| StoreError::Serialization(e.to_string()).into())
}

/// Run one operation against the store and build its reply payload.
async fn execute(
    op: Operation,
    store: &dyn KeyValueStore,
    payload: Value,
) -> Result<Value, OperationError> {
    match op {
        Operation::GetItem => {
            let req: KeyRequest = parse(op, payload)?;
            let value = store.get(&req.key).await?;
            encode(GetItemResponse { value })
        }
        Operation::SetItem => {
            let req: SetItemRequest = parse(op, payload)?;
            store.set(&req.key, req.value).await?;
            Ok(Value::Null)
        }
        Operation::RemoveItem => {
            let req: KeyRequest = parse(op, payload)?;
            store.remove(&req.key).await?;
            Ok(Value::Null)
        }
        Operation::Clear => {
            store.clear().await?;
            Ok(Value::Null)
        }
        Operation::Length => {
            let length = store.count().await?;
            encode(LengthResponse { length })
        }
        Operation::Key => {
            let req: IndexRequest = parse(op, payload)?;
            let key = match req.index.position() {
                Some(index) => store.key_at(index).await?,
                None => None,
            };
            encode(KeyResponse { key })
        }
        Operation::Keys => {
            let keys = store.keys().await?;
            encode(KeysResponse { keys })
        }
    }
}

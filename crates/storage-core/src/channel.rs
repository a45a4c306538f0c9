//! Frame-level transport endpoint.
//!
//! An `Endpoint` implements `Transport` on top of protocol frames. Outbound
//! frames go to an unbounded channel that the owner drains onto the wire.
//! Inbound frames are fed in with `handle_frame` (or `run`). Handlers are
//! called in frame order; the future each returns runs on its own task, so
//! several requests can be in flight at once.
//!
//! `pair()` wires two endpoints back to back in-process.

use crate::protocol::{frame::into_reply, ErrorReply, Frame, Reply};
use crate::transport::{Handler, Responder, Result, Transport, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    /// Name used in logs (e.g., "conn-3", "client")
    label: String,
    handlers: RwLock<HashMap<String, Handler>>,
    /// Outstanding outbound requests by id
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    /// Taken on close so the peer's read side sees end-of-stream
    outgoing: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Transport endpoint speaking the frame protocol.
///
/// Cheap to clone; clones share state. Call `close()` to tear down: it fails
/// pending requests, drops registered handlers and ends the outbound stream.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

/// Removes a pending request slot when the request future finishes or is dropped.
struct PendingSlot<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(&self.id);
    }
}

impl Endpoint {
    /// Create an endpoint and the receiver its outbound frames are written to.
    pub fn new(label: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = Self {
            inner: Arc::new(Inner {
                label: label.into(),
                handlers: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                outgoing: Mutex::new(Some(tx)),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        };
        (endpoint, rx)
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of outbound requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Process one inbound frame.
    pub fn handle_frame(&self, frame: Frame) {
        if self.is_closed() {
            debug!("{}: dropping frame {} after close", self.label(), frame.id());
            return;
        }

        match frame {
            Frame::Request { id, name, payload } => self.dispatch(id, name, payload),
            Frame::Response { id, payload, error } => {
                let waiter = lock(&self.inner.pending).remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(into_reply(payload, error));
                    }
                    None => debug!("{}: response for unknown request {}", self.label(), id),
                }
            }
        }
    }

    /// Feed frames from `incoming` until it ends, then close.
    pub async fn run(&self, mut incoming: mpsc::UnboundedReceiver<Frame>) {
        while let Some(frame) = incoming.recv().await {
            self.handle_frame(frame);
        }
        debug!("{}: inbound stream ended", self.label());
        self.close();
    }

    /// Close the endpoint.
    ///
    /// Pending requests fail with `TransportError::Closed`. Replies produced
    /// by handlers still running are discarded.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let pending: Vec<_> = lock(&self.inner.pending).drain().collect();
        if !pending.is_empty() {
            debug!(
                "{}: failing {} pending request(s) on close",
                self.label(),
                pending.len()
            );
        }
        drop(pending);

        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        lock(&self.inner.outgoing).take();
    }

    fn send_frame(&self, frame: Frame) -> bool {
        if self.is_closed() {
            return false;
        }
        match lock(&self.inner.outgoing).as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn dispatch(&self, id: u64, name: String, payload: Value) {
        let handler = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned();

        let Some(handler) = handler else {
            warn!("{}: no handler for request '{}'", self.label(), name);
            self.send_frame(Frame::response(id, Err(ErrorReply::unknown_request(&name))));
            return;
        };

        // The handler is called here, in frame order; only its future is spawned
        let (responder, rx) = Responder::channel();
        let serving = handler(payload, responder);

        let endpoint = self.clone();
        tokio::spawn(async move {
            serving.await;

            match rx.await {
                Ok(reply) => {
                    if !endpoint.send_frame(Frame::response(id, reply)) {
                        debug!(
                            "{}: reply to {} ({}) discarded, endpoint closed",
                            endpoint.label(),
                            id,
                            name
                        );
                    }
                }
                Err(_) => {
                    debug!(
                        "{}: request {} ({}) finished without a reply",
                        endpoint.label(),
                        id,
                        name
                    );
                }
            }
        });
    }
}

#[async_trait]
impl Transport for Endpoint {
    fn listen(&self, name: &str, handler: Handler) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(name) {
            return Err(TransportError::DuplicateHandler(name.to_string()));
        }
        handlers.insert(name.to_string(), handler);
        Ok(())
    }

    async fn request(&self, name: &str, payload: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id, tx);
        let _slot = PendingSlot {
            inner: &self.inner,
            id,
        };

        debug!("{}: sending request {} ({})", self.label(), id, name);
        if !self.send_frame(Frame::request(id, name, payload)) {
            return Err(TransportError::Closed);
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(TransportError::Rejected(error)),
            Err(_) => Err(TransportError::Closed),
        }
    }
}

/// Create two in-process endpoints connected back to back.
///
/// Must be called within a tokio runtime. Closing either side closes both.
pub fn pair(a_label: &str, b_label: &str) -> (Endpoint, Endpoint) {
    let (a, a_outgoing) = Endpoint::new(a_label);
    let (b, b_outgoing) = Endpoint::new(b_label);

    let b_task = b.clone();
    tokio::spawn(async move { b_task.run(a_outgoing).await });
    let a_task = a.clone();
    tokio::spawn(async move { a_task.run(b_outgoing).await });

    (a, b)
}

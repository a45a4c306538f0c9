//! End-to-end tests for storage-daemon.
//!
//! Runs the real server on a random port and drives it over WebSocket, both
//! through `StorageClient` and with hand-written protocol frames.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use storage_core::{DenialPolicy, ErrorCode, ProxyOptions, StoreConfig};
use storage_daemon::{connect_client, FileStoreFactory, ProxyServer, WsConnection};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// How long to wait before concluding a request will never be answered.
const NO_REPLY: Duration = Duration::from_millis(300);

// ============================================================================
// Helpers
// ============================================================================

/// Start a server on a random port, storing files under `data_dir`.
async fn start_server(data_dir: &Path, options: ProxyOptions) -> SocketAddr {
    let factory = Arc::new(FileStoreFactory::new(data_dir));
    let server = ProxyServer::bind("127.0.0.1:0", factory, options)
        .await
        .expect("Failed to bind server");
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.run().await });
    addr
}

async fn open_client(
    addr: SocketAddr,
    config: StoreConfig,
) -> (WsConnection, storage_core::StorageClient) {
    let (conn, client) = timeout(
        Duration::from_secs(5),
        connect_client(&format!("ws://{}", addr), config),
    )
    .await
    .expect("Timed out connecting")
    .expect("Failed to connect");
    (conn, client.with_timeout(NO_REPLY))
}

/// Test client speaking raw protocol frames.
struct RawClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawClient {
    async fn connect(addr: SocketAddr) -> Self {
        let url = format!("ws://{}", addr);
        let (ws, _) = connect_async(&url).await.expect("Failed to connect");
        Self { ws }
    }

    /// Receive the next message as JSON, or None if the connection closed.
    async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return Some(serde_json::from_slice(&data).expect("Invalid JSON frame"))
                }
                Some(Ok(Message::Text(text))) => {
                    return Some(serde_json::from_str(&text).expect("Invalid JSON frame"))
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                _ => continue,
            }
        }
    }

    async fn expect_frame(&mut self) -> Value {
        timeout(Duration::from_secs(5), self.recv())
            .await
            .expect("Timeout waiting for frame")
            .expect("Connection closed unexpectedly")
    }

    async fn send_text(&mut self, text: String) {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .expect("Failed to send message");
    }

    async fn send_json(&mut self, frame: Value) {
        self.send_text(frame.to_string()).await;
    }

    /// Answer the server's handshake with `config`.
    async fn handshake(&mut self, config: Value) {
        let connect = self.expect_frame().await;
        assert_eq!(connect["type"], "request");
        assert_eq!(connect["name"], "connect");
        let id = connect["id"].clone();

        self.send_json(json!({ "type": "response", "id": id, "payload": config }))
            .await;
    }

    /// Send a request and wait for its response.
    async fn call(&mut self, id: u64, name: &str, payload: Value) -> Value {
        self.send_json(json!({ "type": "request", "id": id, "name": name, "payload": payload }))
            .await;
        let response = self.expect_frame().await;
        assert_eq!(response["type"], "response");
        assert_eq!(response["id"], id);
        response
    }
}

// ============================================================================
// Client round trips
// ============================================================================

#[tokio::test]
async fn test_read_write_over_websocket() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(dir.path(), ProxyOptions::default()).await;
    let (_conn, client) = open_client(addr, StoreConfig::store("ns1")).await;

    client.set_item("a", 1).await.unwrap();
    assert_eq!(client.get_item("a").await.unwrap(), Some(json!(1)));
    assert_eq!(client.length().await.unwrap(), 1);
    assert_eq!(client.keys().await.unwrap(), vec!["a"]);

    client.remove_item("a").await.unwrap();
    assert_eq!(client.get_item("a").await.unwrap(), None);
}

#[tokio::test]
async fn test_writes_land_in_store_file() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(dir.path(), ProxyOptions::default()).await;
    let (_conn, client) = open_client(addr, StoreConfig::new("app", "prefs")).await;

    client.set_item("theme", "dark").await.unwrap();

    let path = dir.path().join("app").join("prefs.json");
    let written: Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
    assert_eq!(written, json!({ "version": 1, "entries": { "theme": "dark" } }));
}

#[tokio::test]
async fn test_data_survives_server_restart() {
    let dir = TempDir::new().unwrap();

    let first = start_server(dir.path(), ProxyOptions::default()).await;
    let (conn, writer) = open_client(first, StoreConfig::store("durable")).await;
    writer.set_item("k", json!({ "n": 7 })).await.unwrap();
    drop(writer);
    drop(conn);

    let second = start_server(dir.path(), ProxyOptions::read_only()).await;
    let (_conn, reader) = open_client(second, StoreConfig::store("durable")).await;
    assert_eq!(reader.get_item("k").await.unwrap(), Some(json!({ "n": 7 })));
}

#[tokio::test]
async fn test_clients_share_stores_by_config() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(dir.path(), ProxyOptions::default()).await;

    let (_a_conn, a) = open_client(addr, StoreConfig::store("shared")).await;
    let (_b_conn, b) = open_client(addr, StoreConfig::store("shared")).await;
    let (_c_conn, c) = open_client(addr, StoreConfig::store("private")).await;

    a.set_item("k", "from a").await.unwrap();
    assert_eq!(b.get_item("k").await.unwrap(), Some(json!("from a")));
    assert_eq!(c.get_item("k").await.unwrap(), None);
}

// ============================================================================
// Permission gate
// ============================================================================

#[tokio::test]
async fn test_write_only_daemon_ignores_reads() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(dir.path(), ProxyOptions::write_only()).await;
    let (_conn, client) = open_client(addr, StoreConfig::store("ns1")).await;

    client.set_item("x", 5).await.unwrap();
    assert!(client.get_item("x").await.unwrap_err().is_timeout());
    assert!(client.keys().await.unwrap_err().is_timeout());
}

#[tokio::test]
async fn test_read_only_daemon_rejects_writes_when_configured() {
    let dir = TempDir::new().unwrap();
    let options = ProxyOptions {
        denial: DenialPolicy::Reject,
        ..ProxyOptions::read_only()
    };
    let addr = start_server(dir.path(), options).await;
    let (_conn, client) = open_client(addr, StoreConfig::store("ns1")).await;

    let err = client.set_item("x", 5).await.unwrap_err();
    assert_eq!(err.rejection().unwrap().code, ErrorCode::Forbidden);
    assert_eq!(client.length().await.unwrap(), 0);
}

#[tokio::test]
async fn test_bind_rejects_no_access() {
    let dir = TempDir::new().unwrap();
    let options = ProxyOptions {
        read: false,
        write: false,
        ..ProxyOptions::default()
    };
    let factory = Arc::new(FileStoreFactory::new(dir.path()));
    assert!(ProxyServer::bind("127.0.0.1:0", factory, options).await.is_err());
}

// ============================================================================
// Wire protocol
// ============================================================================

#[tokio::test]
async fn test_raw_protocol_frames() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(dir.path(), ProxyOptions::default()).await;
    let mut raw = RawClient::connect(addr).await;

    raw.handshake(json!({ "store": "raw" })).await;

    let ack = raw.call(7, "setItem", json!({ "key": "k", "value": [1] })).await;
    assert_eq!(ack, json!({ "type": "response", "id": 7 }));

    let got = raw.call(8, "getItem", json!({ "key": "k" })).await;
    assert_eq!(got["payload"], json!({ "value": [1] }));

    let missing = raw.call(9, "key", json!({ "index": 5 })).await;
    assert_eq!(missing["payload"], json!({ "key": null }));

    let huge = raw.call(12, "key", json!({ "index": 9223372036854775808u64 })).await;
    assert_eq!(huge["payload"], json!({ "key": null }));

    let unknown = raw.call(10, "frobnicate", Value::Null).await;
    assert_eq!(unknown["error"]["code"], "unknownRequest");

    let bad = raw.call(11, "getItem", json!({ "nokey": true })).await;
    assert_eq!(bad["error"]["code"], "badRequest");

    assert!(dir.path().join("localforage").join("raw.json").exists());
}

#[tokio::test]
async fn test_malformed_messages_are_dropped() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(dir.path(), ProxyOptions::default()).await;
    let mut raw = RawClient::connect(addr).await;
    raw.handshake(Value::Null).await;

    raw.send_text("not json at all".to_string()).await;
    raw.send_json(json!({ "type": "gossip", "id": 1 })).await;

    // The connection keeps working
    let length = raw.call(2, "length", Value::Null).await;
    assert_eq!(length["payload"], json!({ "length": 0 }));
}

#[tokio::test]
async fn test_unanswered_handshake_closes_connection() {
    let dir = TempDir::new().unwrap();
    let options = ProxyOptions {
        connect_timeout: Duration::from_millis(200),
        ..ProxyOptions::default()
    };
    let addr = start_server(dir.path(), options).await;
    let mut raw = RawClient::connect(addr).await;

    let connect = raw.expect_frame().await;
    assert_eq!(connect["name"], "connect");

    // Never answer: the server gives up and closes the socket
    let next = timeout(Duration::from_secs(5), raw.recv())
        .await
        .expect("Server did not close the connection");
    assert!(next.is_none(), "unexpected frame: {next:?}");
}

#[tokio::test]
async fn test_invalid_store_name_closes_connection() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(dir.path(), ProxyOptions::default()).await;
    let mut raw = RawClient::connect(addr).await;

    raw.handshake(json!({ "name": "..", "storeName": "escape" })).await;

    let next = timeout(Duration::from_secs(5), raw.recv())
        .await
        .expect("Server did not close the connection");
    assert!(next.is_none(), "unexpected frame: {next:?}");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for relay integration tests.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chat_relay::config::RelayConfig;
use chat_relay::metrics::RelayMetrics;
use chat_relay::server::Relay;
use chat_relay::store::{MemoryMessageStore, MessageStore, StorageBackend, UserProfile};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A relay serving on an ephemeral port. Stops accepting when dropped.
#[allow(dead_code)]
pub struct TestRelay {
    pub url: String,
    pub relay: Arc<Relay>,
    pub store: Arc<MemoryMessageStore>,
    pub metrics: RelayMetrics,
    shutdown: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TestRelay {
    /// Triggers shutdown of the accept loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Whether `user_id` currently has a registry entry.
    pub fn is_online(&self, user_id: &str) -> bool {
        self.relay.lifecycle().registry().lookup(user_id).is_some()
    }

    /// Polls until `user_id` has left the registry, or gives up after 2s.
    pub async fn wait_offline(&self, user_id: &str) -> bool {
        for _ in 0..100 {
            if !self.is_online(user_id) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds a profile for a test user.
#[allow(dead_code)]
pub fn test_user(id: &str) -> UserProfile {
    UserProfile {
        id: id.to_string(),
        name: Some(format!("User {}", id)),
        email: format!("{}@example.com", id),
        image: None,
    }
}

/// Creates an in-memory store with the given users.
#[allow(dead_code)]
pub fn create_test_store_with_users(user_ids: &[&str]) -> Arc<MemoryMessageStore> {
    let store = Arc::new(MemoryMessageStore::new());
    for id in user_ids {
        store.upsert_user(&test_user(id)).unwrap();
    }
    store
}

/// Default configuration for tests: in-memory storage, small limits.
#[allow(dead_code)]
pub fn test_config() -> RelayConfig {
    RelayConfig {
        max_connections: 100,
        max_message_size: 4096,
        storage_backend: StorageBackend::Memory,
        ..RelayConfig::default()
    }
}

/// Starts a relay on 127.0.0.1:0.
#[allow(dead_code)]
pub async fn start_relay(config: RelayConfig, store: Arc<MemoryMessageStore>) -> TestRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://127.0.0.1:{}{}", addr.port(), config.ws_path);

    let metrics = RelayMetrics::new();
    let relay = Arc::new(Relay::new(
        &config,
        store.clone() as Arc<dyn MessageStore>,
        metrics.clone(),
    ));

    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(relay.clone().serve(listener, async move {
        let _ = rx.await;
    }));

    TestRelay {
        url,
        relay,
        store,
        metrics,
        shutdown: Some(tx),
    }
}

/// Starts a relay with default test config and the given users.
#[allow(dead_code)]
pub async fn start_default_relay(user_ids: &[&str]) -> TestRelay {
    start_relay(test_config(), create_test_store_with_users(user_ids)).await
}

#[allow(dead_code)]
pub async fn connect(url: &str) -> WsClient {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Sends a JSON value as a text frame.
#[allow(dead_code)]
pub async fn send_json(ws: &mut WsClient, value: &Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Receives the next text message as JSON.
#[allow(dead_code)]
pub async fn recv(ws: &mut WsClient) -> Value {
    let msg = timeout(Duration::from_secs(3), ws.next())
        .await
        .expect("Timeout waiting for message")
        .expect("Stream ended")
        .expect("WebSocket error");

    match msg {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("Expected Text message, got {:?}", other),
    }
}

/// Tries to receive a text message with a short timeout.
#[allow(dead_code)]
pub async fn try_recv(ws: &mut WsClient) -> Option<Value> {
    match timeout(Duration::from_millis(200), ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str(&text).ok(),
        _ => None,
    }
}

/// Connects, authenticates as `user_id` and consumes the `auth_success` reply.
#[allow(dead_code)]
pub async fn connect_as(url: &str, user_id: &str) -> WsClient {
    let mut ws = connect(url).await;
    let ack = authenticate(&mut ws, user_id).await;
    assert_eq!(ack["type"], "auth_success");
    ws
}

#[allow(dead_code)]
pub async fn authenticate(ws: &mut WsClient, user_id: &str) -> Value {
    send_json(ws, &json!({ "type": "auth", "userId": user_id })).await;
    recv(ws).await
}

#[allow(dead_code)]
pub fn chat_message(receiver_id: &str, content: &str) -> Value {
    json!({ "type": "message", "receiverId": receiver_id, "content": content })
}

#[allow(dead_code)]
pub fn typing(receiver_id: &str) -> Value {
    json!({ "type": "typing", "receiverId": receiver_id })
}

#[allow(dead_code)]
pub fn read_receipt(message_id: &str, sender_id: &str) -> Value {
    json!({ "type": "read", "messageId": message_id, "senderId": sender_id })
}

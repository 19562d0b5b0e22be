// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for relay integration tests.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures_util::StreamExt;
use ring::hmac;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chat_relay::auth::Hs256Authenticator;
use chat_relay::clock::ManualClock;
use chat_relay::connection_limit::ConnectionLimiter;
use chat_relay::connection_registry::ConnectionRegistry;
use chat_relay::handler::SessionDeps;
use chat_relay::message::UserId;
use chat_relay::message_log::MemoryMessageLog;
use chat_relay::metrics::RelayMetrics;
use chat_relay::offline_queue::{MemoryOfflineQueue, DEFAULT_OFFLINE_TTL};
use chat_relay::router::{DeliveryPolicy, MessageRouter};
use chat_relay::server::{self, ServerState};

#[allow(dead_code)]
pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[allow(dead_code)]
pub const TEST_SECRET: &[u8] = b"integration-test-secret";
#[allow(dead_code)]
pub const START_SECS: u64 = 1_700_000_000;

/// Knobs for a test relay.
#[allow(dead_code)]
pub struct TestOptions {
    pub policy: DeliveryPolicy,
    pub max_connections: usize,
    pub max_message_size: usize,
    pub session_buffer: usize,
    pub idle_timeout: Option<Duration>,
    pub delivery_timeout: Duration,
}

impl Default for TestOptions {
    fn default() -> Self {
        TestOptions {
            policy: DeliveryPolicy::LiveOnly,
            max_connections: 100,
            max_message_size: 64 * 1024,
            session_buffer: 64,
            idle_timeout: None,
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

/// A relay running on an ephemeral port with in-memory storage.
///
/// The accept loop stops when this is dropped.
#[allow(dead_code)]
pub struct TestRelay {
    pub url: String,
    pub registry: Arc<ConnectionRegistry>,
    pub queue: Arc<MemoryOfflineQueue>,
    pub log: Arc<MemoryMessageLog>,
    pub clock: Arc<ManualClock>,
    pub metrics: RelayMetrics,
    _shutdown: oneshot::Sender<()>,
}

/// Starts a relay bound to 127.0.0.1:0.
#[allow(dead_code)]
pub async fn start_relay(options: TestOptions) -> TestRelay {
    let clock = Arc::new(ManualClock::new(START_SECS));
    let registry = Arc::new(ConnectionRegistry::new());
    let queue = Arc::new(MemoryOfflineQueue::new(DEFAULT_OFFLINE_TTL, clock.clone()));
    let log = Arc::new(MemoryMessageLog::new());
    let metrics = RelayMetrics::new();

    let router = Arc::new(MessageRouter::new(
        log.clone(),
        queue.clone(),
        registry.clone(),
        clock.clone(),
        options.policy,
        metrics.clone(),
    )
    .with_delivery_timeout(options.delivery_timeout));

    let state = ServerState {
        session: SessionDeps {
            router,
            registry: registry.clone(),
            queue: queue.clone(),
            metrics: metrics.clone(),
            max_message_size: options.max_message_size,
            idle_timeout: options.idle_timeout,
            session_buffer: options.session_buffer,
        },
        authenticator: Arc::new(Hs256Authenticator::new(TEST_SECRET, clock.clone())),
        limiter: ConnectionLimiter::new(options.max_connections),
        handshake_timeout: Duration::from_secs(5),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(server::serve(listener, state, async {
        let _ = shutdown_rx.await;
    }));

    TestRelay {
        url: format!("ws://127.0.0.1:{}/ws", addr.port()),
        registry,
        queue,
        log,
        clock,
        metrics,
        _shutdown: shutdown_tx,
    }
}

/// Signs an HS256 token with arbitrary claims.
#[allow(dead_code)]
pub fn sign_token(claims: &Value, secret: &[u8]) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    let input = format!("{}.{}", header, payload);
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, input.as_bytes());
    format!("{}.{}", input, URL_SAFE_NO_PAD.encode(tag.as_ref()))
}

/// Returns a valid token for `user_id`.
#[allow(dead_code)]
pub fn token_for(user_id: UserId) -> String {
    sign_token(&serde_json::json!({ "user_id": user_id }), TEST_SECRET)
}

/// Opens a WebSocket with the token in the Authorization header.
#[allow(dead_code)]
pub async fn connect_with_token(url: &str, token: &str) -> Result<ClientStream, WsError> {
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert("Authorization", format!("Bearer {}", token).parse().unwrap());
    connect_async(request).await.map(|(ws, _)| ws)
}

/// Connects as `user_id` and waits until the relay has registered the session.
#[allow(dead_code)]
pub async fn connect_user(relay: &TestRelay, user_id: UserId) -> ClientStream {
    let sessions_before = relay.metrics.connections_total.get();
    let ws = connect_with_token(&relay.url, &token_for(user_id))
        .await
        .expect("Failed to connect");
    wait_until(|| relay.metrics.connections_total.get() > sessions_before).await;
    ws
}

/// Polls `condition` until it holds, panicking after three seconds.
#[allow(dead_code)]
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let waited = timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "Condition not reached in time");
}

/// Receives the next text frame as JSON.
#[allow(dead_code)]
pub async fn recv_json(ws: &mut ClientStream) -> Value {
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

/// Try to receive a message with a short timeout. Returns None if nothing arrives.
#[allow(dead_code)]
pub async fn try_recv_json(ws: &mut ClientStream) -> Option<Value> {
    match timeout(Duration::from_millis(200), ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => Some(serde_json::from_str(&text).unwrap()),
        _ => None,
    }
}

/// Asserts that the server closes the connection without sending data.
#[allow(dead_code)]
pub async fn expect_closed(ws: &mut ClientStream) {
    loop {
        match timeout(Duration::from_secs(3), ws.next()).await {
            Err(_) => panic!("Connection was not closed"),
            Ok(Some(Ok(Message::Text(text)))) => panic!("Unexpected message: {}", text),
            Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => return,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

//! Common test utilities for relay integration tests
//!
//! Starts a real relay on an ephemeral port and provides a small WebSocket
//! client vocabulary on top of tokio-tungstenite.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use tandem_relay::clock::ManualClock;
use tandem_relay::websocket::registry::KeySource;
use tandem_relay::websocket::{PairingKey, RelayContext, SessionRegistry};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for a frame before failing a test
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Hands out a fixed sequence of keys, then falls back to random ones
pub struct ScriptedKeys(Mutex<VecDeque<&'static str>>);

impl ScriptedKeys {
    pub fn new(keys: &[&'static str]) -> Self {
        Self(Mutex::new(keys.iter().copied().collect()))
    }
}

impl KeySource for ScriptedKeys {
    fn next_key(&self) -> PairingKey {
        match self.0.lock().unwrap().pop_front() {
            Some(k) => PairingKey::parse(k).unwrap(),
            None => tandem_relay::websocket::registry::RandomKeys.next_key(),
        }
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
    pub clock: ManualClock,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|registry| registry, Duration::from_secs(30)).await
    }

    pub async fn start_with(
        customize: impl FnOnce(SessionRegistry) -> SessionRegistry,
        admission_timeout: Duration,
    ) -> Self {
        let clock = ManualClock::default();
        let registry = Arc::new(customize(SessionRegistry::new(
            Arc::new(clock.clone()),
            chrono::Duration::days(365),
        )));

        let app = tandem_relay::build_router(RelayContext {
            registry: Arc::clone(&registry),
            admission_timeout,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            addr,
            registry,
            clock,
        }
    }

    pub async fn connect(&self) -> Client {
        let (client, _) = connect_async(format!("ws://{}/ws", self.addr))
            .await
            .unwrap();
        client
    }

    /// Connect and admit a primary; returns the client and its assigned key
    pub async fn primary(&self, existing_key: Option<&str>) -> (Client, String) {
        let mut client = self.connect().await;
        let mut connect = serde_json::json!({ "type": "primary-connect" });
        if let Some(key) = existing_key {
            connect["existingKey"] = Value::from(key);
        }
        send_json(&mut client, &connect).await;

        let response = recv_json(&mut client).await;
        assert_eq!(response["type"], "primary-connect-response");
        assert_eq!(response["success"], true);
        let key = response["key"].as_str().unwrap().to_string();
        (client, key)
    }

    /// Connect and admit an observer; returns the client and its catch-up messages
    pub async fn observer(&self, key: &str) -> (Client, Vec<Value>) {
        let mut client = self.connect().await;
        send_json(
            &mut client,
            &serde_json::json!({ "type": "observer-connect", "key": key }),
        )
        .await;

        let mut catch_up = Vec::new();
        for _ in 0..3 {
            catch_up.push(recv_json(&mut client).await);
        }
        (client, catch_up)
    }

    pub fn key(&self, raw: &str) -> PairingKey {
        PairingKey::parse(raw).unwrap()
    }
}

pub async fn send_text(client: &mut Client, text: &str) {
    client.send(Message::Text(text.to_string())).await.unwrap();
}

pub async fn send_json(client: &mut Client, value: &Value) {
    send_text(client, &value.to_string()).await;
}

/// Next text frame, skipping control frames
pub async fn recv_text(client: &mut Client) -> String {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .unwrap();
        match frame {
            Message::Text(text) => return text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text frame, got {:?}", other),
        }
    }
}

pub async fn recv_json(client: &mut Client) -> Value {
    serde_json::from_str(&recv_text(client).await).unwrap()
}

/// Close code of the next close frame
pub async fn recv_close_code(client: &mut Client) -> u16 {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for close")
            .expect("connection ended without close frame")
            .unwrap();
        match frame {
            Message::Close(Some(frame)) => return u16::from(frame.code),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected close frame, got {:?}", other),
        }
    }
}

/// Assert nothing but control frames arrive within `window`
pub async fn assert_silent(client: &mut Client, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, client.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(other) => panic!("expected silence, got {:?}", other),
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

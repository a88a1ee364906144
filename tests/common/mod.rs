#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use termbridge::bridge::{self, AppState, BridgeSettings, RouterConfig};
use termbridge::broker::Broker;
use termbridge::event::{Payload, StreamEvent};
use termbridge::monitor::MonitorAggregator;
use termbridge::pattern::{builtin_rules, PatternEngine};
use termbridge::session::{SessionConfig, SessionLimits, SessionManager};
use termbridge::shutdown::ShutdownCoordinator;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn engine() -> Arc<PatternEngine> {
    Arc::new(PatternEngine::from_specs(&builtin_rules()).expect("builtin rules compile"))
}

pub fn limits() -> SessionLimits {
    SessionLimits {
        kill_grace: Duration::from_millis(500),
        ..SessionLimits::default()
    }
}

pub fn manager() -> SessionManager {
    SessionManager::new(Broker::new(), engine(), limits())
}

pub fn sh() -> SessionConfig {
    SessionConfig {
        shell: Some("/bin/sh".into()),
        ..SessionConfig::default()
    }
}

/// Receive until `pred` matches, collecting everything seen on the way.
pub async fn recv_until(
    rx: &mut mpsc::Receiver<StreamEvent>,
    mut pred: impl FnMut(&StreamEvent) -> bool,
) -> Vec<StreamEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(TIMEOUT, async {
        while let Some(event) = rx.recv().await {
            let done = pred(&event);
            seen.push(event);
            if done {
                return;
            }
        }
        panic!("queue closed before the expected event; saw {seen:?}");
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for event"));
    seen
}

/// Concatenated output bytes, lossily decoded.
pub fn output_text(events: &[StreamEvent]) -> String {
    let bytes: Vec<u8> = events
        .iter()
        .filter_map(|e| match &e.payload {
            Payload::Output(data) => Some(data.to_vec()),
            _ => None,
        })
        .flatten()
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub sessions: SessionManager,
    pub monitor: MonitorAggregator,
    pub shutdown: ShutdownCoordinator,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

pub async fn start_server(token: Option<String>) -> TestServer {
    start_server_with(token, BridgeSettings::default(), 1000).await
}

pub async fn start_server_with(
    token: Option<String>,
    settings: BridgeSettings,
    history_capacity: usize,
) -> TestServer {
    let broker = Broker::new();
    let monitor = MonitorAggregator::new(&broker, history_capacity);
    let sessions = SessionManager::new(broker, engine(), limits());
    let shutdown = ShutdownCoordinator::new();
    let state = AppState::new(sessions.clone(), monitor.clone(), shutdown.clone(), settings);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = bridge::router(state, RouterConfig { token, bind: addr });
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        sessions,
        monitor,
        shutdown,
    }
}

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect and consume the hello, returning it alongside the socket.
pub async fn connect(url: &str) -> (Ws, Value) {
    let (mut ws, _) = connect_async(url).await.expect("websocket connect");
    let hello = next_json(&mut ws).await;
    assert_eq!(hello["event"], "hello");
    (ws, hello)
}

pub async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("socket closed")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Close(frame) => panic!("socket closed: {frame:?}"),
            _ => continue,
        }
    }
}

/// Read messages until `pred` matches one; returns everything read.
pub async fn json_until(ws: &mut Ws, mut pred: impl FnMut(&Value) -> bool) -> Vec<Value> {
    let mut seen = Vec::new();
    loop {
        let value = next_json(ws).await;
        let done = pred(&value);
        seen.push(value);
        if done {
            return seen;
        }
    }
}

pub async fn send(ws: &mut Ws, id: u64, method: &str, params: Value) {
    let request = json!({ "id": id, "method": method, "params": params });
    ws.send(Message::Text(request.to_string().into()))
        .await
        .unwrap();
}

/// Send a request and wait for the response with the same id; events that
/// arrive in between are skipped.
pub async fn call(ws: &mut Ws, id: u64, method: &str, params: Value) -> Value {
    send(ws, id, method, params).await;
    let seen = json_until(ws, |v| v["id"] == id && v.get("event").is_none()).await;
    seen.into_iter().last().unwrap()
}

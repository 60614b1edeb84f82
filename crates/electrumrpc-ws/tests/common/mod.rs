//! In-memory server for client scenario tests.
//!
//! `MockConnector` hands out `MockTransport`s that answer requests through a
//! responder function, record every frame sent, and can push notifications
//! or drop the connection on demand.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use electrumrpc_core::error::{Result, RpcError};
use electrumrpc_core::transport::{Connector, EventSink, Transport, TransportEventKind, TransportId};
use electrumrpc_core::{ClientConfig, ConnectionState, Endpoint, HeartbeatConfig, ReconnectConfig};

/// How the mock answers one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Result(Value),
    Error(i64, &'static str),
    /// Never answer.
    Silent,
}

pub type Responder = Arc<dyn Fn(&str, &[Value]) -> Reply + Send + Sync>;

/// Answers like a Fulcrum server speaking protocol 1.4 to 1.5.
pub fn default_reply(method: &str, params: &[Value]) -> Reply {
    match method {
        "server.version" => Reply::Result(json!(["MockServer 1.0", ["1.4", "1.5"]])),
        "server.ping" => Reply::Result(Value::Null),
        "server.features" => Reply::Result(json!({
            "genesis_hash": "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
            "protocol_min": "1.4",
            "protocol_max": "1.5",
            "server_version": "MockServer 1.0",
            "dsproof": true
        })),
        "blockchain.relayfee" => Reply::Result(json!(0.00001)),
        "blockchain.headers.get_tip" | "blockchain.headers.subscribe" => {
            Reply::Result(json!({"height": 100, "hex": "00"}))
        }
        "blockchain.address.subscribe" => Reply::Result(json!(format!(
            "status-{}",
            params.first().and_then(Value::as_str).unwrap_or_default()
        ))),
        "blockchain.transaction.dsproof.subscribe" => Reply::Result(Value::Null),
        m if m.ends_with(".unsubscribe") => Reply::Result(json!(true)),
        _ => Reply::Error(-32601, "unknown method"),
    }
}

pub fn default_responder() -> Responder {
    Arc::new(default_reply)
}

/// Responder that never answers `silent_method` and otherwise defaults.
pub fn silent_on(silent_method: &'static str) -> Responder {
    Arc::new(move |method: &str, params: &[Value]| {
        if method == silent_method {
            Reply::Silent
        } else {
            default_reply(method, params)
        }
    })
}

pub struct MockTransport {
    id: TransportId,
    endpoint: Endpoint,
    sink: EventSink,
    state: Mutex<ConnectionState>,
    sent: Mutex<Vec<String>>,
    silent: AtomicBool,
    rejected: Mutex<Option<String>>,
    responder: Responder,
}

impl MockTransport {
    /// Every frame sent on this transport, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Frames whose `method` is `method`.
    pub fn sent_for(&self, method: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|raw| {
                serde_json::from_str::<Value>(raw)
                    .map(|v| v["method"] == method)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Push a notification. Ignored once disconnected.
    pub fn push(&self, method: &str, params: Value) {
        if !self.state().is_connected() {
            return;
        }
        let frame = json!({"jsonrpc": "2.0", "method": method, "params": params});
        self.sink.emit(TransportEventKind::Frame(frame.to_string()));
    }

    /// Simulate the server vanishing.
    pub fn drop_connection(&self, reason: &str) {
        self.close(Some(1006), reason);
    }

    /// Keep the socket open but stop answering.
    pub fn go_silent(&self) {
        self.silent.store(true, Ordering::SeqCst);
    }

    /// Record frames for `method` but fail to send them.
    pub fn reject(&self, method: &str) {
        *self.rejected.lock().unwrap() = Some(method.to_string());
    }

    fn close(&self, code: Option<u16>, reason: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        self.sink.emit(TransportEventKind::State(ConnectionState::Disconnected));
        self.sink.emit(TransportEventKind::Closed {
            code,
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    async fn send(&self, frame: String) -> Result<()> {
        if !self.state().is_connected() {
            return Err(RpcError::NotConnected);
        }
        self.sent.lock().unwrap().push(frame.clone());
        let request: Value = serde_json::from_str(&frame).unwrap();
        let method = request["method"].as_str().unwrap_or_default();
        if self.rejected.lock().unwrap().as_deref() == Some(method) {
            return Err(RpcError::Network(format!("{method} rejected")));
        }
        if self.silent.load(Ordering::SeqCst) {
            return Ok(());
        }

        let params = request["params"].as_array().cloned().unwrap_or_default();
        let reply = match (self.responder)(method, &params) {
            Reply::Result(result) => json!({"jsonrpc": "2.0", "id": request["id"], "result": result}),
            Reply::Error(code, message) => json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": code, "message": message}
            }),
            Reply::Silent => return Ok(()),
        };
        self.sink.emit(TransportEventKind::Frame(reply.to_string()));
        Ok(())
    }

    async fn disconnect(&self, reason: &str) {
        self.close(Some(1000), reason);
    }
}

pub struct MockConnector {
    responder: Responder,
    refuse: AtomicBool,
    attempts: AtomicUsize,
    tried: Mutex<Vec<Endpoint>>,
    connections: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Self::with_responder(default_responder())
    }

    pub fn with_responder(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            responder,
            refuse: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            tried: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        })
    }

    /// Make every later connect attempt fail.
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Every endpoint a connect was attempted on, in order.
    pub fn tried(&self) -> Vec<String> {
        self.tried.lock().unwrap().iter().map(|e| e.as_str().to_string()).collect()
    }

    pub fn count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn connection(&self, index: usize) -> Arc<MockTransport> {
        self.connections.lock().unwrap()[index].clone()
    }

    pub fn latest(&self) -> Arc<MockTransport> {
        self.connections.lock().unwrap().last().cloned().expect("no connection yet")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Endpoint, sink: EventSink) -> Result<Arc<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.tried.lock().unwrap().push(endpoint.clone());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RpcError::SetupFailed {
                url: endpoint.to_string(),
                reason: "connection refused".into(),
            });
        }
        sink.emit(TransportEventKind::State(ConnectionState::Connecting));
        let transport = Arc::new(MockTransport {
            id: sink.transport(),
            endpoint: endpoint.clone(),
            sink: sink.clone(),
            state: Mutex::new(ConnectionState::Connected),
            sent: Mutex::new(Vec::new()),
            silent: AtomicBool::new(false),
            rejected: Mutex::new(None),
            responder: self.responder.clone(),
        });
        sink.emit(TransportEventKind::State(ConnectionState::Connected));
        self.connections.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

/// Fast settings against one mock server, heartbeat and auto-reconnect off.
pub fn config() -> ClientConfig {
    ClientConfig {
        reconnect: ReconnectConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_range: (1.0, 1.0),
        },
        heartbeat: HeartbeatConfig {
            enabled: false,
            ..Default::default()
        },
        connection_timeout: Duration::from_secs(1),
        bootstrap_servers: Some(vec!["wss://mock.example:50004".into()]),
        automatic_reconnect: false,
        client_name: "electrumrpc-test".into(),
        ..Default::default()
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

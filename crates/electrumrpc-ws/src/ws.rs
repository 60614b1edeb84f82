//! WebSocket transport backed by `tokio-tungstenite`.
//!
//! A background task owns the socket. Callers talk to it through a command
//! channel; inbound frames and lifecycle changes go out on the
//! [`EventSink`]. The task never reconnects: when the socket dies it reports
//! `Disconnected` then `Closed` and exits.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use electrumrpc_core::error::{Result, RpcError};
use electrumrpc_core::transport::{
    Connector, EventSink, Transport, TransportEventKind, TransportId,
};
use electrumrpc_core::{ConnectionState, Endpoint};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Command sent from callers to the background socket task.
enum WsCommand {
    Send {
        frame: String,
        ack: oneshot::Sender<Result<()>>,
    },
    Close {
        reason: String,
    },
}

/// One WebSocket connection.
pub struct WsTransport {
    id: TransportId,
    endpoint: Endpoint,
    state: Arc<Mutex<ConnectionState>>,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
}

impl WsTransport {
    /// Open the socket and start the receive loop.
    pub async fn connect(
        endpoint: &Endpoint,
        maximum_message_size: usize,
        sink: EventSink,
    ) -> Result<Self> {
        let state = Arc::new(Mutex::new(ConnectionState::Connecting));
        sink.emit(TransportEventKind::State(ConnectionState::Connecting));
        tracing::info!(url = %endpoint, "connecting via WebSocket");

        let ws_config = WebSocketConfig {
            max_message_size: Some(maximum_message_size),
            max_frame_size: Some(maximum_message_size),
            ..Default::default()
        };
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(endpoint.as_str(), Some(ws_config), false)
                .await
                .map_err(|e| {
                    set_state(&state, ConnectionState::Disconnected);
                    RpcError::SetupFailed {
                        url: endpoint.to_string(),
                        reason: e.to_string(),
                    }
                })?;

        set_state(&state, ConnectionState::Connected);
        sink.emit(TransportEventKind::State(ConnectionState::Connected));
        tracing::info!(url = %endpoint, transport = sink.transport(), "WebSocket connected");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let id = sink.transport();
        tokio::spawn(ws_task(ws_stream, cmd_rx, sink, state.clone(), endpoint.clone()));

        Ok(Self {
            id,
            endpoint: endpoint.clone(),
            state,
            cmd_tx,
        })
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WsCommand::Close {
            reason: "transport dropped".into(),
        });
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn send(&self, frame: String) -> Result<()> {
        if !self.state().is_connected() {
            return Err(RpcError::NotConnected);
        }
        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Send { frame, ack })
            .map_err(|_| RpcError::NotConnected)?;
        ack_rx.await.map_err(|_| RpcError::ConnectionClosed {
            code: None,
            reason: "socket task ended".into(),
        })?
    }

    async fn disconnect(&self, reason: &str) {
        let _ = self.cmd_tx.send(WsCommand::Close {
            reason: reason.to_string(),
        });
    }
}

fn set_state(state: &Mutex<ConnectionState>, next: ConnectionState) {
    let mut current = state.lock().unwrap_or_else(|e| e.into_inner());
    if !current.can_transition_to(next) {
        tracing::debug!(from = %*current, to = %next, "unexpected transport state transition");
    }
    *current = next;
}

/// Background task that owns the WebSocket connection.
async fn ws_task(
    ws_stream: WsStream,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    events: EventSink,
    state: Arc<Mutex<ConnectionState>>,
    endpoint: Endpoint,
) {
    let (mut sink, mut stream) = ws_stream.split();

    let (code, reason) = loop {
        tokio::select! {
            // Outgoing frames and close requests
            cmd = cmd_rx.recv() => {
                match cmd {
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break (None, "transport dropped".to_string());
                    }
                    Some(WsCommand::Close { reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: reason.clone().into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        break (Some(u16::from(CloseCode::Normal)), reason);
                    }
                    Some(WsCommand::Send { frame, ack }) => {
                        let result = sink
                            .send(Message::Text(frame.into()))
                            .await
                            .map_err(|e| RpcError::Network(e.to_string()));
                        let failed = result.as_ref().err().map(|e| e.to_string());
                        let _ = ack.send(result);
                        if let Some(reason) = failed {
                            break (None, reason);
                        }
                    }
                }
            }
            // Incoming frames from the server
            msg = stream.next() => {
                match msg {
                    None => break (None, "stream ended".to_string()),
                    Some(Err(e)) => {
                        tracing::warn!(url = %endpoint, error = %e, "WS receive error");
                        break (None, e.to_string());
                    }
                    Some(Ok(Message::Text(text))) => {
                        events.emit(TransportEventKind::Frame(text.to_string()));
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            events.emit(TransportEventKind::Frame(text));
                        }
                        Err(_) => tracing::debug!(url = %endpoint, "ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(url = %endpoint, "WebSocket closed by server");
                        break match frame {
                            Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                            None => (None, "closed by server".to_string()),
                        };
                    }
                    Some(Ok(Message::Ping(data))) => {
                        // Respond to server pings to keep the connection alive
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {} // pong, raw frame
                }
            }
        }
    };

    set_state(&state, ConnectionState::Disconnected);
    tracing::warn!(url = %endpoint, ?code, %reason, "WS disconnected");
    events.emit(TransportEventKind::State(ConnectionState::Disconnected));
    events.emit(TransportEventKind::Closed { code, reason: reason.clone() });

    // Anything still queued will never be written.
    cmd_rx.close();
    while let Some(cmd) = cmd_rx.recv().await {
        if let WsCommand::Send { ack, .. } = cmd {
            let _ = ack.send(Err(RpcError::ConnectionClosed {
                code,
                reason: reason.clone(),
            }));
        }
    }
}

/// [`Connector`] that opens [`WsTransport`]s.
#[derive(Debug, Clone)]
pub struct WsConnector {
    maximum_message_size: usize,
}

impl WsConnector {
    pub fn new(maximum_message_size: usize) -> Self {
        Self { maximum_message_size }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &Endpoint, sink: EventSink) -> Result<Arc<dyn Transport>> {
        let transport = WsTransport::connect(endpoint, self.maximum_message_size, sink).await?;
        Ok(Arc::new(transport))
    }
}

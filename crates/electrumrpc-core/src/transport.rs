//! The `Transport` trait — one socket connection to one endpoint.
//!
//! A transport only moves frames. It publishes inbound frames and lifecycle
//! changes on the [`EventSink`] it was connected with and never reconnects
//! by itself.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::catalog::Endpoint;
use crate::error::Result;
use crate::state::ConnectionState;

/// Identifies one transport instance. A replaced transport's id never
/// comes back, so stale events can be told apart from live ones.
pub type TransportId = u64;

/// Something a transport reports.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    /// One inbound text frame, in receipt order.
    Frame(String),
    /// The transport moved to a new lifecycle state.
    State(ConnectionState),
    /// The socket closed. Emitted once, after the `Disconnected` state.
    Closed { code: Option<u16>, reason: String },
}

/// A [`TransportEventKind`] tagged with the transport that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub transport: TransportId,
    pub kind: TransportEventKind,
}

/// Where a transport publishes its events.
#[derive(Debug, Clone)]
pub struct EventSink {
    transport: TransportId,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn new(transport: TransportId, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { transport, tx }
    }

    pub fn transport(&self) -> TransportId {
        self.transport
    }

    /// Publish an event. Returns `false` once nobody is listening.
    pub fn emit(&self, kind: TransportEventKind) -> bool {
        self.tx
            .send(TransportEvent {
                transport: self.transport,
                kind,
            })
            .is_ok()
    }
}

/// A live connection.
///
/// # Object Safety
/// The trait is object-safe and is stored as `Arc<dyn Transport>`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn id(&self) -> TransportId;

    fn endpoint(&self) -> &Endpoint;

    fn state(&self) -> ConnectionState;

    /// Write one frame. Fails unless the state is `Connected`.
    async fn send(&self, frame: String) -> Result<()>;

    /// Close cleanly. The `Closed` event still fires.
    async fn disconnect(&self, reason: &str);
}

/// Opens transports.
///
/// The client goes through a connector for the first connection and for
/// every reconnection, so tests can substitute an in-memory one.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection to `endpoint` that publishes on `sink`.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        sink: EventSink,
    ) -> Result<std::sync::Arc<dyn Transport>>;
}

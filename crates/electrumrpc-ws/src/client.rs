//! Client — the public call/subscribe surface over one shared transport.
//!
//! # Architecture
//!
//! ```text
//!   call() / subscribe()
//!         │  ensure negotiated, register in Router, send
//!         ▼
//!   current Transport ──frames/states──► event pump ──► Router ──► waiters
//!         ▲                                   │
//!         │ install                           │ Closed (live transport)
//!   Reconnector ◄──── reconnect episode ◄─────┘   (also Heartbeat, reconnect())
//! ```
//!
//! The transport is swapped, never mutated, on reconnection. Every caller
//! fetches the current one right before sending. Events carry the id of the
//! transport that produced them; only the live transport may change the
//! client's state or trigger a reconnect.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures::future::{self, FutureExt};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use electrumrpc_core::codec::{decode_response, encode_raw};
use electrumrpc_core::error::{Result, RpcError};
use electrumrpc_core::methods::{GetServerFeatures, ServerVersion, HANDSHAKE_PATH};
use electrumrpc_core::transport::{Connector, EventSink, Transport, TransportEvent, TransportEventKind, TransportId};
use electrumrpc_core::{
    load_server_catalog, CancellationToken, ClientConfig, ConnectionState, CorrelationKey, Endpoint,
    Method, MethodKind, RpcId, Router, SubscriptionMethod,
};

use crate::diagnostics::{ClientEvent, DiagnosticsSnapshot, SubscriptionInfo};
use crate::heartbeat;
use crate::negotiate::{agree, NegotiatedSession, Negotiator};
use crate::reconnect::{candidate_order, Episode, Reconnector};
use crate::subscriptions::{
    StoredSubscription, Subscription, SubscriptionRegistry, SubscriptionStream, Terminator,
};
use crate::ws::WsConnector;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Give up after this long. Covers negotiation, send and the response.
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Why a reconnect episode was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    /// The live transport reported `Closed`.
    Lost,
    /// The heartbeat gave up on this transport after `misses` missed pings.
    Heartbeat { transport: TransportId, misses: u32 },
    /// `Client::reconnect()`.
    Manual,
}

/// Electrum-protocol client.
///
/// # Example
/// ```no_run
/// # async fn run() -> electrumrpc_core::Result<()> {
/// use electrumrpc_core::methods::HeadersGetTip;
/// use electrumrpc_core::ClientConfig;
/// use electrumrpc_ws::{CallOptions, Client};
///
/// let client = Client::connect(ClientConfig::for_server("wss://bch.imaginary.cash:50004")).await?;
/// let tip = client.call(&HeadersGetTip, CallOptions::default()).await?;
/// println!("height {}", tip.height);
/// # Ok(())
/// # }
/// ```
pub struct Client {
    shared: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    servers: Vec<Endpoint>,
    router: Router,
    registry: SubscriptionRegistry,
    negotiator: Negotiator,
    reconnector: Reconnector,
    /// Current transport, replaced wholesale on reconnect.
    transport: RwLock<Option<Arc<dyn Transport>>>,
    last_endpoint: Mutex<Option<Endpoint>>,
    next_transport_id: AtomicU64,
    /// Id of the transport whose events count; 0 when there is none.
    live: AtomicU64,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<ConnectionState>,
    state_tx: broadcast::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ClientEvent>,
    /// Serializes reconnect episodes.
    reconnect_lock: tokio::sync::Mutex<()>,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Connect over WebSocket.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let connector = Arc::new(WsConnector::new(config.maximum_message_size));
        Self::connect_with(config, connector).await
    }

    /// Connect through a custom [`Connector`].
    pub async fn connect_with(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let servers = resolve_servers(&config)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = broadcast::channel(64);
        let (events_tx, _) = broadcast::channel(256);

        let shared = Arc::new(ClientInner {
            router: Router::new(),
            registry: SubscriptionRegistry::default(),
            negotiator: Negotiator::new(config.protocol_version_range),
            reconnector: Reconnector::new(config.reconnect.clone(), config.connection_timeout),
            transport: RwLock::new(None),
            last_endpoint: Mutex::new(None),
            next_transport_id: AtomicU64::new(1),
            live: AtomicU64::new(0),
            event_tx,
            state: Mutex::new(ConnectionState::Idle),
            state_tx,
            events_tx,
            reconnect_lock: tokio::sync::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            connector,
            servers,
            config,
        });

        shared.track(tokio::spawn(pump(Arc::downgrade(&shared), event_rx)));
        if let Err(error) = shared.open().await {
            shared.abort_tasks();
            return Err(error);
        }
        if shared.config.heartbeat.enabled {
            let hb = heartbeat::spawn(Arc::downgrade(&shared), shared.config.heartbeat.clone());
            shared.track(hb);
        }
        Ok(Self { shared })
    }

    /// Send a unary call and decode its response.
    pub async fn call<M: Method>(&self, method: &M, options: CallOptions) -> Result<M::Output> {
        self.shared.call(method, options).await
    }

    /// Open a subscription: the initial response plus a stream of updates.
    pub async fn subscribe<M: SubscriptionMethod>(
        &self,
        method: M,
        options: CallOptions,
    ) -> Result<Subscription<M::Output, M::Notification>> {
        self.shared.subscribe(method, options).await
    }

    /// Re-send every active subscription's original request on the current
    /// transport. Every request is attempted; the first failure is returned,
    /// otherwise how many were sent.
    pub async fn resubscribe_stored(&self) -> Result<usize> {
        self.shared.resubscribe_stored().await
    }

    /// Drop the current transport and connect again.
    pub async fn reconnect(&self) -> Result<()> {
        self.shared.reconnect_episode(Trigger::Manual, "manual reconnect").await
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.current_state()
    }

    /// The current state followed by every later change.
    pub fn connection_states(&self) -> impl Stream<Item = ConnectionState> + Send + 'static {
        let rx = self.shared.state_tx.subscribe();
        let changes = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(state) => return Some((state, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        futures::stream::once(future::ready(self.state())).chain(changes)
    }

    /// Diagnostic events as they happen.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            reconnect_attempts: self.shared.reconnector.attempts(),
            reconnect_successes: self.shared.reconnector.successes(),
            inflight_unary_count: self.shared.router.unary_count(),
            active_subscription_count: self.shared.registry.len(),
        }
    }

    pub fn list_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.shared.registry.list()
    }

    /// The session negotiated on the current transport, if any.
    pub fn negotiated(&self) -> Option<NegotiatedSession> {
        self.shared.negotiator.session()
    }

    /// Endpoint of the current transport.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.shared.current_transport().map(|t| t.endpoint().clone())
    }

    /// Disconnect and stop background work. Pending calls fail with
    /// `ConnectionClosed`.
    pub async fn shutdown(&self) {
        self.shared.shutdown().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.reconnector.stop();
        self.shared.abort_tasks();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

/// Explicit servers first, then the bundled catalogue for the network.
fn resolve_servers(config: &ClientConfig) -> Result<Vec<Endpoint>> {
    let mut servers = match &config.bootstrap_servers {
        Some(urls) => urls.iter().map(|u| Endpoint::parse(u)).collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };
    for endpoint in load_server_catalog(config.network)? {
        if !servers.contains(&endpoint) {
            servers.push(endpoint);
        }
    }
    if servers.is_empty() {
        return Err(RpcError::InvalidConfig("no servers configured".into()));
    }
    Ok(servers)
}

/// Feed transport events into the client, in order.
async fn pump(client: Weak<ClientInner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(client) = client.upgrade() else {
            return;
        };
        client.on_transport_event(event);
    }
}

/// Wait for the cancellation signal; never resolves without a token.
async fn cancelled(signal: Option<oneshot::Receiver<()>>) {
    match signal {
        Some(rx) => {
            if rx.await.is_err() {
                future::pending::<()>().await
            }
        }
        None => future::pending::<()>().await,
    }
}

/// Removes a unary waiter when the waiting future goes away early.
struct PendingGuard<'a> {
    router: &'a Router,
    key: CorrelationKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.router.cancel(&self.key, None);
    }
}

impl ClientInner {
    pub(crate) fn router(&self) -> &Router {
        &self.router
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Keep `task` so shutdown can abort it. Spawned after shutdown, it is
    /// aborted right away.
    fn track(&self, task: JoinHandle<()>) {
        if self.is_shutting_down() {
            task.abort();
            return;
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current == next {
            return;
        }
        if !current.can_transition_to(next) {
            tracing::debug!(from = %*current, to = %next, "unexpected state transition");
        }
        *current = next;
        // Published under the lock so observers see changes in order.
        let _ = self.state_tx.send(next);
        self.emit(ClientEvent::StateChanged(next));
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Id of the live transport, if connected.
    pub(crate) fn live_transport(&self) -> Option<TransportId> {
        match self.live.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    /// Stop treating `id` as live. True for exactly one caller.
    fn retire(&self, id: TransportId) -> bool {
        self.live
            .compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn next_sink(&self) -> EventSink {
        let id = self.next_transport_id.fetch_add(1, Ordering::SeqCst);
        EventSink::new(id, self.event_tx.clone())
    }

    fn last_endpoint(&self) -> Option<Endpoint> {
        self.last_endpoint.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Mirror connection attempts into the client state, then publish.
    fn observe(&self, event: ClientEvent) {
        match &event {
            ClientEvent::ReconnectAttempt { .. } => self.set_state(ConnectionState::Connecting),
            ClientEvent::ReconnectFailed { .. } => {
                self.set_state(ConnectionState::Disconnected);
                self.set_state(ConnectionState::Reconnecting);
            }
            _ => {}
        }
        self.emit(event);
    }

    // ─── Transport events ─────────────────────────────────────────────────

    fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event.kind {
            // Late frames from a replaced transport still resolve their waiters.
            TransportEventKind::Frame(raw) => {
                self.router.handle(&raw);
            }
            // Setup states queued before install are stale once the
            // transport is live; `install` already moved the client on.
            TransportEventKind::State(state) => {
                if self.live.load(Ordering::SeqCst) == event.transport && state != ConnectionState::Connecting {
                    self.set_state(state);
                }
            }
            TransportEventKind::Closed { code, reason } => {
                if self.retire(event.transport) {
                    self.on_connection_lost(event.transport, code, reason);
                } else {
                    tracing::debug!(transport = event.transport, "ignoring close of retired transport");
                }
            }
        }
    }

    fn on_connection_lost(self: &Arc<Self>, id: TransportId, code: Option<u16>, reason: String) {
        {
            let mut slot = self.transport.write().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref().map(|t| t.id()) == Some(id) {
                *slot = None;
            }
        }
        let error = RpcError::ConnectionClosed {
            code,
            reason: reason.clone(),
        };
        let failed = self.router.fail_all(error.clone());
        let notified = self.router.notify_streams(error);
        self.negotiator.invalidate();
        self.set_state(ConnectionState::Disconnected);
        tracing::warn!(transport = id, ?code, %reason, failed, notified, "connection lost");

        if self.config.automatic_reconnect && !self.is_shutting_down() {
            let client = self.clone();
            self.track(tokio::spawn(async move {
                if let Err(error) = client.reconnect_episode(Trigger::Lost, &reason).await {
                    tracing::error!(%error, "automatic reconnect failed");
                }
            }));
        }
    }

    // ─── Connection management ────────────────────────────────────────────

    async fn open(self: &Arc<Self>) -> Result<()> {
        let _episode = self.reconnect_lock.lock().await;
        let candidates = candidate_order(None, &self.servers);
        let transport = self
            .reconnector
            .run(
                Episode::Initial,
                self.connector.as_ref(),
                &candidates,
                || self.next_sink(),
                |event| self.observe(event),
            )
            .await
            .map_err(|error| {
                self.set_state(ConnectionState::Disconnected);
                error
            })?;
        self.install(transport);
        Ok(())
    }

    fn install(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        let id = transport.id();
        *self.last_endpoint.lock().unwrap_or_else(|e| e.into_inner()) = Some(transport.endpoint().clone());
        *self.transport.write().unwrap_or_else(|e| e.into_inner()) = Some(transport.clone());
        self.live.store(id, Ordering::SeqCst);

        if transport.state().is_connected() {
            self.set_state(ConnectionState::Connected);
        } else if self.retire(id) {
            // Closed before it was installed; its Closed event was ignored.
            self.on_connection_lost(id, None, "closed before use".into());
        }
    }

    /// Take the live transport out of service. `None` if the connection
    /// loss was already handled.
    fn retire_current(&self) -> Option<Arc<dyn Transport>> {
        let current = self.transport.write().unwrap_or_else(|e| e.into_inner()).take()?;
        self.retire(current.id()).then_some(current)
    }

    /// Replace the transport: one episode of the reconnector, then
    /// negotiation and subscription replay on the new transport.
    pub(crate) async fn reconnect_episode(self: &Arc<Self>, trigger: Trigger, reason: &str) -> Result<()> {
        let _episode = self.reconnect_lock.lock().await;
        if self.is_shutting_down() {
            return Err(RpcError::NotConnected);
        }
        let live = self.live.load(Ordering::SeqCst);
        match trigger {
            Trigger::Lost if live != 0 => return Ok(()),
            Trigger::Heartbeat { transport, .. } if live != 0 && live != transport => return Ok(()),
            _ => {}
        }

        // Requests sent to the retired transport will never be answered.
        let closed = RpcError::ConnectionClosed {
            code: None,
            reason: reason.to_string(),
        };
        let unary_failure = match trigger {
            Trigger::Heartbeat { misses, .. } => RpcError::HeartbeatTimeout { misses },
            _ => closed.clone(),
        };
        if let Some(old) = self.retire_current() {
            tracing::info!(url = %old.endpoint(), %reason, "replacing transport");
            old.disconnect(reason).await;
            self.router.fail_all(unary_failure);
            self.router.notify_streams(closed);
            self.negotiator.invalidate();
        }
        self.set_state(ConnectionState::Disconnected);
        self.set_state(ConnectionState::Reconnecting);

        let preferred = self.last_endpoint();
        let candidates = candidate_order(preferred.as_ref(), &self.servers);
        let outcome = self
            .reconnector
            .run(
                Episode::Reconnect,
                self.connector.as_ref(),
                &candidates,
                || self.next_sink(),
                |event| self.observe(event),
            )
            .await;

        match outcome {
            Ok(transport) => {
                self.install(transport);
                self.after_reconnect().await;
                Ok(())
            }
            Err(error) => {
                self.set_state(ConnectionState::Disconnected);
                Err(error)
            }
        }
    }

    async fn after_reconnect(self: &Arc<Self>) {
        if let Err(error) = self.negotiate().await {
            tracing::warn!(%error, "negotiation after reconnect failed");
            return;
        }
        match self.resubscribe_stored().await {
            Ok(count) => tracing::info!(count, "subscriptions restored"),
            Err(error) => tracing::warn!(%error, "restoring subscriptions failed"),
        }
    }

    async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.reconnector.stop();
        if let Some(transport) = self.retire_current() {
            transport.disconnect("client shutdown").await;
        }
        let error = RpcError::ConnectionClosed {
            code: Some(1000),
            reason: "client shutdown".into(),
        };
        let failed = self.router.fail_all(error);
        self.negotiator.invalidate();
        self.set_state(ConnectionState::Disconnected);
        self.abort_tasks();
        tracing::info!(failed, "client shut down");
    }

    // ─── Requests ─────────────────────────────────────────────────────────

    async fn send(&self, frame: String) -> Result<()> {
        let transport = self.current_transport().ok_or(RpcError::NotConnected)?;
        transport.send(frame).await
    }

    /// Register a unary waiter under `id`, send `frame` and wait for the
    /// raw response.
    async fn request_frame(&self, id: &RpcId, frame: String) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.router.add_unary(id.clone(), tx)?;
        let guard = PendingGuard {
            router: &self.router,
            key: CorrelationKey::Unary(id.clone()),
        };
        if let Err(error) = self.send(frame).await {
            self.router.cancel(&guard.key, Some(error.clone()));
            return Err(error);
        }
        rx.await.unwrap_or(Err(RpcError::Cancelled))
    }

    async fn request(&self, path: &str, params: Vec<Value>) -> Result<String> {
        let id = RpcId::generate();
        let frame = encode_raw(&id, path, params)?;
        self.request_frame(&id, frame).await
    }

    /// Send a request nobody waits for.
    pub(crate) async fn fire_and_forget(&self, path: &'static str, params: Vec<Value>) {
        let id = RpcId::generate();
        let result = match encode_raw(&id, path, params) {
            Ok(frame) => self.send(frame).await,
            Err(error) => Err(error),
        };
        match result {
            Ok(()) => tracing::debug!(method = path, "sent"),
            Err(error) => tracing::debug!(method = path, %error, "fire-and-forget request not sent"),
        }
    }

    // ─── Negotiation ──────────────────────────────────────────────────────

    async fn negotiate(self: &Arc<Self>) -> Result<NegotiatedSession> {
        let client = self.clone();
        self.negotiator
            .ensure(move || async move { client.handshake().await }.boxed())
            .await
    }

    async fn handshake(&self) -> Result<NegotiatedSession> {
        let method = ServerVersion {
            client_name: self.config.client_name.clone(),
            protocol: *self.negotiator.client_range(),
        };
        let limit = self.config.connection_timeout;
        let raw = tokio::time::timeout(limit, self.request(method.path(), method.params()))
            .await
            .map_err(|_| RpcError::Timeout { duration: limit })??;

        let reply: (String, Value) = decode_response(&raw, HANDSHAKE_PATH)?;
        let protocol_version = agree(self.negotiator.client_range(), &reply)?;
        let server_software = reply.0;

        let server_features = if self.config.fetch_server_features {
            self.fetch_features(limit).await
        } else {
            None
        };

        self.emit(ClientEvent::Negotiated {
            version: protocol_version,
            server_software: server_software.clone(),
        });
        Ok(NegotiatedSession {
            protocol_version,
            server_software,
            server_features,
            handshake_frame: raw,
        })
    }

    async fn fetch_features(&self, limit: Duration) -> Option<electrumrpc_core::methods::ServerFeatures> {
        let method = GetServerFeatures;
        let outcome = tokio::time::timeout(limit, self.request(method.path(), method.params()))
            .await
            .unwrap_or(Err(RpcError::Timeout { duration: limit }))
            .and_then(|raw| decode_response(&raw, method.path()));
        match outcome {
            Ok(features) => Some(features),
            Err(error) => {
                tracing::warn!(%error, "server.features unavailable");
                None
            }
        }
    }

    // ─── Public operations ────────────────────────────────────────────────

    /// Run `work` under the call options. A cancellation also removes the
    /// unary waiter `key` from the router.
    async fn with_options<T, F>(
        self: &Arc<Self>,
        key: Option<&CorrelationKey>,
        options: &CallOptions,
        work: F,
    ) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let token = options.cancellation.as_ref();
        if token.is_some_and(CancellationToken::is_cancelled) {
            if let Some(key) = key {
                self.router.cancel(key, None);
            }
            return Err(RpcError::Cancelled);
        }

        let (signal_tx, signal_rx) = oneshot::channel();
        let _registration = token.map(|token| {
            let client = Arc::downgrade(self);
            let key = key.cloned();
            token.on_cancel(move || {
                let _ = signal_tx.send(());
                if let (Some(client), Some(key)) = (client.upgrade(), key) {
                    client.router.cancel(&key, None);
                }
            })
        });
        let signal = token.map(|_| signal_rx);

        let timed = async {
            match options.timeout {
                Some(duration) => tokio::time::timeout(duration, work)
                    .await
                    .unwrap_or(Err(RpcError::Timeout { duration })),
                None => work.await,
            }
        };

        tokio::select! {
            result = timed => result,
            _ = cancelled(signal) => Err(RpcError::Cancelled),
        }
    }

    pub(crate) async fn call<M: Method>(self: &Arc<Self>, method: &M, options: CallOptions) -> Result<M::Output> {
        let path = method.path();
        if method.kind() != MethodKind::Unary {
            return Err(RpcError::UnexpectedMethodKind {
                method: path.to_string(),
                expected: "unary",
            });
        }

        let id = RpcId::generate();
        let key = CorrelationKey::Unary(id.clone());
        let work = async {
            let session = self.negotiate().await?;
            // The handshake already ran on this transport; replay its reply.
            if path == HANDSHAKE_PATH {
                return decode_response(&session.handshake_frame, path);
            }
            let frame = encode_raw(&id, path, method.params())?;
            let raw = self.request_frame(&id, frame).await?;
            decode_response(&raw, path)
        };
        let result = self.with_options(Some(&key), &options, work).await;
        if let Err(error) = &result {
            tracing::debug!(method = path, kind = %error.kind(), %error, "call failed");
        }
        result
    }

    pub(crate) async fn subscribe<M: SubscriptionMethod>(
        self: &Arc<Self>,
        method: M,
        options: CallOptions,
    ) -> Result<Subscription<M::Output, M::Notification>> {
        let path = method.path();
        if method.kind() != MethodKind::Subscription {
            return Err(RpcError::UnexpectedMethodKind {
                method: path.to_string(),
                expected: "subscription",
            });
        }

        let identifier = method.identifier();
        let stream_key = CorrelationKey::stream(path, identifier.clone());
        let work = async {
            self.negotiate().await?;

            let id = RpcId::generate();
            let frame = encode_raw(&id, path, method.params())?;
            let (tx, rx) = mpsc::unbounded_channel();
            self.router.add_stream(stream_key.clone(), tx)?;

            let unsubscribe = method
                .unsubscribe_path()
                .map(|p| (p, method.unsubscribe_params()));
            let terminator = Arc::new(Terminator::new(Arc::downgrade(self), stream_key.clone(), unsubscribe));

            let active = self.registry.insert(
                stream_key.clone(),
                StoredSubscription {
                    method_path: path.to_string(),
                    identifier: identifier.clone(),
                    frame: frame.clone(),
                },
            );
            tracing::info!(method = path, identifier = ?identifier, active, "subscribed");
            self.emit(ClientEvent::SubscriptionsChanged { active });

            let initial = self
                .request_frame(&id, frame)
                .await
                .and_then(|raw| decode_response::<M::Output>(&raw, path));
            match initial {
                Ok(initial) => Ok(Subscription {
                    initial,
                    updates: SubscriptionStream::new(rx, path, terminator),
                }),
                Err(error) => {
                    terminator.abort();
                    Err(error)
                }
            }
        };
        // An abandoned subscribe is cleaned up by its terminator.
        self.with_options(None, &options, work).await
    }

    pub(crate) async fn resubscribe_stored(&self) -> Result<usize> {
        let frames = self.registry.frames();
        let count = frames.len();
        let mut first_error = None;
        for frame in frames {
            if let Err(error) = self.send(frame).await {
                tracing::warn!(%error, "subscription not restored");
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(count),
        }
    }

    /// Drop a subscription's registry entry and router stream.
    pub(crate) fn forget_subscription(&self, key: &CorrelationKey) {
        if let Some(active) = self.registry.remove(key) {
            tracing::info!(%key, active, "unsubscribed");
            self.emit(ClientEvent::SubscriptionsChanged { active });
        }
        self.router.cancel(key, None);
    }
}

//! electrumrpc-core — foundation traits and types for ElectrumRPC.
//!
//! # Overview
//!
//! ElectrumRPC is a client for the JSON-RPC-over-WebSocket protocol spoken by
//! Electrum Cash indexing servers (Fulcrum and friends). The core crate
//! defines:
//!
//! - [`Transport`] / [`Connector`] — the frame-level connection traits
//! - [`Router`] — request/response/notification correlation
//! - [`Method`] / [`SubscriptionMethod`] — the boundary to the method catalogue
//! - [`codec`] — request encoding and typed response decoding
//! - [`RpcError`] — structured error taxonomy
//! - [`CancellationToken`] — run-now-or-later cancellation callbacks
//! - [`ClientConfig`], [`BackoffPolicy`] and the bundled server [`catalog`]

pub mod backoff;
pub mod cancel;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod error;
pub mod method;
pub mod methods;
pub mod request;
pub mod router;
pub mod state;
pub mod transport;
pub mod version;

pub use backoff::BackoffPolicy;
pub use cancel::{CancelRegistration, CancellationToken};
pub use catalog::{load_server_catalog, parse_catalog, Endpoint};
pub use config::{ClientConfig, ConfigFile, HeartbeatConfig, Network, ReconnectConfig};
pub use error::{ErrorKind, Result, RpcError};
pub use method::{Method, MethodKind, SubscriptionMethod};
pub use request::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, RpcId};
pub use router::{CorrelationKey, RawResult, RouteOutcome, Router};
pub use state::ConnectionState;
pub use transport::{Connector, EventSink, Transport, TransportEvent, TransportEventKind, TransportId};
pub use version::{ProtocolVersion, VersionRange};

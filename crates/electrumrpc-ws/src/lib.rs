//! electrumrpc-ws — WebSocket client for Electrum-protocol servers.
//!
//! # Features
//! - Auto-reconnect with exponential backoff, rotating through the server list
//! - Single-flight `server.version` negotiation per connection
//! - Heartbeat pings that replace silently dead connections
//! - Subscriptions that survive reconnects (replayed verbatim)
//! - Request multiplexing over a single connection

pub mod client;
pub mod diagnostics;
mod heartbeat;
pub mod negotiate;
pub mod reconnect;
pub mod subscriptions;
pub mod ws;

pub use client::{CallOptions, Client};
pub use diagnostics::{ClientEvent, DiagnosticsSnapshot, SubscriptionInfo};
pub use negotiate::NegotiatedSession;
pub use reconnect::Reconnector;
pub use subscriptions::{Subscription, SubscriptionHandle, SubscriptionStream};
pub use ws::{WsConnector, WsTransport};

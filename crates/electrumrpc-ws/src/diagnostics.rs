//! Diagnostics surface: events, counters and subscription listings.

use std::time::Duration;

use serde::Serialize;

use electrumrpc_core::{ConnectionState, Endpoint, ProtocolVersion, RpcError};

/// Something worth observing happened inside the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    /// About to sleep `delay` and then try `endpoint`.
    ReconnectAttempt {
        attempt: u32,
        endpoint: Endpoint,
        delay: Duration,
    },
    ReconnectFailed {
        attempt: u32,
        endpoint: Endpoint,
        error: RpcError,
    },
    Reconnected {
        attempt: u32,
        endpoint: Endpoint,
    },
    ReconnectExhausted {
        attempts: u32,
    },
    Negotiated {
        version: ProtocolVersion,
        server_software: String,
    },
    HeartbeatMissed {
        misses: u32,
    },
    /// The subscription registry gained or lost an entry.
    SubscriptionsChanged {
        active: usize,
    },
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub inflight_unary_count: usize,
    pub active_subscription_count: usize,
}

/// One active subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    pub method_path: String,
    pub identifier: Option<String>,
}

//! Router — correlates inbound frames with pending waiters.
//!
//! Unary waiters are keyed by request id and resolved exactly once. Stream
//! waiters are keyed by `(method path, identifier)` and fed every matching
//! push until they are cancelled.
//!
//! Routing rule for an inbound frame:
//! - `id` set, no `method` → unary response
//! - `method` set, no `id` → push notification; looked up first under the
//!   first string parameter as identifier, then with no identifier
//! - both or neither → malformed, dropped

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, RpcError};
use crate::request::{Envelope, RpcId};

/// A raw frame or the error that replaced it.
pub type RawResult = Result<String, RpcError>;

/// Matches an inbound frame to its waiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    Unary(RpcId),
    Stream {
        method: String,
        identifier: Option<String>,
    },
}

impl CorrelationKey {
    pub fn stream(method: impl Into<String>, identifier: Option<String>) -> Self {
        Self::Stream {
            method: method.into(),
            identifier,
        }
    }

    pub fn is_unary(&self) -> bool {
        matches!(self, Self::Unary(_))
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unary(id) => write!(f, "unary:{id}"),
            Self::Stream { method, identifier: Some(ident) } => write!(f, "stream:{method}:{ident}"),
            Self::Stream { method, identifier: None } => write!(f, "stream:{method}"),
        }
    }
}

/// Who is waiting under a key.
#[derive(Debug)]
pub enum PendingWaiter {
    Unary(oneshot::Sender<RawResult>),
    Stream(mpsc::UnboundedSender<RawResult>),
}

/// What [`Router::handle`] did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A unary waiter was resolved and removed.
    Resolved(CorrelationKey),
    /// The frame was pushed into a stream.
    Pushed(CorrelationKey),
    /// Well-formed, but nobody was waiting.
    Unmatched(CorrelationKey),
    /// Not JSON, or both/neither of `id` and `method`.
    Malformed,
}

/// Thread-safe waiter map.
#[derive(Debug, Default)]
pub struct Router {
    pending: Mutex<HashMap<CorrelationKey, PendingWaiter>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationKey, PendingWaiter>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a unary waiter. Returns the pending count.
    pub fn add_unary(&self, id: RpcId, tx: oneshot::Sender<RawResult>) -> Result<usize> {
        self.insert(CorrelationKey::Unary(id), PendingWaiter::Unary(tx))
    }

    /// Register a stream waiter. Returns the pending count.
    pub fn add_stream(
        &self,
        key: CorrelationKey,
        tx: mpsc::UnboundedSender<RawResult>,
    ) -> Result<usize> {
        self.insert(key, PendingWaiter::Stream(tx))
    }

    fn insert(&self, key: CorrelationKey, waiter: PendingWaiter) -> Result<usize> {
        let mut pending = self.lock();
        if pending.contains_key(&key) {
            return Err(RpcError::DuplicateHandler {
                key: key.to_string(),
            });
        }
        pending.insert(key, waiter);
        Ok(pending.len())
    }

    /// Route one inbound frame.
    pub fn handle(&self, raw: &str) -> RouteOutcome {
        let Some(env) = Envelope::parse(raw) else {
            tracing::warn!(bytes = raw.len(), "dropping unparseable frame");
            return RouteOutcome::Malformed;
        };

        match (&env.id, &env.method) {
            (Some(id), None) => self.resolve_unary(CorrelationKey::Unary(id.clone()), raw),
            (None, Some(method)) => self.push_stream(method, env.first_string_param(), raw),
            _ => {
                tracing::warn!(bytes = raw.len(), "dropping frame with both or neither of id/method");
                RouteOutcome::Malformed
            }
        }
    }

    fn resolve_unary(&self, key: CorrelationKey, raw: &str) -> RouteOutcome {
        let waiter = self.lock().remove(&key);
        match waiter {
            Some(PendingWaiter::Unary(tx)) => {
                // The caller may have given up already; that is not an error.
                let _ = tx.send(Ok(raw.to_string()));
                RouteOutcome::Resolved(key)
            }
            Some(PendingWaiter::Stream(_)) | None => {
                tracing::debug!(%key, "no waiter for response");
                RouteOutcome::Unmatched(key)
            }
        }
    }

    fn push_stream(&self, method: &str, identifier: Option<&str>, raw: &str) -> RouteOutcome {
        let mut pending = self.lock();
        let specific = identifier.map(|ident| CorrelationKey::stream(method, Some(ident.to_string())));
        let key = match specific {
            Some(k) if pending.contains_key(&k) => k,
            _ => CorrelationKey::stream(method, None),
        };

        let delivered = match pending.get(&key) {
            Some(PendingWaiter::Stream(tx)) => tx.send(Ok(raw.to_string())).is_ok(),
            _ => {
                tracing::debug!(%key, "no subscriber for notification");
                return RouteOutcome::Unmatched(key);
            }
        };
        if !delivered {
            tracing::debug!(%key, "subscriber went away, removing stream");
            pending.remove(&key);
            return RouteOutcome::Unmatched(key);
        }
        RouteOutcome::Pushed(key)
    }

    /// Remove `key` and resolve or close its waiter with `error`
    /// (default [`RpcError::Cancelled`]). Returns the pending count.
    pub fn cancel(&self, key: &CorrelationKey, error: Option<RpcError>) -> usize {
        let mut pending = self.lock();
        if let Some(waiter) = pending.remove(key) {
            let error = error.unwrap_or(RpcError::Cancelled);
            match waiter {
                PendingWaiter::Unary(tx) => {
                    let _ = tx.send(Err(error));
                }
                PendingWaiter::Stream(tx) => {
                    let _ = tx.send(Err(error));
                }
            }
        }
        pending.len()
    }

    /// Resolve and remove every unary waiter with `error`. Stream entries
    /// stay registered and untouched. Returns how many were failed.
    pub fn fail_all(&self, error: RpcError) -> usize {
        let mut pending = self.lock();
        let keys: Vec<CorrelationKey> = pending.keys().filter(|k| k.is_unary()).cloned().collect();
        for key in &keys {
            if let Some(PendingWaiter::Unary(tx)) = pending.remove(key) {
                let _ = tx.send(Err(error.clone()));
            }
        }
        keys.len()
    }

    /// Push `error` as one item into every stream without removing it.
    pub fn notify_streams(&self, error: RpcError) -> usize {
        let pending = self.lock();
        pending
            .values()
            .filter_map(|w| match w {
                PendingWaiter::Stream(tx) => Some(tx),
                PendingWaiter::Unary(_) => None,
            })
            .filter(|tx| tx.send(Err(error.clone())).is_ok())
            .count()
    }

    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of pending entries of both kinds.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unary_count(&self) -> usize {
        self.lock().keys().filter(|k| k.is_unary()).count()
    }

    pub fn stream_count(&self) -> usize {
        self.lock().keys().filter(|k| !k.is_unary()).count()
    }
}

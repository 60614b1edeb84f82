//! Subscription registry and the consumer-facing update stream.
//!
//! The registry keeps the original encoded request of every active
//! subscription so it can be replayed verbatim on a new transport. An entry
//! lives exactly as long as its [`SubscriptionStream`]: dropping the stream,
//! or cancelling it through a [`SubscriptionHandle`], removes the entry,
//! closes the router stream and fires the unsubscribe request if the method
//! has one.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use electrumrpc_core::codec::decode_notification;
use electrumrpc_core::error::{Result, RpcError};
use electrumrpc_core::{CorrelationKey, RawResult};

use crate::client::ClientInner;
use crate::diagnostics::SubscriptionInfo;

/// A subscription as it was first sent.
#[derive(Debug, Clone)]
pub(crate) struct StoredSubscription {
    pub method_path: String,
    pub identifier: Option<String>,
    /// Encoded request, replayed byte-for-byte after a reconnect.
    pub frame: String,
}

/// Active subscriptions in registration order.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    entries: Mutex<Vec<(CorrelationKey, StoredSubscription)>>,
}

impl SubscriptionRegistry {
    fn lock(&self) -> MutexGuard<'_, Vec<(CorrelationKey, StoredSubscription)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an entry. Returns the number of active subscriptions.
    pub fn insert(&self, key: CorrelationKey, entry: StoredSubscription) -> usize {
        let mut entries = self.lock();
        entries.retain(|(k, _)| *k != key);
        entries.push((key, entry));
        entries.len()
    }

    /// Remove `key`. Returns the remaining count if something was removed.
    pub fn remove(&self, key: &CorrelationKey) -> Option<usize> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(k, _)| k != key);
        (entries.len() != before).then_some(entries.len())
    }

    pub fn frames(&self) -> Vec<String> {
        self.lock().iter().map(|(_, s)| s.frame.clone()).collect()
    }

    pub fn list(&self) -> Vec<SubscriptionInfo> {
        self.lock()
            .iter()
            .map(|(_, s)| SubscriptionInfo {
                method_path: s.method_path.clone(),
                identifier: s.identifier.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Tears one subscription down, at most once.
pub(crate) struct Terminator {
    client: Weak<ClientInner>,
    key: CorrelationKey,
    unsubscribe: Option<(&'static str, Vec<Value>)>,
    done: AtomicBool,
}

impl Terminator {
    pub fn new(
        client: Weak<ClientInner>,
        key: CorrelationKey,
        unsubscribe: Option<(&'static str, Vec<Value>)>,
    ) -> Self {
        Self {
            client,
            key,
            unsubscribe,
            done: AtomicBool::new(false),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Remove the subscription and tell the server.
    pub fn finish(&self) {
        self.teardown(true);
    }

    /// Remove the subscription without an unsubscribe request.
    pub fn abort(&self) {
        self.teardown(false);
    }

    fn teardown(&self, unsubscribe: bool) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(client) = self.client.upgrade() else {
            return;
        };
        client.forget_subscription(&self.key);

        if !unsubscribe {
            return;
        }
        let Some((path, params)) = self.unsubscribe.clone() else {
            return;
        };
        // Drop can run outside a runtime; the server then simply keeps
        // pushing until the connection goes away.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    client.fire_and_forget(path, params).await;
                });
            }
            Err(_) => tracing::debug!(key = %self.key, "no runtime, skipping unsubscribe"),
        }
    }
}

impl Drop for Terminator {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Cancels a subscription from anywhere.
#[derive(Clone)]
pub struct SubscriptionHandle {
    terminator: Arc<Terminator>,
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        self.terminator.finish();
    }

    pub fn is_cancelled(&self) -> bool {
        self.terminator.is_done()
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.terminator.key)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Decoded push notifications of one subscription.
///
/// A lost connection shows up as one `Err(ConnectionClosed)` item; the
/// stream stays open and resumes once the subscription has been replayed
/// on the next transport. The stream ends after a cancel.
pub struct SubscriptionStream<N> {
    rx: mpsc::UnboundedReceiver<RawResult>,
    path: &'static str,
    terminator: Arc<Terminator>,
    _notification: PhantomData<fn() -> N>,
}

impl<N> SubscriptionStream<N> {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<RawResult>,
        path: &'static str,
        terminator: Arc<Terminator>,
    ) -> Self {
        Self {
            rx,
            path,
            terminator,
            _notification: PhantomData,
        }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            terminator: self.terminator.clone(),
        }
    }

    pub fn cancel(&self) {
        self.terminator.finish();
    }

    pub fn method_path(&self) -> &'static str {
        self.path
    }
}

impl<N: DeserializeOwned> Stream for SubscriptionStream<N> {
    type Item = Result<N>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(raw))) => Poll::Ready(Some(decode_notification(&raw, self.path))),
            Poll::Ready(Some(Err(RpcError::Cancelled))) if self.terminator.is_done() => {
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<N> Drop for SubscriptionStream<N> {
    fn drop(&mut self) {
        self.terminator.finish();
    }
}

/// Result of [`Client::subscribe`](crate::Client::subscribe): the initial
/// response plus the update stream.
pub struct Subscription<T, N> {
    pub initial: T,
    pub updates: SubscriptionStream<N>,
}

impl<T, N> Subscription<T, N> {
    pub fn handle(&self) -> SubscriptionHandle {
        self.updates.handle()
    }

    pub fn cancel(&self) {
        self.updates.cancel();
    }
}

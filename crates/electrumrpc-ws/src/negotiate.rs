//! Protocol negotiation, once per transport.
//!
//! The first caller on a fresh transport runs the `server.version`
//! handshake; callers arriving while it is in flight await the same future.
//! A successful session is cached until [`Negotiator::invalidate`] is called
//! for the next transport. An empty version intersection is permanent for
//! the transport; any other failure leaves the negotiator idle so the next
//! caller retries.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;

use electrumrpc_core::error::{Result, RpcError};
use electrumrpc_core::methods::ServerFeatures;
use electrumrpc_core::{ProtocolVersion, VersionRange};

/// What was agreed with the server on the current transport.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedSession {
    pub protocol_version: ProtocolVersion,
    pub server_software: String,
    pub server_features: Option<ServerFeatures>,
    /// Raw handshake response, replayed to callers of `server.version`.
    pub(crate) handshake_frame: String,
}

type Handshake = Shared<BoxFuture<'static, Result<NegotiatedSession>>>;

enum Phase {
    Idle,
    InFlight(Handshake),
    Ready(NegotiatedSession),
    Failed(RpcError),
}

struct NegotiatorState {
    generation: u64,
    phase: Phase,
}

pub struct Negotiator {
    client_range: VersionRange,
    state: Arc<Mutex<NegotiatorState>>,
}

impl Negotiator {
    pub fn new(client_range: VersionRange) -> Self {
        Self {
            client_range,
            state: Arc::new(Mutex::new(NegotiatorState {
                generation: 0,
                phase: Phase::Idle,
            })),
        }
    }

    pub fn client_range(&self) -> &VersionRange {
        &self.client_range
    }

    fn lock(&self) -> MutexGuard<'_, NegotiatorState> {
        lock_state(&self.state)
    }

    /// Return the session, running `handshake` only if no session exists
    /// and none is being negotiated.
    pub async fn ensure<F>(&self, handshake: F) -> Result<NegotiatedSession>
    where
        F: FnOnce() -> BoxFuture<'static, Result<NegotiatedSession>>,
    {
        let flight = {
            let mut st = self.lock();
            let existing = match &st.phase {
                Phase::Ready(session) => return Ok(session.clone()),
                Phase::Failed(err) => return Err(err.clone()),
                Phase::InFlight(flight) => Some(flight.clone()),
                Phase::Idle => None,
            };
            match existing {
                Some(flight) => flight,
                None => {
                    let generation = st.generation;
                    let state = self.state.clone();
                    let inner = handshake();
                    let flight = async move {
                        let result = inner.await;
                        settle(&state, generation, &result);
                        result
                    }
                    .boxed()
                    .shared();
                    st.phase = Phase::InFlight(flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    /// Forget everything negotiated on the previous transport.
    pub fn invalidate(&self) {
        let mut st = self.lock();
        st.generation += 1;
        st.phase = Phase::Idle;
    }

    /// The cached session, if negotiation has completed.
    pub fn session(&self) -> Option<NegotiatedSession> {
        match &self.lock().phase {
            Phase::Ready(session) => Some(session.clone()),
            _ => None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.lock().phase, Phase::InFlight(_))
    }
}

fn lock_state(state: &Mutex<NegotiatorState>) -> MutexGuard<'_, NegotiatorState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Record a finished handshake unless the transport changed meanwhile.
fn settle(state: &Mutex<NegotiatorState>, generation: u64, result: &Result<NegotiatedSession>) {
    let mut st = lock_state(state);
    if st.generation != generation {
        return;
    }
    st.phase = match result {
        Ok(session) => Phase::Ready(session.clone()),
        Err(err @ RpcError::IncompatibleProtocol { .. }) => Phase::Failed(err.clone()),
        Err(_) => Phase::Idle,
    };
}

/// Pick the highest version both sides support from a `server.version`
/// reply of `[server_software, protocol]`.
pub fn agree(
    client: &VersionRange,
    (server_software, protocol): &(String, Value),
) -> Result<ProtocolVersion> {
    let incompatible = || RpcError::IncompatibleProtocol {
        client: client.to_string(),
        server: protocol.to_string(),
    };
    let server = VersionRange::from_reply(protocol).ok_or_else(incompatible)?;
    let version = client.highest_common(&server).ok_or_else(incompatible)?;
    tracing::info!(%version, server = %server_software, "protocol negotiated");
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn v(s: &str) -> ProtocolVersion {
        s.parse().unwrap()
    }

    fn session(version: &str) -> NegotiatedSession {
        NegotiatedSession {
            protocol_version: v(version),
            server_software: "Fulcrum 1.9.1".into(),
            server_features: None,
            handshake_frame: String::new(),
        }
    }

    #[test]
    fn agrees_on_highest_common_version() {
        let client = VersionRange::new(v("1.4"), v("1.5.3"));
        let reply = ("Fulcrum 1.9.1".to_string(), serde_json::json!(["1.4", "1.5.1"]));
        assert_eq!(agree(&client, &reply).unwrap(), v("1.5.1"));

        let single = ("ElectrumX 1.16".to_string(), serde_json::json!("1.4.2"));
        assert_eq!(agree(&client, &single).unwrap(), v("1.4.2"));
    }

    #[test]
    fn bounds_are_inclusive() {
        let client = VersionRange::new(v("1.4"), v("1.5"));
        let reply = ("x".to_string(), serde_json::json!(["1.5", "1.6"]));
        assert_eq!(agree(&client, &reply).unwrap(), v("1.5"));
    }

    #[test]
    fn disjoint_ranges_are_incompatible() {
        let client = VersionRange::new(v("1.4"), v("1.5.3"));
        let reply = ("old".to_string(), serde_json::json!(["1.0", "1.2"]));
        assert!(matches!(
            agree(&client, &reply),
            Err(RpcError::IncompatibleProtocol { .. })
        ));
        let garbage = ("old".to_string(), serde_json::json!({"v": 1}));
        assert!(agree(&client, &garbage).is_err());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_handshake() {
        let neg = Negotiator::new(VersionRange::default());
        let runs = Arc::new(AtomicUsize::new(0));

        let start = |runs: Arc<AtomicUsize>| {
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, RpcError>(session("1.5"))
                }
                .boxed()
            }
        };

        let (a, b) = tokio::join!(neg.ensure(start(runs.clone())), neg.ensure(start(runs.clone())));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(neg.session().is_some());

        // Cached from here on.
        neg.ensure(start(runs.clone())).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failure_allows_retry() {
        let neg = Negotiator::new(VersionRange::default());
        let err = neg
            .ensure(|| async { Err::<NegotiatedSession, _>(RpcError::NotConnected) }.boxed())
            .await;
        assert!(err.is_err());
        assert!(!neg.is_in_flight());

        let ok = neg.ensure(|| async { Ok::<_, RpcError>(session("1.4")) }.boxed()).await;
        assert_eq!(ok.unwrap().protocol_version, v("1.4"));
    }

    #[tokio::test]
    async fn incompatibility_is_permanent_until_invalidated() {
        let neg = Negotiator::new(VersionRange::default());
        let incompatible = || {
            async {
                Err::<NegotiatedSession, _>(RpcError::IncompatibleProtocol {
                    client: "1.4-1.5.3".into(),
                    server: "1.0".into(),
                })
            }
            .boxed()
        };
        assert!(neg.ensure(incompatible).await.is_err());

        let again = neg.ensure(|| async { Ok::<_, RpcError>(session("1.5")) }.boxed()).await;
        assert!(matches!(again, Err(RpcError::IncompatibleProtocol { .. })));

        neg.invalidate();
        assert!(neg.ensure(|| async { Ok::<_, RpcError>(session("1.5")) }.boxed()).await.is_ok());
    }

    #[tokio::test]
    async fn stale_handshake_is_not_cached() {
        let neg = Arc::new(Negotiator::new(VersionRange::default()));
        let n = neg.clone();
        let pending = tokio::spawn(async move {
            n.ensure(|| {
                async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok::<_, RpcError>(session("1.4"))
                }
                .boxed()
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        neg.invalidate();

        assert!(pending.await.unwrap().is_ok());
        assert!(neg.session().is_none());
    }
}

//! Reconnector: backoff, endpoint rotation and attempt accounting.
//!
//! One call to [`Reconnector::run`] is one episode. Attempt `n` (zero-based)
//! sleeps `min(base * 2^n, max) * jitter`, then connects to candidate
//! `n % candidates.len()`. The first success ends the episode; running out
//! of attempts fails it with [`RpcError::ReconnectExhausted`]. Errors that
//! reconnecting cannot fix end the episode at once, and so does
//! [`Reconnector::stop`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use electrumrpc_core::error::{Result, RpcError};
use electrumrpc_core::transport::{Connector, EventSink, Transport};
use electrumrpc_core::{BackoffPolicy, Endpoint, ReconnectConfig};

use crate::diagnostics::ClientEvent;

/// Whether an episode opens the first connection or replaces a lost one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Episode {
    /// First connection: no delay before the first attempt, not counted.
    Initial,
    Reconnect,
}

#[derive(Debug)]
pub struct Reconnector {
    policy: BackoffPolicy,
    connection_timeout: Duration,
    attempts: AtomicU64,
    successes: AtomicU64,
    stopped: AtomicBool,
}

impl Reconnector {
    pub fn new(config: ReconnectConfig, connection_timeout: Duration) -> Self {
        Self {
            policy: BackoffPolicy::new(config),
            connection_timeout,
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// End the running episode at its next step and refuse new ones.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Reconnect attempts made so far, across episodes.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Reconnect episodes that ended in a connection.
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Run one episode.
    ///
    /// `sink` is called once per attempt for a fresh event sink; `observe`
    /// sees every attempt and outcome.
    pub async fn run(
        &self,
        episode: Episode,
        connector: &dyn Connector,
        candidates: &[Endpoint],
        mut sink: impl FnMut() -> EventSink,
        observe: impl Fn(ClientEvent),
    ) -> Result<Arc<dyn Transport>> {
        if candidates.is_empty() {
            return Err(RpcError::InvalidConfig("no servers to connect to".into()));
        }

        let mut attempt: u32 = 0;
        loop {
            if self.is_stopped() {
                return Err(stopped());
            }
            if !self.policy.allows(attempt) {
                tracing::error!(attempts = attempt, "reconnect attempts exhausted");
                observe(ClientEvent::ReconnectExhausted { attempts: attempt });
                return Err(RpcError::ReconnectExhausted { attempts: attempt });
            }

            let endpoint = &candidates[attempt as usize % candidates.len()];
            let delay = match (episode, attempt) {
                (Episode::Initial, 0) => Duration::ZERO,
                _ => self.policy.delay(attempt),
            };
            tracing::info!(attempt, url = %endpoint, ?delay, "connection attempt");
            observe(ClientEvent::ReconnectAttempt {
                attempt,
                endpoint: endpoint.clone(),
                delay,
            });
            tokio::time::sleep(delay).await;
            if self.is_stopped() {
                return Err(stopped());
            }

            if episode == Episode::Reconnect {
                self.attempts.fetch_add(1, Ordering::Relaxed);
            }

            let outcome = tokio::time::timeout(self.connection_timeout, connector.connect(endpoint, sink()))
                .await
                .unwrap_or_else(|_| {
                    Err(RpcError::SetupFailed {
                        url: endpoint.to_string(),
                        reason: format!("timed out after {:?}", self.connection_timeout),
                    })
                });

            match outcome {
                Ok(transport) if self.is_stopped() => {
                    transport.disconnect("client shutdown").await;
                    return Err(stopped());
                }
                Ok(transport) => {
                    if episode == Episode::Reconnect {
                        self.successes.fetch_add(1, Ordering::Relaxed);
                    }
                    tracing::info!(attempt, url = %endpoint, "connection established");
                    observe(ClientEvent::Reconnected {
                        attempt,
                        endpoint: endpoint.clone(),
                    });
                    return Ok(transport);
                }
                Err(error) => {
                    tracing::warn!(attempt, url = %endpoint, %error, kind = %error.kind(), "connection attempt failed");
                    let retryable = error.is_retryable();
                    observe(ClientEvent::ReconnectFailed {
                        attempt,
                        endpoint: endpoint.clone(),
                        error: error.clone(),
                    });
                    if !retryable {
                        return Err(error);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

fn stopped() -> RpcError {
    RpcError::ConnectionClosed {
        code: Some(1000),
        reason: "client shutdown".into(),
    }
}

/// Order endpoints for an episode: `preferred` (usually the endpoint that
/// was just lost) first, then the configured servers, without duplicates.
pub fn candidate_order(preferred: Option<&Endpoint>, servers: &[Endpoint]) -> Vec<Endpoint> {
    let mut out: Vec<Endpoint> = Vec::with_capacity(servers.len() + 1);
    for ep in preferred.into_iter().chain(servers) {
        if !out.contains(ep) {
            out.push(ep.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use electrumrpc_core::transport::TransportId;
    use electrumrpc_core::ConnectionState;
    use tokio::sync::mpsc;

    struct StubTransport {
        id: TransportId,
        endpoint: Endpoint,
    }

    #[async_trait]
    impl Transport for StubTransport {
        fn id(&self) -> TransportId {
            self.id
        }
        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }
        fn state(&self) -> ConnectionState {
            ConnectionState::Connected
        }
        async fn send(&self, _frame: String) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self, _reason: &str) {}
    }

    /// Fails the first `failures` connects with `error`, records every
    /// endpoint tried.
    struct FlakyConnector {
        failures: Mutex<u32>,
        error: fn(&Endpoint) -> RpcError,
        tried: Mutex<Vec<String>>,
    }

    impl FlakyConnector {
        fn new(failures: u32) -> Self {
            Self::failing_with(failures, |endpoint| RpcError::SetupFailed {
                url: endpoint.to_string(),
                reason: "refused".into(),
            })
        }

        fn failing_with(failures: u32, error: fn(&Endpoint) -> RpcError) -> Self {
            Self {
                failures: Mutex::new(failures),
                error,
                tried: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, endpoint: &Endpoint, sink: EventSink) -> Result<Arc<dyn Transport>> {
            self.tried.lock().unwrap().push(endpoint.to_string());
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err((self.error)(endpoint));
            }
            Ok(Arc::new(StubTransport {
                id: sink.transport(),
                endpoint: endpoint.clone(),
            }))
        }
    }

    fn fast(max_attempts: i32) -> Reconnector {
        Reconnector::new(
            ReconnectConfig {
                max_attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                jitter_range: (1.0, 1.0),
            },
            Duration::from_secs(1),
        )
    }

    fn eps(urls: &[&str]) -> Vec<Endpoint> {
        urls.iter().map(|u| Endpoint::parse(u).unwrap()).collect()
    }

    fn sink() -> EventSink {
        let (tx, _rx) = mpsc::unbounded_channel();
        EventSink::new(1, tx)
    }

    #[tokio::test]
    async fn rotates_until_success() {
        let r = fast(5);
        let conn = FlakyConnector::new(2);
        let candidates = eps(&["wss://a.example:1", "wss://b.example:1", "wss://c.example:1"]);

        let t = r
            .run(Episode::Reconnect, &conn, &candidates, sink, |_| {})
            .await
            .unwrap();
        assert_eq!(t.endpoint(), &candidates[2]);
        assert_eq!(
            *conn.tried.lock().unwrap(),
            vec!["wss://a.example:1/", "wss://b.example:1/", "wss://c.example:1/"]
        );
        assert_eq!(r.attempts(), 3);
        assert_eq!(r.successes(), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let r = fast(3);
        let conn = FlakyConnector::new(100);
        let candidates = eps(&["wss://a.example:1", "wss://b.example:1"]);

        let err = r
            .run(Episode::Reconnect, &conn, &candidates, sink, |_| {})
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RpcError::ReconnectExhausted { attempts: 3 }));
        assert_eq!(conn.tried.lock().unwrap().len(), 3);
        assert_eq!(r.successes(), 0);
    }

    #[tokio::test]
    async fn unlimited_keeps_trying() {
        let r = fast(0);
        let conn = FlakyConnector::new(12);
        let candidates = eps(&["wss://a.example:1"]);
        r.run(Episode::Reconnect, &conn, &candidates, sink, |_| {})
            .await
            .unwrap();
        assert_eq!(conn.tried.lock().unwrap().len(), 13);
    }

    #[tokio::test]
    async fn reports_every_attempt() {
        let r = fast(4);
        let conn = FlakyConnector::new(1);
        let candidates = eps(&["wss://a.example:1", "wss://b.example:1"]);
        let seen = Mutex::new(Vec::new());

        r.run(Episode::Reconnect, &conn, &candidates, sink, |ev| {
            seen.lock().unwrap().push(ev)
        })
        .await
        .unwrap();

        let seen = seen.into_inner().unwrap();
        assert!(matches!(seen[0], ClientEvent::ReconnectAttempt { attempt: 0, delay, .. } if delay == Duration::from_millis(1)));
        assert!(matches!(seen[1], ClientEvent::ReconnectFailed { attempt: 0, .. }));
        assert!(matches!(seen[2], ClientEvent::ReconnectAttempt { attempt: 1, delay, .. } if delay == Duration::from_millis(2)));
        assert!(matches!(seen[3], ClientEvent::Reconnected { attempt: 1, .. }));
    }

    #[tokio::test]
    async fn initial_episode_is_not_counted() {
        let r = fast(2);
        let conn = FlakyConnector::new(0);
        let candidates = eps(&["wss://a.example:1"]);
        r.run(Episode::Initial, &conn, &candidates, sink, |_| {})
            .await
            .unwrap();
        assert_eq!(r.attempts(), 0);
        assert_eq!(r.successes(), 0);
    }

    #[tokio::test]
    async fn empty_candidates_rejected() {
        let r = fast(2);
        let conn = FlakyConnector::new(0);
        let err = r.run(Episode::Reconnect, &conn, &[], sink, |_| {}).await.err().unwrap();
        assert!(matches!(err, RpcError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn unfixable_errors_end_the_episode() {
        let r = fast(5);
        let conn = FlakyConnector::failing_with(100, |endpoint| {
            RpcError::InvalidConfig(format!("bad endpoint {endpoint}"))
        });
        let candidates = eps(&["wss://a.example:1", "wss://b.example:1"]);

        let err = r
            .run(Episode::Reconnect, &conn, &candidates, sink, |_| {})
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RpcError::InvalidConfig(_)));
        assert_eq!(conn.tried.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stop_ends_an_unlimited_episode() {
        let r = Arc::new(fast(0));
        let conn = Arc::new(FlakyConnector::new(u32::MAX));
        let candidates = eps(&["wss://a.example:1"]);

        let (runner, c) = (r.clone(), conn.clone());
        let episode = tokio::spawn(async move {
            runner
                .run(Episode::Reconnect, c.as_ref(), &candidates, sink, |_| {})
                .await
                .err()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        r.stop();

        let err = episode.await.unwrap().unwrap();
        assert!(matches!(err, RpcError::ConnectionClosed { code: Some(1000), .. }));
        let tried = conn.tried.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.tried.lock().unwrap().len(), tried);
    }

    #[tokio::test]
    async fn stopped_reconnector_drops_a_late_connection() {
        let r = fast(3);
        r.stop();
        let conn = FlakyConnector::new(0);
        let err = r
            .run(Episode::Reconnect, &conn, &eps(&["wss://a.example:1"]), sink, |_| {})
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RpcError::ConnectionClosed { .. }));
        assert!(conn.tried.lock().unwrap().is_empty());
    }

    #[test]
    fn preferred_endpoint_first_without_duplicates() {
        let servers = eps(&["wss://a.example:1", "wss://manual.example:1", "wss://b.example:1"]);
        let previous = Endpoint::parse("wss://b.example:1").unwrap();

        let order = candidate_order(Some(&previous), &servers);
        let urls: Vec<&str> = order.iter().map(Endpoint::as_str).collect();
        assert_eq!(
            urls,
            vec!["wss://b.example:1/", "wss://a.example:1/", "wss://manual.example:1/"]
        );
        assert_eq!(candidate_order(None, &servers), servers);
    }
}

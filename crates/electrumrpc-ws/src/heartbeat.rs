//! Heartbeat: detects connections that died without closing.
//!
//! Every `interval` the task pings the current transport with its own short
//! timeout. More than `tolerance` consecutive misses replaces the transport
//! and fails pending unary calls with [`RpcError::HeartbeatTimeout`]. When
//! the replacement fails too, the heartbeat stops.

use std::sync::Weak;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use electrumrpc_core::error::RpcError;
use electrumrpc_core::methods::ServerPing;
use electrumrpc_core::HeartbeatConfig;

use crate::client::{CallOptions, ClientInner, Trigger};
use crate::diagnostics::ClientEvent;

pub(crate) fn spawn(client: Weak<ClientInner>, config: HeartbeatConfig) -> JoinHandle<()> {
    tokio::spawn(run(client, config))
}

async fn run(client: Weak<ClientInner>, config: HeartbeatConfig) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    let mut misses: u32 = 0;
    loop {
        ticker.tick().await;
        let Some(client) = client.upgrade() else {
            return;
        };
        if client.is_shutting_down() {
            return;
        }
        // Nothing to watch while disconnected; the reconnect path owns that.
        let Some(transport) = client.live_transport() else {
            continue;
        };

        match client
            .call(&ServerPing, CallOptions::default().with_timeout(config.timeout))
            .await
        {
            Ok(()) => {
                if misses > 0 {
                    tracing::debug!(transport, "heartbeat recovered");
                }
                misses = 0;
            }
            Err(error) => {
                misses += 1;
                tracing::warn!(transport, misses, %error, "heartbeat missed");
                client.emit(ClientEvent::HeartbeatMissed { misses });
                if misses <= config.tolerance {
                    continue;
                }

                match client
                    .reconnect_episode(Trigger::Heartbeat { transport, misses }, "heartbeat missed")
                    .await
                {
                    Ok(()) => misses = 0,
                    Err(error) => {
                        let failed = client.router().fail_all(RpcError::HeartbeatTimeout { misses });
                        tracing::error!(misses, failed, %error, "heartbeat giving up");
                        return;
                    }
                }
            }
        }
    }
}

//! Liveness enforcement for every managed socket.
//!
//! Two timers, deliberately independent:
//!
//! - each socket's **writer task** sends a WS ping every `ping_interval_secs`
//!   (20 s default) — see `relay::ws`;
//! - the **reaper** spawned here ticks every `pong_timeout_secs` (30 s
//!   default) and terminates any socket whose last pong is older than the
//!   window, invoking the owner's cleanup through its shutdown handle.
//!
//! Because the reaper only looks at pong receipt times, a ping that was just
//! sent can never mask a missed pong.

use tracing::warn;

use super::registry::CloseReason;
use super::RelayState;

/// Spawn the periodic reaper. Aborted on relay shutdown.
pub fn spawn_reaper(state: RelayState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let timeout_ms = state.config.relay.pong_timeout_secs * 1000;
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            state.config.relay.pong_timeout_secs,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;

            for (tunnel_id, shutdown) in state.tunnels.stale_connections(timeout_ms).await {
                warn!(tunnel_id = %tunnel_id, "Reaping workstation socket (pong timeout)");
                let _ = shutdown.send(CloseReason::DeadPeer);
            }

            for (key, subscriber_id, shutdown) in
                state.streams.stale_subscribers(timeout_ms).await
            {
                warn!(
                    stream = %key,
                    subscriber = %subscriber_id,
                    "Reaping stream subscriber (pong timeout)"
                );
                let _ = shutdown.send(CloseReason::DeadPeer);
                // The handler unregisters on exit; remove eagerly in case it
                // is already gone and nothing will run the cleanup.
                state.streams.unregister(&key, &subscriber_id).await;
            }
        }
    })
}

//! Public relay — the only publicly addressable process.
//!
//! Bridges mobile clients and workstation agents: tunnel registration and
//! lifetime (`registry`), HTTP request/response framing over the workstation
//! WebSocket (`proxy` + `frames`), multi-stream fan-out (`streams`), and
//! heartbeat-driven liveness (`heartbeat`).

pub mod frames;
pub mod heartbeat;
pub mod proxy;
pub mod registry;
pub mod streams;
pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{any, get, post};
use axum::Router;

use crate::config::Config;
use proxy::PendingRequests;
use registry::TunnelRegistry;
use streams::StreamRegistry;

/// Shared relay state passed to every handler via Axum's `State` extractor.
///
/// Three process-wide stores live here (tunnels, streams, pending requests);
/// nothing outside their owning modules mutates them.
#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<Config>,
    pub tunnels: TunnelRegistry,
    pub streams: StreamRegistry,
    pub pending: PendingRequests,
    pub start_time: Instant,
}

impl RelayState {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            tunnels: TunnelRegistry::new(),
            streams: StreamRegistry::new(),
            pending: PendingRequests::new(),
            start_time: Instant::now(),
        }
    }

    /// The static registration key. Relay mode validates its presence at
    /// startup, so this never panics in a running relay.
    pub fn registration_key(&self) -> &str {
        self.config
            .relay
            .registration_api_key
            .as_deref()
            .unwrap_or_default()
    }

    /// Build the relay router with all endpoints.
    ///
    /// The wildcard proxy route is registered last; the more specific stream
    /// and SSE routes win during matching.
    pub fn router(self) -> Router {
        Router::new()
            .route("/tunnel/create", post(proxy::create_tunnel))
            .route(
                "/tunnel/{tunnel_id}",
                get(ws::tunnel_ws).delete(proxy::delete_tunnel),
            )
            .route("/health", get(proxy::health))
            .route(
                "/api/{tunnel_id}/terminal/{session_id}/stream",
                get(ws::terminal_stream_ws),
            )
            .route(
                "/api/{tunnel_id}/recording/{session_id}/stream",
                get(ws::recording_stream_ws),
            )
            .route(
                "/api/{tunnel_id}/recording/{session_id}/events",
                get(ws::recording_sse),
            )
            .route("/api/{tunnel_id}/agent/ws", get(ws::agent_ws))
            .route("/api/{tunnel_id}/{*path}", any(proxy::proxy_request))
            .with_state(self)
    }

    /// Drain everything for shutdown: sockets closed with 1001, pending
    /// requests resolved `504`, registries cleared.
    pub async fn shutdown(&self) {
        self.tunnels.shutdown_all().await;
        self.streams.shutdown_all().await;
        self.pending.drain_all(504, "relay shutting down").await;
    }
}

//! WebSocket and SSE endpoints on the relay.
//!
//! ## Endpoints
//!
//! | Path | Peer | Notes |
//! |------|------|-------|
//! | `/tunnel/{tunnel_id}?api_key=…` | workstation | frames per `relay::frames` |
//! | `/api/{id}/terminal/{sid}/stream` | mobile | inbound `{type:"input"}` → `terminal_input` |
//! | `/api/{id}/recording/{sid}/stream` | mobile | server→client only |
//! | `/api/{id}/agent/ws` | mobile | payloads wrapped as `agent_request` |
//! | `/api/{id}/recording/{sid}/events` | mobile | SSE mirror of the recording stream |
//!
//! Every WS connection funnels outbound payloads through a bounded mpsc
//! drained by a writer task that also owns the 20 s ping cadence; pongs update
//! the connection's atomic timestamp for the reaper.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path as AxumPath, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
};
use futures::stream::Stream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{info, info_span, warn, Instrument};

use super::frames;
use super::registry::CloseReason;
use super::streams::{stream_key, StreamKind, Subscriber};
use super::RelayState;
use crate::protocol;

/// Query params for the workstation tunnel socket.
#[derive(Deserialize)]
pub struct TunnelWsQuery {
    pub api_key: String,
}

/// `GET /tunnel/{tunnel_id}?api_key=…` — workstation socket upgrade.
pub async fn tunnel_ws(
    State(state): State<RelayState>,
    AxumPath(tunnel_id): AxumPath<String>,
    Query(query): Query<TunnelWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.tunnels.verify_api_key(&tunnel_id, &query.api_key).await {
        None => (StatusCode::NOT_FOUND, "Unknown tunnel").into_response(),
        Some(false) => (StatusCode::FORBIDDEN, "Invalid api key").into_response(),
        Some(true) => ws.on_upgrade(move |socket| {
            handle_station_socket(socket, state, tunnel_id.clone())
                .instrument(info_span!("tunnel", tunnel_id = %tunnel_id))
        }),
    }
}

/// Writer half of a managed socket: drains the payload queue, keeps the 20 s
/// ping cadence, and emits the close frame when the shutdown handle fires.
async fn writer_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Value>,
    mut shutdown: watch::Receiver<CloseReason>,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            payload = rx.recv() => {
                let Some(payload) = payload else { break };
                let text = serde_json::to_string(&payload).unwrap_or_default();
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => {
                let reason = *shutdown.borrow();
                let code = match reason {
                    CloseReason::Replaced => Some(1000),
                    CloseReason::Shutdown => Some(1001),
                    CloseReason::DeadPeer | CloseReason::None => None,
                };
                if let Some(code) = code {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: "".into(),
                        })))
                        .await;
                }
                break;
            }
        }
    }
}

/// Handle a registered workstation's socket until it closes or is replaced.
async fn handle_station_socket(socket: WebSocket, state: RelayState, tunnel_id: String) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Value>(256);
    let last_pong = Arc::new(AtomicU64::new(
        state.tunnels.epoch.elapsed().as_millis() as u64,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(CloseReason::None);

    let Some(generation) = state
        .tunnels
        .attach_socket(&tunnel_id, tx, last_pong.clone(), shutdown_tx)
        .await
    else {
        // Tunnel deleted between upgrade and attach
        return;
    };

    let ping_interval = Duration::from_secs(state.config.relay.ping_interval_secs);
    let mut reader_shutdown = shutdown_rx.clone();
    let writer = tokio::spawn(writer_loop(sink, rx, shutdown_rx, ping_interval));

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        frames::handle_station_frame(&state, &tunnel_id, &text).await;
                    }
                    Message::Pong(_) => {
                        let now = state.tunnels.epoch.elapsed().as_millis() as u64;
                        last_pong.store(now, Ordering::Relaxed);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = reader_shutdown.changed() => {
                info!("Workstation socket handler stopping ({:?})", *reader_shutdown.borrow());
                break;
            }
        }
    }

    // Detach (a replaced handler loses the race by generation) and fail any
    // requests that were in flight on this socket.
    if state.tunnels.detach_socket(&tunnel_id, generation).await {
        state
            .pending
            .drain_tunnel(&tunnel_id, 502, "workstation disconnected")
            .await;
    }
    let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
    info!("Workstation socket closed");
}

// ─── Mobile stream sockets ───────────────────────────────────────────────────

/// What to do with text frames arriving from a mobile subscriber.
enum InboundMode {
    /// Ignore everything (server→client stream).
    Ignore,
    /// `{type:"input", data}` → `terminal_input` frame to the workstation.
    TerminalInput { session_id: String },
    /// Whole payload wrapped as `agent_request` toward the workstation.
    AgentRequest { key: String },
}

/// `GET /api/{tunnel_id}/terminal/{session_id}/stream` — terminal fan-out plus
/// keystroke forwarding.
pub async fn terminal_stream_ws(
    State(state): State<RelayState>,
    AxumPath((tunnel_id, session_id)): AxumPath<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.tunnels.exists(&tunnel_id).await {
        return (StatusCode::NOT_FOUND, "Unknown tunnel").into_response();
    }
    let key = stream_key(&tunnel_id, Some(&session_id), StreamKind::Terminal);
    ws.on_upgrade(move |socket| {
        let span = info_span!("terminal_stream", tunnel_id = %tunnel_id, session_id = %session_id);
        handle_subscriber_socket(
            socket,
            state,
            tunnel_id.clone(),
            key,
            InboundMode::TerminalInput { session_id },
        )
        .instrument(span)
    })
}

/// `GET /api/{tunnel_id}/recording/{session_id}/stream` — recording fan-out.
pub async fn recording_stream_ws(
    State(state): State<RelayState>,
    AxumPath((tunnel_id, session_id)): AxumPath<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.tunnels.exists(&tunnel_id).await {
        return (StatusCode::NOT_FOUND, "Unknown tunnel").into_response();
    }
    let key = stream_key(&tunnel_id, Some(&session_id), StreamKind::Recording);
    ws.on_upgrade(move |socket| {
        let span = info_span!("recording_stream", tunnel_id = %tunnel_id, session_id = %session_id);
        handle_subscriber_socket(socket, state, tunnel_id, key, InboundMode::Ignore)
            .instrument(span)
    })
}

/// `GET /api/{tunnel_id}/agent/ws` — bidirectional agent stream.
pub async fn agent_ws(
    State(state): State<RelayState>,
    AxumPath(tunnel_id): AxumPath<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.tunnels.exists(&tunnel_id).await {
        return (StatusCode::NOT_FOUND, "Unknown tunnel").into_response();
    }
    let key = stream_key(&tunnel_id, None, StreamKind::Agent);
    ws.on_upgrade(move |socket| {
        let span = info_span!("agent_stream", tunnel_id = %tunnel_id);
        let mode = InboundMode::AgentRequest { key: key.clone() };
        handle_subscriber_socket(socket, state, tunnel_id, key, mode).instrument(span)
    })
}

/// Shared loop for mobile subscriber sockets.
async fn handle_subscriber_socket(
    socket: WebSocket,
    state: RelayState,
    tunnel_id: String,
    key: String,
    mode: InboundMode,
) {
    let subscriber_id = uuid::Uuid::new_v4().to_string();
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Value>(256);
    let last_pong = Arc::new(AtomicU64::new(
        state.streams.epoch.elapsed().as_millis() as u64,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(CloseReason::None);

    state
        .streams
        .register(
            &key,
            Subscriber {
                id: subscriber_id.clone(),
                tx,
                last_pong_ms: last_pong.clone(),
                shutdown: shutdown_tx,
            },
        )
        .await;

    let ping_interval = Duration::from_secs(state.config.relay.ping_interval_secs);
    let mut reader_shutdown = shutdown_rx.clone();
    let writer = tokio::spawn(writer_loop(sink, rx, shutdown_rx, ping_interval));

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let Ok(payload) = serde_json::from_str::<Value>(&text) else {
                            warn!("Dropping malformed subscriber message");
                            continue;
                        };
                        match &mode {
                            InboundMode::Ignore => {}
                            InboundMode::TerminalInput { session_id } => {
                                if payload["type"].as_str() == Some("input") {
                                    let data = payload["data"].as_str().unwrap_or("");
                                    let frame = protocol::terminal_input(session_id, data);
                                    state.tunnels.send_to_station(&tunnel_id, frame).await;
                                }
                            }
                            InboundMode::AgentRequest { key } => {
                                let frame = protocol::agent_request(&tunnel_id, key, payload);
                                state.tunnels.send_to_station(&tunnel_id, frame).await;
                            }
                        }
                    }
                    Message::Pong(_) => {
                        let now = state.streams.epoch.elapsed().as_millis() as u64;
                        last_pong.store(now, Ordering::Relaxed);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = reader_shutdown.changed() => break,
        }
    }

    state.streams.unregister(&key, &subscriber_id).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
    info!(stream = %key, "Subscriber disconnected");
}

// ─── SSE mirror ──────────────────────────────────────────────────────────────

/// `GET /api/{tunnel_id}/recording/{session_id}/events` — SSE recording feed.
///
/// Auth: `X-Laptop-Auth-Key` must equal the tunnel's registered client auth
/// key. SSE subscribers never pong; the reaper skips them (marker timestamp)
/// and their death is observed as a closed channel on broadcast.
pub async fn recording_sse(
    State(state): State<RelayState>,
    AxumPath((tunnel_id, session_id)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let Some(registered) = state.tunnels.client_auth_key(&tunnel_id).await else {
        return (StatusCode::NOT_FOUND, "Unknown tunnel").into_response();
    };
    let provided = crate::auth::client_auth_key(&headers);
    let authorized = match (registered, provided) {
        (Some(expected), Some(given)) => {
            crate::auth::constant_time_eq(expected.as_bytes(), given.as_bytes())
        }
        _ => false,
    };
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "Invalid auth key").into_response();
    }

    let subscriber_id = uuid::Uuid::new_v4().to_string();
    let key = stream_key(&tunnel_id, Some(&session_id), StreamKind::SseRecording);
    let (tx, rx) = mpsc::channel::<Value>(256);
    let (shutdown_tx, _) = watch::channel(CloseReason::None);
    state
        .streams
        .register(
            &key,
            Subscriber {
                id: subscriber_id.clone(),
                tx,
                last_pong_ms: Arc::new(AtomicU64::new(u64::MAX)),
                shutdown: shutdown_tx,
            },
        )
        .await;

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let payload = rx.recv().await?;
        let data = serde_json::to_string(&payload).unwrap_or_default();
        Some((
            Ok::<Event, Infallible>(Event::default().event("recording_output").data(data)),
            rx,
        ))
    });

    let guarded = UnregisterOnDrop {
        inner: Box::pin(stream),
        streams: state.streams.clone(),
        key,
        subscriber_id,
        done: false,
    };

    Sse::new(guarded)
        .keep_alive(KeepAlive::default().interval(Duration::from_secs(15)))
        .into_response()
}

/// Wrapper that removes the SSE subscription when the response stream drops.
struct UnregisterOnDrop<S> {
    inner: std::pin::Pin<Box<S>>,
    streams: super::streams::StreamRegistry,
    key: String,
    subscriber_id: String,
    done: bool,
}

impl<S: Stream<Item = Result<Event, Infallible>>> Stream for UnregisterOnDrop<S> {
    type Item = Result<Event, Infallible>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<S> Drop for UnregisterOnDrop<S> {
    fn drop(&mut self) {
        if !self.done {
            self.done = true;
            let streams = self.streams.clone();
            let key = std::mem::take(&mut self.key);
            let id = std::mem::take(&mut self.subscriber_id);
            tokio::spawn(async move {
                streams.unregister(&key, &id).await;
            });
        }
    }
}

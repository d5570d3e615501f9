//! Frame router — dispatches inbound workstation frames to pending HTTP
//! requests, the stream registry, or the TTS-ready broadcast.
//!
//! All frames are single JSON objects per WS message. Malformed JSON and
//! unknown `type` values are logged and dropped; the socket is never
//! disconnected over a bad frame.

use serde_json::{json, Value};
use tracing::warn;

use super::streams::{stream_key, StreamKind};
use super::RelayState;
use crate::util::now_ms;

/// Handle one text frame from a workstation socket.
pub async fn handle_station_frame(state: &RelayState, tunnel_id: &str, text: &str) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        warn!(tunnel_id = %tunnel_id, "Dropping malformed frame (invalid JSON)");
        return;
    };
    let frame_type = frame["type"].as_str().unwrap_or("");

    match frame_type {
        "http_response" => handle_http_response(state, tunnel_id, &frame).await,
        "client_auth_key" => {
            if let Some(key) = frame["key"].as_str() {
                state.tunnels.set_client_auth_key(tunnel_id, key).await;
            }
        }
        "terminal_output" => handle_terminal_output(state, tunnel_id, &frame).await,
        "recording_output" => handle_recording_output(state, tunnel_id, &frame).await,
        "tts_ready" => {
            if let Some(session_id) = frame["session_id"].as_str() {
                broadcast_recording(state, tunnel_id, session_id, &frame, true).await;
            }
        }
        "agent_request" => handle_agent_event(state, tunnel_id, &frame).await,
        other => {
            warn!(tunnel_id = %tunnel_id, frame_type = %other, "Unknown frame type (dropped)");
        }
    }
}

/// `http_response {request_id, status_code, body}` → resolve the pending
/// entry. Duplicate or unknown ids are logged and dropped.
async fn handle_http_response(state: &RelayState, tunnel_id: &str, frame: &Value) {
    let Some(request_id) = frame["request_id"].as_str() else {
        warn!(tunnel_id = %tunnel_id, "http_response without request_id (dropped)");
        return;
    };
    let status = frame["status_code"].as_u64().unwrap_or(200) as u16;
    let body = frame.get("body").cloned().unwrap_or(Value::Null);

    if !state.pending.resolve(request_id, status, body).await {
        warn!(
            tunnel_id = %tunnel_id,
            request_id,
            "Response for timed-out or unknown request (dropped)"
        );
    }
}

/// `terminal_output {session_id, data}` → terminal stream.
///
/// When `data` is itself a JSON object tagged `chat_message`, it is forwarded
/// verbatim so structured chat entries survive the hop; raw bytes are wrapped
/// in an `output` payload.
async fn handle_terminal_output(state: &RelayState, tunnel_id: &str, frame: &Value) {
    let Some(session_id) = frame["session_id"].as_str() else {
        return;
    };
    let data = frame["data"].as_str().unwrap_or("");
    let key = stream_key(tunnel_id, Some(session_id), StreamKind::Terminal);

    let payload = match serde_json::from_str::<Value>(data) {
        Ok(parsed)
            if parsed.is_object() && parsed["type"].as_str() == Some("chat_message") =>
        {
            parsed
        }
        _ => json!({
            "type": "output",
            "session_id": session_id,
            "data": data,
            "timestamp": now_ms(),
        }),
    };

    state.streams.broadcast(&key, &payload).await;
}

/// `recording_output {session_id, text, delta, raw?, timestamp?, is_complete?}`.
///
/// A completed, non-empty update becomes the canonical `tts_ready` trigger;
/// everything else is re-emitted as `recording_output` preserving
/// `is_complete` only when the workstation asserted it.
async fn handle_recording_output(state: &RelayState, tunnel_id: &str, frame: &Value) {
    let Some(session_id) = frame["session_id"].as_str() else {
        return;
    };
    let text = frame["text"].as_str().unwrap_or("");
    let is_complete = frame["is_complete"].as_bool();

    if is_complete == Some(true) && !text.is_empty() {
        let ready = json!({
            "type": "tts_ready",
            "session_id": session_id,
            "text": text,
            "timestamp": frame["timestamp"].as_u64().unwrap_or_else(now_ms),
        });
        broadcast_recording(state, tunnel_id, session_id, &ready, true).await;

        // Legacy clients trigger TTS off a completed recording_output; keep
        // feeding them when the compatibility flag is on.
        if state.config.relay.legacy_tts_trigger {
            broadcast_recording(state, tunnel_id, session_id, frame, true).await;
        }
        return;
    }

    let mut payload = json!({
        "type": "recording_output",
        "session_id": session_id,
        "text": text,
        "delta": frame["delta"].as_str().unwrap_or(""),
        "timestamp": frame["timestamp"].as_u64().unwrap_or_else(now_ms),
    });
    if let Some(raw) = frame.get("raw") {
        payload["raw"] = raw.clone();
    }
    if let Some(complete) = is_complete {
        payload["is_complete"] = json!(complete);
    }
    broadcast_recording(state, tunnel_id, session_id, &payload, false).await;
}

/// Deliver a recording payload to both the WS recording stream and the SSE
/// mirror. Terminal events (`reliable`) must survive slow-consumer drops.
async fn broadcast_recording(
    state: &RelayState,
    tunnel_id: &str,
    session_id: &str,
    payload: &Value,
    reliable: bool,
) {
    let ws_key = stream_key(tunnel_id, Some(session_id), StreamKind::Recording);
    let sse_key = stream_key(tunnel_id, Some(session_id), StreamKind::SseRecording);
    if reliable {
        state.streams.broadcast_reliable(&ws_key, payload).await;
        state.streams.broadcast_reliable(&sse_key, payload).await;
    } else {
        state.streams.broadcast(&ws_key, payload).await;
        state.streams.broadcast(&sse_key, payload).await;
    }
}

/// `agent_request {stream_key, payload}` (workstation → relay direction):
/// broadcast the payload to the agent stream subscribers.
async fn handle_agent_event(state: &RelayState, tunnel_id: &str, frame: &Value) {
    let Some(key) = frame["stream_key"].as_str() else {
        return;
    };
    // A workstation can only publish onto its own tunnel's streams.
    if !key.starts_with(tunnel_id) {
        warn!(tunnel_id = %tunnel_id, stream = %key, "agent_request for foreign stream (dropped)");
        return;
    }
    let payload = frame.get("payload").cloned().unwrap_or(Value::Null);
    state.streams.broadcast_reliable(key, &payload).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::relay::registry::CloseReason;
    use crate::relay::streams::Subscriber;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use tokio::sync::{mpsc, watch};

    async fn state() -> RelayState {
        let mut config = Config::default();
        config.relay.registration_api_key = Some("REG".to_string());
        RelayState::new(Arc::new(config))
    }

    async fn subscribe(
        state: &RelayState,
        tunnel: &str,
        session: Option<&str>,
        kind: StreamKind,
    ) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(16);
        let (shutdown, _) = watch::channel(CloseReason::None);
        state
            .streams
            .register(
                &stream_key(tunnel, session, kind),
                Subscriber {
                    id: uuid::Uuid::new_v4().to_string(),
                    tx,
                    last_pong_ms: Arc::new(AtomicU64::new(0)),
                    shutdown,
                },
            )
            .await;
        rx
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_dropped() {
        let state = state().await;
        handle_station_frame(&state, "t1", "not json at all").await;
        handle_station_frame(&state, "t1", r#"{"type":"mystery"}"#).await;
        handle_station_frame(&state, "t1", r#"{"no_type":1}"#).await;
    }

    #[tokio::test]
    async fn http_response_resolves_pending_once() {
        let state = state().await;
        let rx = state.pending.insert("r1", "t1").await;

        handle_station_frame(
            &state,
            "t1",
            r#"{"type":"http_response","request_id":"r1","status_code":201,"body":{"ok":true}}"#,
        )
        .await;
        let (status, body) = rx.await.unwrap();
        assert_eq!(status, 201);
        assert_eq!(body["ok"], true);

        // Duplicate is a no-op (logged and dropped)
        handle_station_frame(
            &state,
            "t1",
            r#"{"type":"http_response","request_id":"r1","status_code":500,"body":{}}"#,
        )
        .await;
    }

    #[tokio::test]
    async fn terminal_output_wraps_raw_bytes() {
        let state = state().await;
        let mut rx = subscribe(&state, "t1", Some("s1"), StreamKind::Terminal).await;

        handle_station_frame(
            &state,
            "t1",
            r#"{"type":"terminal_output","session_id":"s1","data":"$ ls\r\n"}"#,
        )
        .await;

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload["type"], "output");
        assert_eq!(payload["session_id"], "s1");
        assert_eq!(payload["data"], "$ ls\r\n");
        assert!(payload["timestamp"].as_u64().is_some());
    }

    #[tokio::test]
    async fn terminal_output_passes_chat_messages_verbatim() {
        let state = state().await;
        let mut rx = subscribe(&state, "t1", Some("s1"), StreamKind::Terminal).await;

        let chat = json!({"type": "chat_message", "content": "hi"}).to_string();
        let frame = json!({
            "type": "terminal_output",
            "session_id": "s1",
            "data": chat,
        });
        handle_station_frame(&state, "t1", &frame.to_string()).await;

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload["type"], "chat_message");
        assert_eq!(payload["content"], "hi");
    }

    #[tokio::test]
    async fn completed_recording_becomes_tts_ready() {
        let state = state().await;
        let mut ws_rx = subscribe(&state, "t1", Some("s1"), StreamKind::Recording).await;
        let mut sse_rx = subscribe(&state, "t1", Some("s1"), StreamKind::SseRecording).await;

        handle_station_frame(
            &state,
            "t1",
            r#"{"type":"recording_output","session_id":"s1","text":"done","delta":"done","is_complete":true}"#,
        )
        .await;

        let first = ws_rx.recv().await.unwrap();
        assert_eq!(first["type"], "tts_ready");
        assert_eq!(first["text"], "done");
        // Legacy trigger re-emits the completed recording_output afterwards
        let second = ws_rx.recv().await.unwrap();
        assert_eq!(second["type"], "recording_output");
        assert_eq!(second["is_complete"], true);

        assert_eq!(sse_rx.recv().await.unwrap()["type"], "tts_ready");
    }

    #[tokio::test]
    async fn completed_but_empty_text_stays_recording_output() {
        let state = state().await;
        let mut rx = subscribe(&state, "t1", Some("s1"), StreamKind::Recording).await;

        handle_station_frame(
            &state,
            "t1",
            r#"{"type":"recording_output","session_id":"s1","text":"","delta":"","is_complete":true}"#,
        )
        .await;
        let payload = rx.recv().await.unwrap();
        assert_eq!(payload["type"], "recording_output");
        assert_eq!(payload["is_complete"], true);
    }

    #[tokio::test]
    async fn partial_recording_omits_is_complete() {
        let state = state().await;
        let mut rx = subscribe(&state, "t1", Some("s1"), StreamKind::Recording).await;

        handle_station_frame(
            &state,
            "t1",
            r#"{"type":"recording_output","session_id":"s1","text":"partial","delta":"partial"}"#,
        )
        .await;
        let payload = rx.recv().await.unwrap();
        assert_eq!(payload["type"], "recording_output");
        assert!(payload.get("is_complete").is_none());
    }

    #[tokio::test]
    async fn agent_event_rejects_foreign_stream() {
        let state = state().await;
        let mut rx = subscribe(&state, "t1", None, StreamKind::Agent).await;

        // Foreign tunnel prefix is dropped
        handle_station_frame(
            &state,
            "t1",
            r#"{"type":"agent_request","stream_key":"other:agent","payload":{"type":"x"}}"#,
        )
        .await;
        assert!(rx.try_recv().is_err());

        handle_station_frame(
            &state,
            "t1",
            r#"{"type":"agent_request","stream_key":"t1:agent","payload":{"type":"completion"}}"#,
        )
        .await;
        assert_eq!(rx.recv().await.unwrap()["type"], "completion");
    }
}

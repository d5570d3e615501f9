//! Wire protocol between workstation and relay, and the agent event envelope.
//!
//! Every WS message is a single JSON object with a `type` discriminator and
//! snake_case fields. Frames are built here so both endpoints agree on field
//! names; the relay's frame router matches on the `type` string and tolerates
//! unknown types (log and drop, never disconnect).
//!
//! | Type               | Direction        | Key fields                                        |
//! |--------------------|------------------|---------------------------------------------------|
//! | `http_request`     | relay → station  | `request_id`, `method`, `path`, `headers`, `query`, `body` |
//! | `http_response`    | station → relay  | `request_id`, `status_code`, `body`               |
//! | `client_auth_key`  | station → relay  | `key`                                             |
//! | `terminal_output`  | station → relay  | `session_id`, `data`                              |
//! | `terminal_input`   | relay → station  | `session_id`, `data`                              |
//! | `recording_output` | station → relay  | `session_id`, `text`, `delta`, `is_complete?`     |
//! | `tts_ready`        | station → relay  | `session_id`, `text`, `timestamp`                 |
//! | `agent_request`    | both             | `stream_key`, `payload`                           |

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::util::now_ms;

/// Build an `http_request` frame for the proxy.
pub fn http_request(
    request_id: &str,
    method: &str,
    path: &str,
    headers: &HashMap<String, String>,
    query: &HashMap<String, String>,
    body: Option<&str>,
) -> Value {
    json!({
        "type": "http_request",
        "request_id": request_id,
        "method": method,
        "path": path,
        "headers": headers,
        "query": query,
        "body": body,
    })
}

/// Build an `http_response` frame answering a proxied request.
pub fn http_response(request_id: &str, status_code: u16, body: Value) -> Value {
    json!({
        "type": "http_response",
        "request_id": request_id,
        "status_code": status_code,
        "body": body,
    })
}

/// Build the `client_auth_key` frame sent right after the tunnel connects.
pub fn client_auth_key(key: &str) -> Value {
    json!({"type": "client_auth_key", "key": key})
}

/// Build a `terminal_output` frame carrying raw PTY bytes (lossy UTF-8).
pub fn terminal_output(session_id: &str, data: &str) -> Value {
    json!({
        "type": "terminal_output",
        "session_id": session_id,
        "data": data,
    })
}

/// Build a `terminal_input` frame (relay → workstation).
pub fn terminal_input(session_id: &str, data: &str) -> Value {
    json!({
        "type": "terminal_input",
        "session_id": session_id,
        "data": data,
    })
}

/// Build a `recording_output` frame. `is_complete` is omitted when `None` so
/// downstream consumers only see the field when it was actually asserted.
pub fn recording_output(
    session_id: &str,
    text: &str,
    delta: &str,
    raw: Option<&str>,
    is_complete: Option<bool>,
) -> Value {
    let mut frame = json!({
        "type": "recording_output",
        "session_id": session_id,
        "text": text,
        "delta": delta,
        "timestamp": now_ms(),
    });
    if let Some(raw) = raw {
        frame["raw"] = json!(raw);
    }
    if let Some(complete) = is_complete {
        frame["is_complete"] = json!(complete);
    }
    frame
}

/// Build a `tts_ready` frame — the accumulated assistant text is final.
pub fn tts_ready(session_id: &str, text: &str) -> Value {
    json!({
        "type": "tts_ready",
        "session_id": session_id,
        "text": text,
        "timestamp": now_ms(),
    })
}

/// Build an `agent_request` frame. Used relay → workstation to carry a mobile
/// payload, and workstation → relay to carry an agent event envelope back to
/// the agent stream.
pub fn agent_request(tunnel_id: &str, stream_key: &str, payload: Value) -> Value {
    json!({
        "type": "agent_request",
        "tunnel_id": tunnel_id,
        "stream_key": stream_key,
        "payload": payload,
    })
}

// ─── Agent events ────────────────────────────────────────────────────────────

/// A typed agent-stream event. On the wire this is adjacently tagged:
/// `{"type": "...", "payload": {...}}` inside the common envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum AgentEvent {
    CommandText {
        command: String,
        #[serde(default)]
        tts_enabled: bool,
    },
    CommandVoice {
        audio_base64: String,
        format: String,
        #[serde(default)]
        tts_enabled: bool,
    },
    ContextReset {},
    Transcription {
        text: String,
    },
    AssistantMessage {
        text: String,
        is_final: bool,
    },
    TtsAudio {
        audio_base64: String,
        format: String,
        duration_ms: u64,
        transcript: String,
    },
    Completion {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Common envelope wrapping every agent event on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEnvelope {
    pub session_id: String,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_id: Option<String>,
    pub timestamp: u64,
    #[serde(flatten)]
    pub event: AgentEvent,
}

impl AgentEnvelope {
    /// Wrap an event for a session, stamping a fresh message id and timestamp.
    pub fn new(session_id: &str, parent_id: Option<&str>, event: AgentEvent) -> Self {
        Self {
            session_id: session_id.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            parent_id: parent_id.map(ToString::to_string),
            timestamp: now_ms(),
            event,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("envelope serializes")
    }
}

/// Parse an inbound agent-stream payload. Tolerates the legacy `execute`
/// message shape (`{"type":"execute","command":...}`) by mapping it onto
/// [`AgentEvent::CommandText`].
pub fn parse_agent_payload(payload: &Value) -> Option<(Option<String>, AgentEvent)> {
    let msg_type = payload["type"].as_str()?;
    let message_id = payload["message_id"].as_str().map(ToString::to_string);

    if msg_type == "execute" {
        let command = payload["command"].as_str()?.to_string();
        let tts_enabled = payload["tts_enabled"].as_bool().unwrap_or(false);
        return Some((
            message_id,
            AgentEvent::CommandText {
                command,
                tts_enabled,
            },
        ));
    }

    // Typed shape: {"type": ..., "payload": {...}} possibly inside an envelope.
    let tagged = json!({
        "type": msg_type,
        "payload": payload.get("payload").cloned().unwrap_or_else(|| json!({})),
    });
    serde_json::from_value::<AgentEvent>(tagged)
        .ok()
        .map(|event| (message_id, event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_output_omits_absent_is_complete() {
        let frame = recording_output("s1", "full", "delta", None, None);
        assert_eq!(frame["type"], "recording_output");
        assert!(frame.get("is_complete").is_none());
        assert!(frame.get("raw").is_none());

        let frame = recording_output("s1", "full", "delta", Some("{}"), Some(true));
        assert_eq!(frame["is_complete"], true);
        assert_eq!(frame["raw"], "{}");
    }

    #[test]
    fn agent_event_wire_shape() {
        let envelope = AgentEnvelope::new(
            "s1",
            None,
            AgentEvent::Completion {
                success: true,
                result: Some("done".to_string()),
                error: None,
            },
        );
        let v = envelope.to_value();
        assert_eq!(v["type"], "completion");
        assert_eq!(v["session_id"], "s1");
        assert_eq!(v["payload"]["success"], true);
        assert_eq!(v["payload"]["result"], "done");
        assert!(v["payload"].get("error").is_none());
        assert!(v["message_id"].as_str().is_some());
    }

    #[test]
    fn parse_typed_command() {
        let payload = json!({
            "type": "command_text",
            "message_id": "m1",
            "payload": {"command": "ls", "tts_enabled": true},
        });
        let (mid, event) = parse_agent_payload(&payload).unwrap();
        assert_eq!(mid.as_deref(), Some("m1"));
        assert_eq!(
            event,
            AgentEvent::CommandText {
                command: "ls".to_string(),
                tts_enabled: true,
            }
        );
    }

    #[test]
    fn parse_legacy_execute() {
        let payload = json!({"type": "execute", "command": "echo hi", "tts_enabled": false});
        let (_, event) = parse_agent_payload(&payload).unwrap();
        assert_eq!(
            event,
            AgentEvent::CommandText {
                command: "echo hi".to_string(),
                tts_enabled: false,
            }
        );
    }

    #[test]
    fn parse_context_reset() {
        let payload = json!({"type": "context_reset"});
        let (_, event) = parse_agent_payload(&payload).unwrap();
        assert_eq!(event, AgentEvent::ContextReset {});
    }

    #[test]
    fn unknown_type_is_none() {
        assert!(parse_agent_payload(&json!({"type": "mystery"})).is_none());
        assert!(parse_agent_payload(&json!({"no_type": true})).is_none());
    }
}

//! Local request dispatcher — answers proxied HTTP requests arriving as
//! `http_request` frames.
//!
//! Routes are matched on `(method, path)`. Every route except `GET /health`
//! requires the caller's `X-Laptop-Auth-Key` (or bearer token) to equal the
//! workstation's own client auth key — the relay forwards headers verbatim,
//! so the check happens here at the owning end.
//!
//! | Method | Path | Body |
//! |--------|------|------|
//! | GET    | `/health` | — |
//! | POST   | `/sessions` | `{type, working_dir?, name?}` |
//! | GET    | `/sessions` | — |
//! | DELETE | `/sessions/{id}` | — |
//! | POST   | `/sessions/{id}/input` | `{data, is_command?}` |
//! | POST   | `/sessions/{id}/resize` | `{cols, rows}` |
//! | POST   | `/sessions/{id}/command` | `{command}` |
//! | POST   | `/sessions/{id}/rename` | `{name}` |
//! | GET    | `/sessions/{id}/history` | query `since` |
//! | GET    | `/sessions/{id}/screen` | — |
//! | GET    | `/sessions/{id}/chat` | — |
//! | DELETE | `/sessions/{id}/chat` | — |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use crate::headless::HeadlessError;
use crate::history::ChatHistoryStore;
use crate::sessions::{SessionManager, TerminalType};

/// Dispatcher state shared across requests.
pub struct Dispatcher {
    pub sessions: SessionManager,
    pub history: Option<Arc<ChatHistoryStore>>,
    /// The workstation-owned bearer announced to the relay on connect.
    pub client_auth_key: String,
    pub start_time: Instant,
}

impl Dispatcher {
    /// Handle one proxied request; returns `(status_code, body)`.
    pub async fn dispatch(
        &self,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        query: &HashMap<String, String>,
        body: Option<&str>,
    ) -> (u16, Value) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        if segments.as_slice() == ["health"] && method == "GET" {
            return self.health().await;
        }

        if !self.authorized(headers) {
            return (401, json!({"error": "Invalid or missing auth key"}));
        }

        let body_json: Value = body
            .and_then(|b| serde_json::from_str(b).ok())
            .unwrap_or(Value::Null);

        match (method, segments.as_slice()) {
            ("POST", ["sessions"]) => self.create_session(&body_json).await,
            ("GET", ["sessions"]) => self.list_sessions().await,
            ("DELETE", ["sessions", id]) => self.destroy_session(id).await,
            ("POST", ["sessions", id, "input"]) => self.write_input(id, &body_json).await,
            ("POST", ["sessions", id, "resize"]) => self.resize(id, &body_json).await,
            ("POST", ["sessions", id, "command"]) => self.command(id, &body_json).await,
            ("POST", ["sessions", id, "rename"]) => self.rename(id, &body_json).await,
            ("GET", ["sessions", id, "history"]) => self.history(id, query).await,
            ("GET", ["sessions", id, "screen"]) => self.screen(id).await,
            ("GET", ["sessions", id, "chat"]) => self.chat_history(id).await,
            ("DELETE", ["sessions", id, "chat"]) => self.clear_chat(id).await,
            _ => (404, json!({"error": "not found"})),
        }
    }

    fn authorized(&self, headers: &HashMap<String, String>) -> bool {
        let provided = headers
            .get("x-laptop-auth-key")
            .map(String::as_str)
            .or_else(|| {
                headers
                    .get("authorization")
                    .and_then(|h| h.strip_prefix("Bearer "))
            });
        match provided {
            Some(key) => {
                crate::auth::constant_time_eq(self.client_auth_key.as_bytes(), key.as_bytes())
            }
            None => false,
        }
    }

    async fn health(&self) -> (u16, Value) {
        (
            200,
            json!({
                "status": "ok",
                "sessions": self.sessions.session_count().await,
                "uptime": self.start_time.elapsed().as_secs(),
                "version": env!("CARGO_PKG_VERSION"),
            }),
        )
    }

    async fn create_session(&self, body: &Value) -> (u16, Value) {
        let Some(type_str) = body["type"].as_str() else {
            return (400, json!({"error": "type is required", "details": "one of regular|cursor|claude|agent"}));
        };
        let Some(terminal_type) = TerminalType::parse(type_str) else {
            return (400, json!({"error": format!("unknown session type '{type_str}'")}));
        };
        let working_dir = body["working_dir"].as_str();
        let name = body["name"].as_str();

        match self
            .sessions
            .create_session(terminal_type, working_dir, name)
            .await
        {
            Ok(info) => (
                200,
                json!({
                    "sessionId": info.session_id,
                    "workingDir": info.working_dir,
                    "type": info.terminal_type.as_str(),
                    "name": info.name,
                }),
            ),
            Err(e) if e.starts_with("ENOENT") || e.starts_with("ENOTDIR") => {
                (400, json!({"error": e}))
            }
            Err(e) if e.starts_with("Session limit") => (503, json!({"error": e})),
            Err(e) => (500, json!({"error": e})),
        }
    }

    async fn list_sessions(&self) -> (u16, Value) {
        let items = self.sessions.list_sessions().await;
        let sessions: Vec<Value> = items
            .iter()
            .map(|s| {
                json!({
                    "sessionId": s.info.session_id,
                    "workingDir": s.info.working_dir,
                    "type": s.info.terminal_type.as_str(),
                    "name": s.info.name,
                    "createdAt": s.info.created_at_ms,
                    "pid": s.pid,
                    "status": s.status,
                    "exitCode": s.exit_code,
                    "headlessRunning": s.headless_running,
                })
            })
            .collect();
        (200, json!({"sessions": sessions}))
    }

    async fn destroy_session(&self, id: &str) -> (u16, Value) {
        if self.sessions.destroy_session(id).await {
            (200, json!({"ok": true}))
        } else {
            (404, json!({"error": format!("Session {id} not found")}))
        }
    }

    async fn write_input(&self, id: &str, body: &Value) -> (u16, Value) {
        let Some(data) = body["data"].as_str() else {
            return (400, json!({"error": "data is required"}));
        };
        let is_command = body["is_command"].as_bool().unwrap_or(false);
        match self.sessions.write_input(id, data, is_command).await {
            Ok(()) => (200, json!({"ok": true})),
            Err(e) if e.contains("not found") => (404, json!({"error": e})),
            Err(e) => (500, json!({"error": e})),
        }
    }

    async fn resize(&self, id: &str, body: &Value) -> (u16, Value) {
        let (Some(cols), Some(rows)) = (body["cols"].as_u64(), body["rows"].as_u64()) else {
            return (400, json!({"error": "cols and rows are required"}));
        };
        if cols == 0 || rows == 0 || cols > u64::from(u16::MAX) || rows > u64::from(u16::MAX) {
            return (400, json!({"error": "cols and rows must be in 1..=65535"}));
        }
        match self
            .sessions
            .resize_terminal(id, cols as u16, rows as u16)
            .await
        {
            Ok(()) => (200, json!({"ok": true})),
            Err(e) if e.contains("not found") => (404, json!({"error": e})),
            Err(e) => (500, json!({"error": e})),
        }
    }

    async fn command(&self, id: &str, body: &Value) -> (u16, Value) {
        let Some(command) = body["command"].as_str() else {
            return (400, json!({"error": "command is required"}));
        };
        match self.sessions.execute_command(id, command).await {
            Ok(()) => (200, json!({"ok": true, "status": "started"})),
            Err(HeadlessError::Busy) => (503, json!({"error": "session busy"})),
            Err(HeadlessError::Spawn(e)) => (500, json!({"error": e})),
            Err(HeadlessError::Failed(e)) if e.contains("not found") => {
                (404, json!({"error": e}))
            }
            Err(HeadlessError::Failed(e)) => (400, json!({"error": e})),
        }
    }

    async fn rename(&self, id: &str, body: &Value) -> (u16, Value) {
        let Some(name) = body["name"].as_str() else {
            return (400, json!({"error": "name is required"}));
        };
        match self.sessions.rename_session(id, name).await {
            Ok(()) => (200, json!({"ok": true})),
            Err(e) => (404, json!({"error": e})),
        }
    }

    async fn history(&self, id: &str, query: &HashMap<String, String>) -> (u16, Value) {
        let since = query
            .get("since")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        match self.sessions.get_history(id, since).await {
            Some((entries, dropped)) => {
                let entries: Vec<Value> = entries
                    .iter()
                    .map(|e| {
                        json!({
                            "seq": e.seq,
                            "data": e.data,
                            "timestamp": e.timestamp_ms,
                        })
                    })
                    .collect();
                (200, json!({"entries": entries, "dropped": dropped}))
            }
            None => (404, json!({"error": format!("Session {id} not found")})),
        }
    }

    async fn screen(&self, id: &str) -> (u16, Value) {
        match self.sessions.screen_content(id).await {
            Some(content) => (200, json!({"content": content})),
            None => (404, json!({"error": format!("Session {id} not found")})),
        }
    }

    async fn chat_history(&self, id: &str) -> (u16, Value) {
        let Some(history) = &self.history else {
            return (200, json!({"messages": []}));
        };
        match history.get_chat_history(id).await {
            Ok(messages) => {
                let messages: Vec<Value> = messages
                    .iter()
                    .map(|m| {
                        json!({
                            "id": m.id,
                            "timestamp": m.timestamp_ms,
                            "type": m.message_type.as_str(),
                            "content": m.content,
                            "metadata": m.metadata,
                        })
                    })
                    .collect();
                (200, json!({"messages": messages}))
            }
            Err(e) => (500, json!({"error": e})),
        }
    }

    async fn clear_chat(&self, id: &str) -> (u16, Value) {
        let Some(history) = &self.history else {
            return (200, json!({"ok": true, "cleared": 0}));
        };
        match history.clear_history(id).await {
            Ok(cleared) => (200, json!({"ok": true, "cleared": cleared})),
            Err(e) => (500, json!({"error": e})),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeadlessConfig, StationConfig};
    use crate::tunnel::FrameSender;

    fn dispatcher() -> Dispatcher {
        let station = StationConfig::default();
        let sessions = SessionManager::new(
            &station,
            HeadlessConfig::default(),
            FrameSender::new(),
            None,
        );
        Dispatcher {
            sessions,
            history: None,
            client_auth_key: "KEY".to_string(),
            start_time: Instant::now(),
        }
    }

    fn auth_headers() -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("x-laptop-auth-key".to_string(), "KEY".to_string());
        headers
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let d = dispatcher();
        let (status, body) = d
            .dispatch("GET", "/health", &HashMap::new(), &HashMap::new(), None)
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn missing_or_wrong_auth_is_401() {
        let d = dispatcher();
        let (status, _) = d
            .dispatch("GET", "/sessions", &HashMap::new(), &HashMap::new(), None)
            .await;
        assert_eq!(status, 401);

        let mut headers = HashMap::new();
        headers.insert("x-laptop-auth-key".to_string(), "WRONG".to_string());
        let (status, _) = d
            .dispatch("GET", "/sessions", &headers, &HashMap::new(), None)
            .await;
        assert_eq!(status, 401);

        let mut headers = HashMap::new();
        headers.insert("authorization".to_string(), "Bearer KEY".to_string());
        let (status, _) = d
            .dispatch("GET", "/sessions", &headers, &HashMap::new(), None)
            .await;
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let d = dispatcher();
        let (status, _) = d
            .dispatch("GET", "/nope", &auth_headers(), &HashMap::new(), None)
            .await;
        assert_eq!(status, 404);

        let (status, _) = d
            .dispatch("PUT", "/sessions", &auth_headers(), &HashMap::new(), None)
            .await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn create_session_validates_body() {
        let d = dispatcher();
        let (status, body) = d
            .dispatch(
                "POST",
                "/sessions",
                &auth_headers(),
                &HashMap::new(),
                Some("{}"),
            )
            .await;
        assert_eq!(status, 400);
        assert!(body["error"].as_str().unwrap().contains("type"));

        let (status, _) = d
            .dispatch(
                "POST",
                "/sessions",
                &auth_headers(),
                &HashMap::new(),
                Some(r#"{"type":"powershell"}"#),
            )
            .await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn create_session_rejects_missing_dir() {
        let d = dispatcher();
        let (status, body) = d
            .dispatch(
                "POST",
                "/sessions",
                &auth_headers(),
                &HashMap::new(),
                Some(r#"{"type":"regular","working_dir":"/definitely/not/a/dir"}"#),
            )
            .await;
        assert_eq!(status, 400);
        assert!(body["error"].as_str().unwrap().starts_with("ENOENT"));
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let d = dispatcher();
        let (status, _) = d
            .dispatch(
                "DELETE",
                "/sessions/ghost",
                &auth_headers(),
                &HashMap::new(),
                None,
            )
            .await;
        assert_eq!(status, 404);

        let (status, _) = d
            .dispatch(
                "POST",
                "/sessions/ghost/input",
                &auth_headers(),
                &HashMap::new(),
                Some(r#"{"data":"ls\n"}"#),
            )
            .await;
        assert_eq!(status, 404);
    }
}

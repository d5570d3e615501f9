//! Agent event handler — the voice/text command pipeline.
//!
//! Processes agent-stream messages (`command_text`, `command_voice`,
//! `context_reset`) and emits typed events back over the same stream, always
//! in the order `transcription → assistant_message → tts_audio → completion`.
//! Any handler failure emits `error` followed by `completion {success:false}`.
//!
//! STT and TTS are trait seams selected by `AGENT_PROVIDER`; the concrete
//! vendor APIs live outside this crate. TTS is best-effort: a synthesis
//! failure never fails the turn.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::history::{ChatHistoryStore, MessageType};
use crate::protocol::{self, AgentEnvelope, AgentEvent};
use crate::sessions::{SessionEvent, SessionManager};
use crate::shell::process::{exec_command, ExecError};
use crate::tunnel::FrameSender;

/// Speech-to-text seam.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio: &[u8], format: &str) -> Result<String, String>;
}

/// Text-to-speech seam.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<TtsResult, String>;
}

/// Synthesized speech returned by a [`TextToSpeech`] provider.
pub struct TtsResult {
    pub audio_base64: String,
    pub format: String,
    /// `None` when the provider does not report a duration; the handler
    /// estimates one from the transcript length.
    pub duration_ms: Option<u64>,
}

/// Estimated speech duration for a transcript: `chars / 5` words at 150 wpm.
pub fn estimate_tts_duration_ms(chars: usize) -> u64 {
    (chars as f64 / 5.0 / 150.0 * 60_000.0) as u64
}

/// Resolve STT/TTS providers from configuration.
///
/// Vendor integrations are plugged in here; with no provider configured,
/// voice commands fail with a surfaced error and synthesis is skipped.
pub fn build_providers(
    config: &AgentConfig,
) -> (Option<Arc<dyn SpeechToText>>, Option<Arc<dyn TextToSpeech>>) {
    match config.provider.as_deref() {
        None => (None, None),
        Some(other) => {
            warn!("Unknown AGENT_PROVIDER '{other}', speech features disabled");
            (None, None)
        }
    }
}

/// Command timeout for the direct execution path (2 min).
const EXEC_TIMEOUT_MS: u64 = 120_000;

/// Handles agent-stream traffic for all sessions.
#[derive(Clone)]
pub struct AgentHandler {
    sessions: SessionManager,
    frames: FrameSender,
    history: Option<Arc<ChatHistoryStore>>,
    /// Per-session conversation history (role, content). Dropped on
    /// `context_reset` and on session destroy.
    conversations: Arc<Mutex<HashMap<String, Vec<(String, String)>>>>,
    stt: Option<Arc<dyn SpeechToText>>,
    tts: Option<Arc<dyn TextToSpeech>>,
    shell: String,
    work_root: String,
}

impl AgentHandler {
    pub fn new(
        sessions: SessionManager,
        frames: FrameSender,
        history: Option<Arc<ChatHistoryStore>>,
        config: &AgentConfig,
        shell: &str,
        work_root: &str,
    ) -> Self {
        let (stt, tts) = build_providers(config);
        let handler = Self {
            sessions,
            frames,
            history,
            conversations: Arc::new(Mutex::new(HashMap::new())),
            stt,
            tts,
            shell: crate::shell::login_shell(shell),
            work_root: work_root.to_string(),
        };

        // Drop conversation state when a session is destroyed.
        let conversations = Arc::clone(&handler.conversations);
        let mut events = handler.sessions.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let SessionEvent::Destroyed(session_id) = event;
                conversations.lock().await.remove(&session_id);
            }
        });
        handler
    }

    /// Entry point for an inbound `agent_request` frame. The turn runs in its
    /// own task so the tunnel reader never blocks on STT/exec/TTS.
    pub fn handle_frame(&self, frame: &Value) {
        let Some(stream_key) = frame["stream_key"].as_str() else {
            warn!("agent_request without stream_key (dropped)");
            return;
        };
        let tunnel_id = frame["tunnel_id"].as_str().unwrap_or_default().to_string();
        let payload = frame.get("payload").cloned().unwrap_or(Value::Null);
        let stream_key = stream_key.to_string();

        let handler = self.clone();
        tokio::spawn(async move {
            handler.process(&tunnel_id, &stream_key, &payload).await;
        });
    }

    async fn process(&self, tunnel_id: &str, stream_key: &str, payload: &Value) {
        let session_id = payload["session_id"].as_str().unwrap_or("agent").to_string();
        let Some((message_id, event)) = protocol::parse_agent_payload(payload) else {
            warn!(session_id = %session_id, "Unparseable agent payload (dropped)");
            return;
        };
        let parent = message_id.as_deref();

        let outcome = match event {
            AgentEvent::CommandText {
                command,
                tts_enabled,
            } => {
                self.command_turn(tunnel_id, stream_key, &session_id, parent, &command, tts_enabled)
                    .await
            }
            AgentEvent::CommandVoice {
                audio_base64,
                format,
                tts_enabled,
            } => {
                self.voice_turn(
                    tunnel_id,
                    stream_key,
                    &session_id,
                    parent,
                    &audio_base64,
                    &format,
                    tts_enabled,
                )
                .await
            }
            AgentEvent::ContextReset {} => self.context_reset(&session_id).await.map(|()| {
                self.emit(
                    tunnel_id,
                    stream_key,
                    &session_id,
                    parent,
                    AgentEvent::Completion {
                        success: true,
                        result: Some("Context reset".to_string()),
                        error: None,
                    },
                );
            }),
            // Server-emitted event types arriving inbound are ignored.
            _ => return,
        };

        if let Err((code, message)) = outcome {
            self.emit(
                tunnel_id,
                stream_key,
                &session_id,
                parent,
                AgentEvent::Error {
                    code: code.clone(),
                    message: message.clone(),
                },
            );
            self.emit(
                tunnel_id,
                stream_key,
                &session_id,
                parent,
                AgentEvent::Completion {
                    success: false,
                    result: None,
                    error: Some(message),
                },
            );
        }
    }

    /// Voice turn: STT → transcription event → text turn.
    #[allow(clippy::too_many_arguments)]
    async fn voice_turn(
        &self,
        tunnel_id: &str,
        stream_key: &str,
        session_id: &str,
        parent: Option<&str>,
        audio_base64: &str,
        format: &str,
        tts_enabled: bool,
    ) -> Result<(), (String, String)> {
        let Some(stt) = &self.stt else {
            return Err((
                "stt_unavailable".to_string(),
                "No speech-to-text provider configured".to_string(),
            ));
        };
        use base64::Engine;
        let audio = base64::engine::general_purpose::STANDARD
            .decode(audio_base64)
            .map_err(|e| ("bad_audio".to_string(), format!("Invalid audio payload: {e}")))?;

        let text = stt
            .transcribe(&audio, format)
            .await
            .map_err(|e| ("stt_failed".to_string(), e))?;

        self.emit(
            tunnel_id,
            stream_key,
            session_id,
            parent,
            AgentEvent::Transcription { text: text.clone() },
        );

        self.command_turn(tunnel_id, stream_key, session_id, parent, &text, tts_enabled)
            .await
    }

    /// Text turn: execute → assistant_message → tts_audio? → completion.
    async fn command_turn(
        &self,
        tunnel_id: &str,
        stream_key: &str,
        session_id: &str,
        parent: Option<&str>,
        command: &str,
        tts_enabled: bool,
    ) -> Result<(), (String, String)> {
        info!(session_id = %session_id, "Agent command: {command}");
        self.append_turn(session_id, "user", command).await;
        if let Some(history) = &self.history {
            let _ = history.create_session(session_id).await;
            let _ = history
                .add_message(session_id, MessageType::User, command, None)
                .await;
        }

        let text = self.execute(session_id, command).await.map_err(|e| {
            ("execution_failed".to_string(), e)
        })?;

        self.append_turn(session_id, "assistant", &text).await;
        if let Some(history) = &self.history {
            let _ = history
                .add_message(session_id, MessageType::Assistant, &text, None)
                .await;
        }

        self.emit(
            tunnel_id,
            stream_key,
            session_id,
            parent,
            AgentEvent::AssistantMessage {
                text: text.clone(),
                is_final: true,
            },
        );

        // Agent sessions feed the recording stream from here (headless
        // sessions feed it from the executor instead).
        self.sessions.record_assistant_turn(session_id, &text).await;

        if tts_enabled {
            if let Some(tts) = &self.tts {
                match tts.synthesize(&text).await {
                    Ok(result) => {
                        let duration_ms = result
                            .duration_ms
                            .unwrap_or_else(|| estimate_tts_duration_ms(text.chars().count()));
                        self.emit(
                            tunnel_id,
                            stream_key,
                            session_id,
                            parent,
                            AgentEvent::TtsAudio {
                                audio_base64: result.audio_base64,
                                format: result.format,
                                duration_ms,
                                transcript: text.clone(),
                            },
                        );
                    }
                    // Best-effort: synthesis failure never fails the turn.
                    Err(e) => warn!(session_id = %session_id, "TTS failed: {e}"),
                }
            }
        }

        self.emit(
            tunnel_id,
            stream_key,
            session_id,
            parent,
            AgentEvent::Completion {
                success: true,
                result: Some(text),
                error: None,
            },
        );
        Ok(())
    }

    /// Direct execution path: run the command through the shell in the
    /// session's working directory.
    async fn execute(&self, session_id: &str, command: &str) -> Result<String, String> {
        let working_dir = match self.sessions.get_info(session_id).await {
            Some(info) => info.working_dir,
            None => crate::util::expand_tilde(&self.work_root).into_owned(),
        };

        match exec_command(&self.shell, &working_dir, command, EXEC_TIMEOUT_MS, None).await {
            Ok(result) => {
                let mut text = result.stdout.trim_end().to_string();
                if text.is_empty() {
                    text = result.stderr.trim_end().to_string();
                }
                if text.is_empty() {
                    text = format!("Command finished with exit code {}", result.exit_code);
                }
                Ok(text)
            }
            Err(ExecError::Timeout) => Err("Command timed out".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn context_reset(&self, session_id: &str) -> Result<(), (String, String)> {
        self.conversations.lock().await.remove(session_id);
        if let Some(history) = &self.history {
            let _ = history.clear_history(session_id).await;
        }
        info!(session_id = %session_id, "Conversation context reset");
        Ok(())
    }

    async fn append_turn(&self, session_id: &str, role: &str, content: &str) {
        self.conversations
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push((role.to_string(), content.to_string()));
    }

    /// Emit one event envelope onto the agent stream.
    fn emit(
        &self,
        tunnel_id: &str,
        stream_key: &str,
        session_id: &str,
        parent: Option<&str>,
        event: AgentEvent,
    ) {
        let envelope = AgentEnvelope::new(session_id, parent, event);
        self.frames.send(protocol::agent_request(
            tunnel_id,
            stream_key,
            envelope.to_value(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeadlessConfig, StationConfig};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn handler() -> (AgentHandler, mpsc::Receiver<Value>) {
        let frames = FrameSender::new();
        let (tx, rx) = mpsc::channel(64);
        frames.install(tx);

        let mut station = StationConfig::default();
        station.shell = "sh".to_string();
        station.work_root = "/tmp".to_string();
        let sessions = SessionManager::new(
            &station,
            HeadlessConfig::default(),
            frames.clone(),
            None,
        );
        let agent_config = AgentConfig::default();
        (
            AgentHandler::new(sessions, frames, None, &agent_config, "sh", "/tmp"),
            rx,
        )
    }

    async fn events_of(rx: &mut mpsc::Receiver<Value>, n: usize) -> Vec<Value> {
        let mut out = Vec::new();
        for _ in 0..n {
            let frame = tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("channel closed");
            assert_eq!(frame["type"], "agent_request");
            out.push(frame["payload"].clone());
        }
        out
    }

    #[test]
    fn duration_estimate() {
        // 750 chars → 150 words → one minute of speech
        assert_eq!(estimate_tts_duration_ms(750), 60_000);
        assert_eq!(estimate_tts_duration_ms(0), 0);
    }

    #[test]
    fn no_provider_configured_disables_speech() {
        let (stt, tts) = build_providers(&AgentConfig::default());
        assert!(stt.is_none());
        assert!(tts.is_none());
    }

    #[tokio::test]
    async fn text_command_emits_message_then_completion() {
        let (handler, mut rx) = handler();
        handler
            .process(
                "t1",
                "t1:agent",
                &json!({"type": "execute", "command": "echo hi", "tts_enabled": false, "session_id": "s1"}),
            )
            .await;

        let events = events_of(&mut rx, 2).await;
        assert_eq!(events[0]["type"], "assistant_message");
        assert!(events[0]["payload"]["text"].as_str().unwrap().contains("hi"));
        assert_eq!(events[0]["payload"]["is_final"], true);

        assert_eq!(events[1]["type"], "completion");
        assert_eq!(events[1]["payload"]["success"], true);
        assert!(events[1]["payload"]["result"]
            .as_str()
            .unwrap()
            .contains("hi"));
    }

    #[tokio::test]
    async fn voice_without_provider_surfaces_error_then_failure() {
        let (handler, mut rx) = handler();
        handler
            .process(
                "t1",
                "t1:agent",
                &json!({
                    "type": "command_voice",
                    "session_id": "s1",
                    "payload": {"audio_base64": "", "format": "wav"},
                }),
            )
            .await;

        let events = events_of(&mut rx, 2).await;
        assert_eq!(events[0]["type"], "error");
        assert_eq!(events[0]["payload"]["code"], "stt_unavailable");
        assert_eq!(events[1]["type"], "completion");
        assert_eq!(events[1]["payload"]["success"], false);
    }

    #[tokio::test]
    async fn context_reset_completes() {
        let (handler, mut rx) = handler();
        handler
            .process(
                "t1",
                "t1:agent",
                &json!({"type": "context_reset", "session_id": "s1"}),
            )
            .await;

        let events = events_of(&mut rx, 1).await;
        assert_eq!(events[0]["type"], "completion");
        assert_eq!(events[0]["payload"]["result"], "Context reset");
    }
}

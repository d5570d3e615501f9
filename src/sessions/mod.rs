//! Terminal session lifecycle management.
//!
//! [`SessionManager`] is the single authority for creating, accessing, and
//! destroying terminal sessions. Sessions come in four flavours: `regular`
//! (plain login shell), `cursor`/`claude` (login shell plus a headless CLI
//! executor), and `agent` (no PTY; driven entirely through the agent stream).
//!
//! ## Concurrency
//!
//! The session map is behind an `RwLock`. Read operations (write input, get
//! status) take a read lock; mutations (create, destroy) take a write lock.
//! `create_session` holds the write lock across the limit-check and insert to
//! prevent TOCTOU races. All PTY writes for a session are serialized through
//! its single stdin writer task.

pub mod buffer;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{HeadlessConfig, StationConfig};
use crate::headless::{self, HeadlessError, HeadlessState};
use crate::history::ChatHistoryStore;
use crate::output::OutputRouter;
use crate::shell::pty::{allocate_pty, spawn_shell_pty, DEFAULT_COLS, DEFAULT_ROWS};
use crate::tunnel::FrameSender;
use crate::util::{expand_tilde, now_ms};
use buffer::{InputRing, OutputEntry};
use session::{PtySession, SessionStatus};

/// What kind of terminal a session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalType {
    Regular,
    Cursor,
    Claude,
    Agent,
}

impl TerminalType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Cursor => "cursor",
            Self::Claude => "claude",
            Self::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "regular" => Some(Self::Regular),
            "cursor" => Some(Self::Cursor),
            "claude" => Some(Self::Claude),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }

    /// Headless sessions run CLI commands through the executor.
    pub fn is_headless(self) -> bool {
        matches!(self, Self::Cursor | Self::Claude)
    }

    /// Whether sessions of this type own a PTY.
    pub fn has_pty(self) -> bool {
        !matches!(self, Self::Agent)
    }
}

/// Immutable description of a session, returned on create and list.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub working_dir: String,
    pub terminal_type: TerminalType,
    pub name: Option<String>,
    pub created_at_ms: u64,
}

/// A session list item with live status.
pub struct SessionListItem {
    pub info: SessionInfo,
    pub pid: u32,
    /// `"running"` or `"exited"` (agent sessions are always `"running"`).
    pub status: String,
    pub exit_code: Option<i32>,
    pub headless_running: bool,
}

/// Lifecycle events other components can subscribe to.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Destroyed(String),
}

/// Internal bookkeeping for a session.
pub struct SessionEntry {
    pub info: SessionInfo,
    /// `None` for agent sessions.
    pub pty: Option<PtySession>,
    pub router: Arc<Mutex<OutputRouter>>,
    pub input_ring: Arc<Mutex<InputRing>>,
    pub headless: Arc<Mutex<HeadlessState>>,
}

/// Normalize input newlines for the PTY.
///
/// - data without any `\r`: every `\n` becomes `\r`;
/// - data containing `\r`: only a trailing lone `\n` (not part of `\r\n`) is
///   rewritten to `\r`;
/// - `is_command` appends a `\r` unless one is already trailing.
///
/// The function is idempotent under double application.
pub fn normalize_input(data: &str, is_command: bool) -> String {
    let mut out = if data.contains('\r') {
        if data.ends_with('\n') && !data.ends_with("\r\n") {
            let mut s = data[..data.len() - 1].to_string();
            s.push('\r');
            s
        } else {
            data.to_string()
        }
    } else {
        data.replace('\n', "\r")
    };

    if is_command && !out.ends_with('\r') {
        out.push('\r');
    }
    out
}

/// Manages the pool of active terminal sessions.
///
/// Cloneable — all clones share the same inner state.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    shell: String,
    work_root: String,
    max_sessions: usize,
    output_ring_size: usize,
    input_ring_size: usize,
    headless_config: HeadlessConfig,
    frames: FrameSender,
    history: Option<Arc<ChatHistoryStore>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        station: &StationConfig,
        headless_config: HeadlessConfig,
        frames: FrameSender,
        history: Option<Arc<ChatHistoryStore>>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            shell: crate::shell::login_shell(&station.shell),
            work_root: station.work_root.clone(),
            max_sessions: station.max_sessions,
            output_ring_size: station.output_ring_size,
            input_ring_size: station.input_ring_size,
            headless_config,
            frames,
            history,
            events,
        }
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Create a new session. Holds the write lock across the limit check and
    /// insert.
    pub async fn create_session(
        &self,
        terminal_type: TerminalType,
        working_dir: Option<&str>,
        name: Option<&str>,
    ) -> Result<SessionInfo, String> {
        let raw_dir = working_dir.unwrap_or(&self.work_root);
        let dir = expand_tilde(raw_dir).into_owned();
        match std::fs::metadata(&dir) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(format!("ENOENT: working directory does not exist: {raw_dir}"));
            }
            Err(e) => return Err(format!("Cannot access working directory {raw_dir}: {e}")),
            Ok(meta) if !meta.is_dir() => {
                return Err(format!("ENOTDIR: not a directory: {raw_dir}"));
            }
            Ok(_) => {}
        }

        let session_id = Uuid::new_v4().to_string();
        let info = SessionInfo {
            session_id: session_id.clone(),
            working_dir: dir.clone(),
            terminal_type,
            name: name.map(ToString::to_string),
            created_at_ms: now_ms(),
        };

        let router = Arc::new(Mutex::new(OutputRouter::new(
            &session_id,
            terminal_type,
            self.frames.clone(),
        )));

        {
            let mut sessions = self.sessions.write().await;
            if sessions.len() >= self.max_sessions {
                return Err(format!("Session limit reached (max {})", self.max_sessions));
            }

            let pty = if terminal_type.has_pty() {
                let pty_pair = allocate_pty(DEFAULT_ROWS, DEFAULT_COLS)
                    .map_err(|e| format!("Failed to allocate PTY: {e}"))?;
                let child = spawn_shell_pty(&pty_pair, &self.shell, &dir, None)
                    .map_err(|e| format!("Failed to spawn shell: {e}"))?;
                Some(PtySession::spawn(
                    session_id.clone(),
                    child,
                    pty_pair.master,
                    self.output_ring_size,
                    Arc::clone(&router),
                )?)
            } else {
                None
            };

            let pid = pty.as_ref().map_or(0, |p| p.pid);
            sessions.insert(
                session_id.clone(),
                SessionEntry {
                    info: info.clone(),
                    pty,
                    router,
                    input_ring: Arc::new(Mutex::new(InputRing::new(self.input_ring_size))),
                    headless: Arc::new(Mutex::new(HeadlessState::new())),
                },
            );

            info!(
                "Session {session_id} created ({}, pid {pid}), total: {}",
                terminal_type.as_str(),
                sessions.len()
            );
        }

        // Persistence happens outside the map lock.
        if let Some(history) = &self.history {
            if let Err(e) = history.create_session(&session_id).await {
                warn!("Failed to create chat session for {session_id}: {e}");
            }
            if let Err(e) = history.save_session_metadata(&info).await {
                warn!("Failed to persist session metadata for {session_id}: {e}");
            }
        }

        Ok(info)
    }

    /// Write input to a session's PTY, normalizing newlines first.
    ///
    /// Handles are cloned out of the map so the stdin send (which can wait
    /// for queue space) never suspends under the session-map lock.
    pub async fn write_input(
        &self,
        session_id: &str,
        data: &str,
        is_command: bool,
    ) -> Result<(), String> {
        let (stdin, router, input_ring) = {
            let sessions = self.sessions.read().await;
            let entry = sessions
                .get(session_id)
                .ok_or_else(|| format!("Session {session_id} not found"))?;
            let Some(pty) = &entry.pty else {
                return Err(format!("Session {session_id} has no terminal"));
            };
            (
                pty.stdin_handle(),
                Arc::clone(&entry.router),
                Arc::clone(&entry.input_ring),
            )
        };

        let normalized = normalize_input(data, is_command);
        stdin
            .send(normalized.as_bytes().to_vec())
            .await
            .map_err(|_| "Session stdin closed".to_string())?;

        // Input listeners: the router resets its recording state on a command
        // terminator; the input ring keeps recent writes for inspection.
        router.lock().await.on_input(&normalized);
        input_ring.lock().await.push(normalized);
        Ok(())
    }

    /// Resize a session's PTY. Fails gracefully on a closed PTY.
    pub async fn resize_terminal(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), String> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| format!("Session {session_id} not found"))?;
        match &entry.pty {
            Some(pty) => pty.resize(rows, cols).await,
            None => Err(format!("Session {session_id} has no terminal")),
        }
    }

    /// Execute a command in a session.
    ///
    /// Regular sessions write the command to the PTY (output is streamed);
    /// headless sessions delegate to the CLI executor; agent sessions take
    /// commands through the agent stream instead.
    pub async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
    ) -> Result<(), HeadlessError> {
        let ctx = {
            let sessions = self.sessions.read().await;
            let entry = sessions
                .get(session_id)
                .ok_or_else(|| HeadlessError::Failed(format!("Session {session_id} not found")))?;

            match entry.info.terminal_type {
                TerminalType::Regular => None,
                TerminalType::Agent => {
                    return Err(HeadlessError::Failed(
                        "Agent sessions take commands over the agent stream".to_string(),
                    ));
                }
                TerminalType::Cursor | TerminalType::Claude => Some(headless::CommandContext {
                    session_id: session_id.to_string(),
                    terminal_type: entry.info.terminal_type,
                    working_dir: entry.info.working_dir.clone(),
                    command: command.to_string(),
                    config: self.headless_config.clone(),
                    state: Arc::clone(&entry.headless),
                    router: Arc::clone(&entry.router),
                    frames: self.frames.clone(),
                    history: self.history.clone(),
                }),
            }
        };

        match ctx {
            Some(ctx) => headless::run_command(ctx).await,
            None => self
                .write_input(session_id, command, true)
                .await
                .map_err(HeadlessError::Failed),
        }
    }

    /// Destroy a session: cancel headless work, SIGTERM the process group,
    /// wait 2 s, SIGKILL, then notify destroyed-listeners.
    pub async fn destroy_session(&self, session_id: &str) -> bool {
        let entry = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id)
        };
        let Some(entry) = entry else {
            return false;
        };

        headless::cancel(&entry.headless).await;

        if let Some(pty) = &entry.pty {
            pty.graceful_kill().await;
        }

        if let Some(history) = &self.history {
            if let Err(e) = history.close_session(session_id).await {
                warn!("Failed to close chat session for {session_id}: {e}");
            }
            if let Err(e) = history.delete_session_metadata(session_id).await {
                warn!("Failed to drop session metadata for {session_id}: {e}");
            }
        }

        let _ = self
            .events
            .send(SessionEvent::Destroyed(session_id.to_string()));
        info!("Session {session_id} destroyed");
        true
    }

    /// List all sessions with live status.
    pub async fn list_sessions(&self) -> Vec<SessionListItem> {
        let sessions = self.sessions.read().await;
        let mut items = Vec::with_capacity(sessions.len());
        for entry in sessions.values() {
            let (status, exit_code, pid) = match &entry.pty {
                Some(pty) => {
                    let status = *pty.status.lock().await;
                    let code = *pty.exit_code.lock().await;
                    (
                        match status {
                            SessionStatus::Running => "running".to_string(),
                            SessionStatus::Exited => "exited".to_string(),
                        },
                        code,
                        pty.pid,
                    )
                }
                None => ("running".to_string(), None, 0),
            };
            let headless_running = entry.headless.lock().await.running;
            items.push(SessionListItem {
                info: entry.info.clone(),
                pid,
                status,
                exit_code,
                headless_running,
            });
        }
        items
    }

    pub async fn rename_session(&self, session_id: &str, name: &str) -> Result<(), String> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(entry) => {
                entry.info.name = Some(name.to_string());
                Ok(())
            }
            None => Err(format!("Session {session_id} not found")),
        }
    }

    /// Recent output entries with `seq > since`.
    pub async fn get_history(
        &self,
        session_id: &str,
        since: u64,
    ) -> Option<(Vec<OutputEntry>, u64)> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(session_id)?;
        let pty = entry.pty.as_ref()?;
        let buf = pty.buffer.lock().await;
        Some(buf.read_since(since))
    }

    /// Feed a completed assistant turn into an agent session's recording
    /// stream. Headless sessions feed theirs from the executor; for other
    /// types this is a no-op.
    pub async fn record_assistant_turn(&self, session_id: &str, text: &str) -> bool {
        let sessions = self.sessions.read().await;
        let Some(entry) = sessions.get(session_id) else {
            return false;
        };
        if entry.info.terminal_type != TerminalType::Agent {
            return false;
        }
        entry.router.lock().await.record_turn(text);
        true
    }

    /// The stable final frame from the session's screen emulator.
    pub async fn screen_content(&self, session_id: &str) -> Option<String> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(session_id)?;
        let router = entry.router.lock().await;
        Some(router.screen_content())
    }

    pub async fn get_info(&self, session_id: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|e| e.info.clone())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Destroy all sessions (shutdown path).
    pub async fn destroy_all(&self) {
        let ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions.keys().cloned().collect()
        };
        for id in ids {
            self.destroy_session(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_type_round_trip() {
        for t in [
            TerminalType::Regular,
            TerminalType::Cursor,
            TerminalType::Claude,
            TerminalType::Agent,
        ] {
            assert_eq!(TerminalType::parse(t.as_str()), Some(t));
        }
        assert_eq!(TerminalType::parse("powershell"), None);
        assert!(TerminalType::Claude.is_headless());
        assert!(!TerminalType::Agent.has_pty());
    }

    #[test]
    fn normalize_plain_newlines() {
        assert_eq!(normalize_input("ls\n", false), "ls\r");
        assert_eq!(normalize_input("ls\n\n", true), "ls\r\r");
        assert_eq!(normalize_input("a\nb\n", false), "a\rb\r");
    }

    #[test]
    fn normalize_preserves_existing_cr() {
        assert_eq!(normalize_input("ls\r", false), "ls\r");
        assert_eq!(normalize_input("ls\r\n", false), "ls\r\n");
        // Trailing lone \n after a \r elsewhere becomes \r
        assert_eq!(normalize_input("a\rb\n", false), "a\rb\r");
    }

    #[test]
    fn normalize_appends_cr_for_commands() {
        assert_eq!(normalize_input("ls", true), "ls\r");
        assert_eq!(normalize_input("ls\r", true), "ls\r");
        assert_eq!(normalize_input("ls", false), "ls");
    }

    #[test]
    fn normalize_is_idempotent() {
        for (data, is_command) in [
            ("ls\n\n", true),
            ("echo hi\n", false),
            ("a\rb\n", false),
            ("plain", true),
        ] {
            let once = normalize_input(data, is_command);
            let twice = normalize_input(&once, is_command);
            assert_eq!(once, twice, "not idempotent for {data:?}");
        }
    }

    #[test]
    fn normalized_commands_never_mix_terminators() {
        // Property: when the input had no \r, the output has no \n left.
        for data in ["ls\n", "a\nb", "x\n\n\n"] {
            let out = normalize_input(data, true);
            assert!(!out.contains('\n'), "output {out:?} still contains \\n");
            assert!(out.ends_with('\r'));
        }
    }
}

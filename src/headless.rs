//! Headless CLI executor — runs Cursor/Claude as a child process and streams
//! its newline-delimited JSON output through the session's output router.
//!
//! State machine per session: `idle → running → idle`, leaving `running` on
//! the first of: the CLI's `result` record, the completion deadline, or
//! subprocess exit. Exactly one command is in flight per session; a busy
//! session rejects new commands.
//!
//! Continuation: the first JSON record carrying a `session_id` rewrites the
//! session's CLI session id; subsequent commands resume it (`--resume` by
//! default, `--session-id` behind configuration).

use std::process::Stdio;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{HeadlessConfig, ResumeFlag};
use crate::history::{ChatHistoryStore, MessageType};
use crate::output::OutputRouter;
use crate::protocol;
use crate::sessions::TerminalType;
use crate::tunnel::FrameSender;
use crate::util::now_ms;

/// Per-session headless executor state.
pub struct HeadlessState {
    /// True for exactly the interval between command acceptance and the first
    /// of completion event, deadline, or subprocess exit.
    pub running: bool,
    /// CLI-issued session id used for continuation. Server-assigned; only
    /// rewritten by the CLI's own records.
    pub cli_session_id: Option<String>,
    /// Whether the current command produced a `result` record.
    pub last_result_seen: bool,
    /// Process group of the live subprocess.
    pub child_pgid: Option<i32>,
    /// Epoch-ms deadline for the in-flight command (informational).
    pub completion_deadline_ms: Option<u64>,
    /// Armed deadline timer; aborted when the command completes first.
    pub deadline_task: Option<tokio::task::JoinHandle<()>>,
}

impl HeadlessState {
    pub fn new() -> Self {
        Self {
            running: false,
            cli_session_id: None,
            last_result_seen: false,
            child_pgid: None,
            completion_deadline_ms: None,
            deadline_task: None,
        }
    }
}

impl Default for HeadlessState {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors from command submission.
#[derive(Debug)]
pub enum HeadlessError {
    /// A command is already in flight for this session.
    Busy,
    /// The CLI binary could not be started.
    Spawn(String),
    /// Anything else (unknown session, wrong session type, PTY write failure).
    Failed(String),
}

impl std::fmt::Display for HeadlessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeadlessError::Busy => write!(f, "session busy"),
            HeadlessError::Spawn(e) => write!(f, "Failed to spawn CLI: {e}"),
            HeadlessError::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Everything a command run needs, snapshot from the session entry.
pub struct CommandContext {
    pub session_id: String,
    pub terminal_type: TerminalType,
    pub working_dir: String,
    pub command: String,
    pub config: HeadlessConfig,
    pub state: Arc<Mutex<HeadlessState>>,
    pub router: Arc<Mutex<OutputRouter>>,
    pub frames: FrameSender,
    pub history: Option<Arc<ChatHistoryStore>>,
}

/// Shared handles for the background tasks of one run.
#[derive(Clone)]
struct RunHandles {
    session_id: String,
    state: Arc<Mutex<HeadlessState>>,
    router: Arc<Mutex<OutputRouter>>,
    frames: FrameSender,
    history: Option<Arc<ChatHistoryStore>>,
}

/// Build the CLI invocation for a headless command.
pub fn build_args(
    terminal_type: TerminalType,
    config: &HeadlessConfig,
    prompt: &str,
    cli_session_id: Option<&str>,
) -> (String, Vec<String>) {
    match terminal_type {
        TerminalType::Cursor => {
            let mut args: Vec<String> = vec![
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--print".to_string(),
            ];
            if let Some(id) = cli_session_id {
                args.push("--resume".to_string());
                args.push(id.to_string());
            }
            args.extend(config.cursor_extra_args.iter().cloned());
            args.push(prompt.to_string());
            (config.cursor_bin.clone(), args)
        }
        TerminalType::Claude => {
            let mut args: Vec<String> = vec![
                "--verbose".to_string(),
                "--print".to_string(),
                "-p".to_string(),
                prompt.to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
            ];
            if let Some(id) = cli_session_id {
                match config.resume_flag {
                    ResumeFlag::Resume => args.push("--resume".to_string()),
                    ResumeFlag::SessionId => args.push("--session-id".to_string()),
                }
                args.push(id.to_string());
            }
            args.extend(config.claude_extra_args.iter().cloned());
            (config.claude_bin.clone(), args)
        }
        _ => unreachable!("headless executor only runs cursor/claude sessions"),
    }
}

/// SIGTERM grace before SIGKILL when clearing a lingering subprocess. Claude
/// holds a session lock that needs time to release; Cursor lets go faster.
fn kill_grace_ms(terminal_type: TerminalType) -> u64 {
    match terminal_type {
        TerminalType::Claude => 1500,
        _ => 500,
    }
}

fn pgid_alive(pgid: i32) -> bool {
    unsafe { libc::kill(-pgid, 0) == 0 }
}

/// SIGTERM a process group, wait up to `grace_ms`, then SIGKILL survivors.
async fn kill_lingering(pgid: i32, grace_ms: u64) {
    if !pgid_alive(pgid) {
        return;
    }
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }
    let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_millis(grace_ms);
    while tokio::time::Instant::now() < deadline {
        if !pgid_alive(pgid) {
            return;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

/// Wrap a chat message as a `terminal_output` frame; the relay forwards the
/// inner object verbatim to terminal-stream subscribers.
fn chat_frame(session_id: &str, message_type: &str, content: &str, completion: bool) -> Value {
    let mut message = json!({
        "type": "chat_message",
        "id": uuid::Uuid::new_v4().to_string(),
        "session_id": session_id,
        "timestamp": now_ms(),
        "message_type": message_type,
        "content": content,
    });
    if completion {
        message["metadata"] = json!({"completion": true});
    }
    protocol::terminal_output(session_id, &message.to_string())
}

/// Submit a command. Returns once the subprocess is spawned; output streams
/// through the router in background tasks.
pub async fn run_command(ctx: CommandContext) -> Result<(), HeadlessError> {
    // Accept or reject under the state lock; remember any prior subprocess.
    let (prior_pgid, cli_session_id) = {
        let mut state = ctx.state.lock().await;
        if state.running {
            return Err(HeadlessError::Busy);
        }
        state.running = true;
        state.last_result_seen = false;
        (state.child_pgid.take(), state.cli_session_id.clone())
    };

    // Honor the CLI's own session lock: a lingering subprocess gets SIGTERM, a
    // CLI-specific grace, then SIGKILL.
    if let Some(pgid) = prior_pgid {
        kill_lingering(pgid, kill_grace_ms(ctx.terminal_type)).await;
    }

    let (bin, args) = build_args(
        ctx.terminal_type,
        &ctx.config,
        &ctx.command,
        cli_session_id.as_deref(),
    );

    ctx.router.lock().await.begin_command(&ctx.command);
    ctx.frames
        .send(chat_frame(&ctx.session_id, "user", &ctx.command, false));
    if let Some(history) = &ctx.history {
        let _ = history
            .add_message(&ctx.session_id, MessageType::User, &ctx.command, None)
            .await;
    }

    let mut cmd = Command::new(&bin);
    cmd.args(&args)
        .current_dir(&ctx.working_dir)
        .env("TERM", "xterm-256color")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }

    let handles = RunHandles {
        session_id: ctx.session_id.clone(),
        state: Arc::clone(&ctx.state),
        router: Arc::clone(&ctx.router),
        frames: ctx.frames.clone(),
        history: ctx.history.clone(),
    };

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let message = format!("Failed to start {bin}: {e}");
            warn!(session_id = %ctx.session_id, "{message}");
            fail(&handles, &message).await;
            return Err(HeadlessError::Spawn(e.to_string()));
        }
    };

    let pid = child.id().unwrap_or(0);
    #[allow(clippy::cast_possible_wrap)]
    let pgid = pid as i32;

    let deadline_secs = ctx.config.completion_timeout_secs;
    {
        let mut state = ctx.state.lock().await;
        state.child_pgid = Some(pgid);
        state.completion_deadline_ms = Some(now_ms() + deadline_secs * 1000);

        // Arm the hard completion deadline: force-kill and assert completion
        // with whatever text accumulated.
        let deadline_handles = handles.clone();
        state.deadline_task = Some(tokio::spawn(async move {
            tokio::time::sleep(tokio::time::Duration::from_secs(deadline_secs)).await;
            warn!(
                session_id = %deadline_handles.session_id,
                "Headless command hit the {deadline_secs}s deadline, force-killing"
            );
            if pgid > 0 {
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
            }
            finish(&deadline_handles, false).await;
        }));
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // stdout: JSON lines → router (display + recording) + state machine.
    if let Some(stdout) = stdout {
        let h = handles.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                h.router.lock().await.on_output(&format!("{line}\n"));

                let Ok(value) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                if let Some(id) = value["session_id"].as_str() {
                    let mut state = h.state.lock().await;
                    if state.cli_session_id.as_deref() != Some(id) {
                        info!(session_id = %h.session_id, cli_session_id = %id, "CLI session id updated");
                        state.cli_session_id = Some(id.to_string());
                    }
                }
                if value["type"].as_str() == Some("result") {
                    h.state.lock().await.last_result_seen = true;
                    finish(&h, true).await;
                }
            }
        });
    }

    // stderr: surfaced in the display stream only.
    if let Some(stderr) = stderr {
        let h = handles.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    h.router.lock().await.on_output(&format!("{line}\n"));
                }
            }
        });
    }

    // Exit watcher: unlocks the session on every path.
    let h = handles;
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => {
                let result_seen = h.state.lock().await.last_result_seen;
                if !status.success() && !result_seen {
                    let code = status.code().unwrap_or(-1);
                    fail(&h, &format!("CLI exited with code {code}")).await;
                } else {
                    finish(&h, true).await;
                }
            }
            Err(e) => fail(&h, &format!("CLI wait error: {e}")).await,
        }
    });

    Ok(())
}

/// Unlock the session and assert completion exactly once.
async fn finish(h: &RunHandles, abort_deadline: bool) {
    {
        let mut state = h.state.lock().await;
        if !state.running {
            return;
        }
        state.running = false;
        state.completion_deadline_ms = None;
        state.child_pgid = None;
        if abort_deadline {
            if let Some(task) = state.deadline_task.take() {
                task.abort();
            }
        } else {
            // The deadline task is finishing itself; just drop the handle.
            state.deadline_task.take();
        }
    }

    let text = {
        let mut router = h.router.lock().await;
        let text = router.completion_text();
        router.complete();
        text
    };

    if !text.is_empty() {
        h.frames
            .send(chat_frame(&h.session_id, "assistant", &text, true));
        if let Some(history) = &h.history {
            let _ = history
                .add_message(
                    &h.session_id,
                    MessageType::Assistant,
                    &text,
                    Some(json!({"completion": true})),
                )
                .await;
        }
    }
    info!(session_id = %h.session_id, "Headless command finished");
}

/// Record an execution failure and unlock the session.
async fn fail(h: &RunHandles, message: &str) {
    h.frames.send(chat_frame(&h.session_id, "error", message, false));
    if let Some(history) = &h.history {
        let _ = history
            .add_message(&h.session_id, MessageType::Error, message, None)
            .await;
    }
    finish(h, true).await;
}

/// Cancel any in-flight command (session destroy): abort the deadline, kill
/// the subprocess group, and unlock.
pub async fn cancel(state: &Arc<Mutex<HeadlessState>>) {
    let mut guard = state.lock().await;
    if let Some(task) = guard.deadline_task.take() {
        task.abort();
    }
    if let Some(pgid) = guard.child_pgid.take() {
        if pgid > 0 && pgid_alive(pgid) {
            unsafe {
                libc::kill(-pgid, libc::SIGTERM);
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
    guard.running = false;
    guard.completion_deadline_ms = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeadlessConfig;

    fn config() -> HeadlessConfig {
        HeadlessConfig::default()
    }

    #[test]
    fn cursor_args_fresh() {
        let (bin, args) = build_args(TerminalType::Cursor, &config(), "fix the bug", None);
        assert_eq!(bin, "cursor-agent");
        assert_eq!(
            args,
            vec!["--output-format", "stream-json", "--print", "fix the bug"]
        );
    }

    #[test]
    fn cursor_args_resume() {
        let (_, args) = build_args(TerminalType::Cursor, &config(), "continue", Some("abc"));
        let resume_idx = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume_idx + 1], "abc");
        assert_eq!(args.last().unwrap(), "continue");
    }

    #[test]
    fn claude_args_fresh() {
        let (bin, args) = build_args(TerminalType::Claude, &config(), "explain", None);
        assert_eq!(bin, "claude");
        assert_eq!(
            args,
            vec![
                "--verbose",
                "--print",
                "-p",
                "explain",
                "--output-format",
                "stream-json"
            ]
        );
    }

    #[test]
    fn claude_args_resume_flag_variants() {
        let mut cfg = config();
        let (_, args) = build_args(TerminalType::Claude, &cfg, "go", Some("xyz"));
        assert!(args.contains(&"--resume".to_string()));
        assert!(!args.contains(&"--session-id".to_string()));

        cfg.resume_flag = ResumeFlag::SessionId;
        let (_, args) = build_args(TerminalType::Claude, &cfg, "go", Some("xyz"));
        assert!(args.contains(&"--session-id".to_string()));
        assert!(!args.contains(&"--resume".to_string()));
    }

    #[test]
    fn extra_args_are_appended() {
        let mut cfg = config();
        cfg.claude_extra_args = vec!["--model".to_string(), "opus".to_string()];
        cfg.cursor_extra_args = vec!["--force".to_string()];

        let (_, args) = build_args(TerminalType::Claude, &cfg, "p", None);
        assert_eq!(&args[args.len() - 2..], ["--model", "opus"]);

        let (_, args) = build_args(TerminalType::Cursor, &cfg, "p", None);
        // Extra args come before the prompt for cursor
        assert_eq!(args[args.len() - 2], "--force");
        assert_eq!(args.last().unwrap(), "p");
    }

    #[test]
    fn kill_grace_is_cli_specific() {
        assert_eq!(kill_grace_ms(TerminalType::Claude), 1500);
        assert_eq!(kill_grace_ms(TerminalType::Cursor), 500);
    }

    #[tokio::test]
    async fn busy_session_rejects_commands() {
        let state = Arc::new(Mutex::new(HeadlessState::new()));
        state.lock().await.running = true;

        let frames = FrameSender::new();
        let router = Arc::new(Mutex::new(OutputRouter::new(
            "s1",
            TerminalType::Claude,
            frames.clone(),
        )));
        let ctx = CommandContext {
            session_id: "s1".to_string(),
            terminal_type: TerminalType::Claude,
            working_dir: "/".to_string(),
            command: "hi".to_string(),
            config: config(),
            state,
            router,
            frames,
            history: None,
        };
        match run_command(ctx).await {
            Err(HeadlessError::Busy) => {}
            other => panic!("expected Busy, got {other:?}"),
        }
    }
}

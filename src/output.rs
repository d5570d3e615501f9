//! Output router — splits a session's raw output into the display stream and
//! the recording stream.
//!
//! Display: every chunk is forwarded verbatim as a `terminal_output` frame.
//! Recording (headless/agent sessions only): chunks run through a
//! line-buffered JSON extractor; assistant text is deduplicated against the
//! previous delta, accumulated into `full_text` (blank-line separated), and
//! emitted as `recording_output` updates. Exactly one `is_complete=true`
//! update is emitted per command — on the CLI's `result` record, on the
//! completion deadline, or on command interruption.
//!
//! The router never blocks the PTY reader: frames go out through the
//! non-blocking [`FrameSender`].

use serde_json::Value;

use crate::protocol;
use crate::screen::ScreenEmulator;
use crate::sessions::TerminalType;
use crate::tunnel::FrameSender;

/// Per-session output router.
pub struct OutputRouter {
    session_id: String,
    terminal_type: TerminalType,
    frames: FrameSender,
    screen: ScreenEmulator,
    /// Partial-line accumulator for the JSON extractor.
    line_buf: String,
    full_text: String,
    last_delta: String,
    last_command: String,
    /// Set once the final update for the current command has gone out.
    completed: bool,
}

impl OutputRouter {
    pub fn new(session_id: &str, terminal_type: TerminalType, frames: FrameSender) -> Self {
        Self {
            session_id: session_id.to_string(),
            terminal_type,
            frames,
            screen: ScreenEmulator::new(),
            line_buf: String::new(),
            full_text: String::new(),
            last_delta: String::new(),
            last_command: String::new(),
            completed: false,
        }
    }

    /// Whether this session derives a recording stream at all.
    fn records(&self) -> bool {
        matches!(
            self.terminal_type,
            TerminalType::Cursor | TerminalType::Claude | TerminalType::Agent
        )
    }

    /// Route one chunk of raw session output.
    pub fn on_output(&mut self, data: &str) {
        self.frames
            .send(protocol::terminal_output(&self.session_id, data));
        self.screen.process(data);

        if !self.records() {
            return;
        }

        self.line_buf.push_str(data);
        while let Some(pos) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                self.process_json_line(line);
            }
        }
    }

    /// Parse one complete line; emit a recording update when it carries
    /// assistant text.
    fn process_json_line(&mut self, line: &str) {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return;
        };
        if let Some(text) = extract_assistant_text(&value) {
            self.push_assistant_text(&text, Some(line));
        }
        if value["type"].as_str() == Some("result") {
            self.complete();
        }
    }

    /// Deduplicate against the previous delta, accumulate, and emit an
    /// incremental recording update. Used for both parsed CLI output and
    /// agent-handler assistant messages.
    pub fn push_assistant_text(&mut self, text: &str, raw: Option<&str>) {
        if text.is_empty() || text == self.last_delta {
            return;
        }
        if self.full_text.is_empty() {
            self.full_text = text.to_string();
        } else {
            self.full_text.push_str("\n\n");
            self.full_text.push_str(text);
        }
        self.last_delta = text.to_string();
        self.completed = false;
        self.frames.send(protocol::recording_output(
            &self.session_id,
            &self.full_text,
            text,
            raw,
            Some(false),
        ));
    }

    /// Emit the final `is_complete=true` update for the current command.
    ///
    /// Falls back to the last delta when nothing accumulated. Idempotent:
    /// at most one final update per command.
    pub fn complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        let text = if self.full_text.is_empty() {
            self.last_delta.clone()
        } else {
            self.full_text.clone()
        };
        self.frames.send(protocol::recording_output(
            &self.session_id,
            &text,
            &text,
            None,
            Some(true),
        ));
    }

    /// Handle normalized input keystrokes. A chunk ending in `\r`/`\n` starts
    /// a new command: emulator, extractor, and accumulators reset, and the
    /// last non-empty input line is captured as the pending command.
    pub fn on_input(&mut self, data: &str) {
        if !(data.ends_with('\r') || data.ends_with('\n')) {
            return;
        }
        if let Some(command) = data
            .split(['\r', '\n'])
            .filter(|l| !l.trim().is_empty())
            .next_back()
        {
            self.last_command = command.trim().to_string();
        }
        self.reset_command_state();
    }

    /// Arm the router for a headless command (bypasses the PTY input path).
    pub fn begin_command(&mut self, command: &str) {
        self.last_command = command.to_string();
        self.reset_command_state();
    }

    /// Record one complete assistant turn (agent sessions): fresh state, one
    /// incremental update, one final update.
    pub fn record_turn(&mut self, text: &str) {
        self.reset_command_state();
        self.push_assistant_text(text, None);
        self.complete();
    }

    fn reset_command_state(&mut self) {
        self.screen.reset();
        self.line_buf.clear();
        self.full_text.clear();
        self.last_delta.clear();
        self.completed = false;
    }

    pub fn last_command(&self) -> &str {
        &self.last_command
    }

    /// The text a completion carries: accumulated full text, or the last
    /// delta when nothing accumulated.
    pub fn completion_text(&self) -> String {
        if self.full_text.is_empty() {
            self.last_delta.clone()
        } else {
            self.full_text.clone()
        }
    }

    pub fn full_text(&self) -> &str {
        &self.full_text
    }

    /// Stable final frame from the screen emulator.
    pub fn screen_content(&self) -> String {
        self.screen.screen_content()
    }
}

/// Extract user-facing assistant text from one stream-json record.
///
/// Candidates, longest preferred:
/// - `assistant` records: the joined `message.content[].text` parts
/// - `result` records: `summary`, `text`, or a string `result`
/// - any record carrying `delta.text`
pub fn extract_assistant_text(value: &Value) -> Option<String> {
    let mut candidates: Vec<String> = Vec::new();

    match value["type"].as_str() {
        Some("assistant") => {
            if let Some(content) = value["message"]["content"].as_array() {
                let parts: Vec<&str> = content
                    .iter()
                    .filter(|block| block["type"].as_str() == Some("text"))
                    .filter_map(|block| block["text"].as_str())
                    .collect();
                if !parts.is_empty() {
                    candidates.push(parts.join("\n"));
                }
            }
        }
        Some("result") => {
            for key in ["summary", "text", "result"] {
                if let Some(s) = value[key].as_str() {
                    if !s.is_empty() {
                        candidates.push(s.to_string());
                    }
                }
            }
        }
        _ => {}
    }

    if let Some(s) = value["delta"]["text"].as_str() {
        if !s.is_empty() {
            candidates.push(s.to_string());
        }
    }

    candidates.into_iter().max_by_key(String::len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn router(terminal_type: TerminalType) -> (OutputRouter, mpsc::Receiver<Value>) {
        let frames = FrameSender::new();
        let (tx, rx) = mpsc::channel(64);
        frames.install(tx);
        (OutputRouter::new("s1", terminal_type, frames), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Value>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn extraction_rules() {
        let assistant = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Hello"},
                {"type": "tool_use", "name": "Bash"},
                {"type": "text", "text": "world"},
            ]},
        });
        assert_eq!(extract_assistant_text(&assistant).unwrap(), "Hello\nworld");

        let result = json!({"type": "result", "result": "short", "summary": "a longer summary"});
        assert_eq!(
            extract_assistant_text(&result).unwrap(),
            "a longer summary"
        );

        let delta = json!({"type": "stream", "delta": {"text": "chunk"}});
        assert_eq!(extract_assistant_text(&delta).unwrap(), "chunk");

        assert!(extract_assistant_text(&json!({"type": "system"})).is_none());
        assert!(extract_assistant_text(&json!({"type": "result"})).is_none());
    }

    #[test]
    fn regular_sessions_only_get_display() {
        let (mut router, mut rx) = router(TerminalType::Regular);
        router.on_output("{\"type\":\"assistant\"}\n");
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "terminal_output");
    }

    #[test]
    fn headless_accumulates_and_completes_once() {
        let (mut router, mut rx) = router(TerminalType::Claude);
        router.begin_command("do a thing");

        let first = json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "step one"}]}});
        let second = json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "step two"}]}});
        router.on_output(&format!("{first}\n{second}\n"));
        router.on_output("{\"type\":\"result\",\"result\":\"step two\"}\n");

        let frames = drain(&mut rx);
        let recordings: Vec<&Value> = frames
            .iter()
            .filter(|f| f["type"] == "recording_output")
            .collect();
        assert_eq!(recordings.len(), 3);
        assert_eq!(recordings[0]["delta"], "step one");
        assert_eq!(recordings[0]["is_complete"], false);
        assert_eq!(recordings[1]["text"], "step one\n\nstep two");

        let finals: Vec<&&Value> = recordings
            .iter()
            .filter(|f| f["is_complete"] == true)
            .collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0]["text"], "step one\n\nstep two");

        // A second completion (e.g. deadline after result) is a no-op
        router.complete();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn duplicate_delta_is_suppressed() {
        let (mut router, mut rx) = router(TerminalType::Claude);
        let line = json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "same"}]}});
        router.on_output(&format!("{line}\n{line}\n"));

        let recordings: Vec<Value> = drain(&mut rx)
            .into_iter()
            .filter(|f| f["type"] == "recording_output")
            .collect();
        assert_eq!(recordings.len(), 1);
        assert_eq!(recordings[0]["text"], "same");
    }

    #[test]
    fn completion_falls_back_to_last_delta() {
        let (mut router, mut rx) = router(TerminalType::Claude);
        // A result record with no accumulated text: the result string itself
        // becomes the delta, then the final update re-uses it.
        router.on_output("{\"type\":\"result\",\"result\":\"fallback answer\"}\n");
        let recordings: Vec<Value> = drain(&mut rx)
            .into_iter()
            .filter(|f| f["type"] == "recording_output")
            .collect();
        assert_eq!(recordings.last().unwrap()["is_complete"], true);
        assert_eq!(recordings.last().unwrap()["text"], "fallback answer");
    }

    #[test]
    fn partial_lines_are_buffered_across_chunks() {
        let (mut router, mut rx) = router(TerminalType::Claude);
        let line = json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "split line"}]}}).to_string();
        let (a, b) = line.split_at(line.len() / 2);
        router.on_output(a);
        assert!(drain(&mut rx)
            .iter()
            .all(|f| f["type"] == "terminal_output"));
        router.on_output(&format!("{b}\n"));
        let recordings: Vec<Value> = drain(&mut rx)
            .into_iter()
            .filter(|f| f["type"] == "recording_output")
            .collect();
        assert_eq!(recordings.len(), 1);
        assert_eq!(recordings[0]["delta"], "split line");
    }

    #[test]
    fn input_reset_captures_last_command() {
        let (mut router, mut rx) = router(TerminalType::Claude);
        let line = json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "old text"}]}});
        router.on_output(&format!("{line}\n"));
        drain(&mut rx);

        // Keystrokes without a terminator do not reset
        router.on_input("ls -l");
        assert_eq!(router.full_text(), "old text");

        router.on_input("ls -la\r");
        assert_eq!(router.last_command(), "ls -la");
        assert_eq!(router.full_text(), "");
        assert_eq!(router.screen_content(), "");
    }

    #[test]
    fn non_json_lines_are_ignored_for_recording() {
        let (mut router, mut rx) = router(TerminalType::Cursor);
        router.on_output("plain shell noise\nmore noise\n");
        assert!(drain(&mut rx)
            .iter()
            .all(|f| f["type"] == "terminal_output"));
    }
}

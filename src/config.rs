//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `PORT`, `PUBLIC_HOST`, `PUBLIC_PROTOCOL`,
//!    `TUNNEL_REGISTRATION_API_KEY`, `RELAY_URL`, `TUNNEL_ID`, `SHELL`,
//!    `WORK_ROOT_PATH`, `CLAUDE_HEADLESS_BIN`, `CURSOR_HEADLESS_BIN`,
//!    `CLAUDE_HEADLESS_EXTRA_ARGS`, `CURSOR_HEADLESS_EXTRA_ARGS`,
//!    `HEADLESS_COMPLETION_TIMEOUT_SECS`, `HEADLESS_RESUME_FLAG`,
//!    `AGENT_PROVIDER`, `AGENT_API_KEY`, `AGENT_MODEL_NAME`, `AGENT_BASE_URL`,
//!    `AGENT_TEMPERATURE`, `LOG_LEVEL`
//! 2. **Config file** — path via `--config <path>`, or `echoshell.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [relay]
//! port = 8000
//! public_host = "relay.example.com"
//! public_protocol = "https"
//! registration_api_key = "your-secret-key"
//!
//! [station]
//! relay_url = "wss://relay.example.com"
//! tunnel_id = "a1b2c3d4e5f60718"
//! shell = "/bin/bash"
//! work_root = "~"
//!
//! [headless]
//! claude_bin = "claude"
//! cursor_bin = "cursor-agent"
//! completion_timeout_secs = 60
//! resume_flag = "resume"   # or "session-id"
//!
//! [agent]
//! provider = "openai"
//! model_name = "gpt-4o-mini"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML with env overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub station: StationConfig,
    #[serde(default)]
    pub headless: HeadlessConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// TCP port to bind (default 8000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public hostname used to build `publicUrl`/`wsUrl` in tunnel configs.
    /// Defaults to `localhost:<port>` when unset.
    #[serde(default)]
    pub public_host: Option<String>,
    /// `http` or `https` (default `http`). The WS scheme is derived from it.
    #[serde(default = "default_public_protocol")]
    pub public_protocol: String,
    /// Static registration key for `POST /tunnel/create`. Required in relay
    /// mode; startup fails when absent.
    #[serde(default)]
    pub registration_api_key: Option<String>,
    /// Maximum concurrent TCP connections (default 256).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds before a pending proxied request times out (default 30).
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,
    /// Seconds between WS pings on managed sockets (default 20).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Seconds without a pong before a socket is reaped (default 30).
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
    /// Also re-emit a completed `recording_output` as `tts_ready` for clients
    /// predating the dedicated trigger (default true).
    #[serde(default = "default_legacy_tts_trigger")]
    pub legacy_tts_trigger: bool,
}

/// Workstation agent settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StationConfig {
    /// Relay base URL, e.g. `wss://relay.example.com`. Required in agent mode.
    #[serde(default)]
    pub relay_url: Option<String>,
    /// Tunnel id to register under. A fresh one is requested from the relay
    /// when unset.
    #[serde(default)]
    pub tunnel_id: Option<String>,
    /// Registration key used to create/restore the tunnel.
    #[serde(default)]
    pub registration_api_key: Option<String>,
    /// Login shell for PTY sessions (default `$SHELL`, fallback `bash`).
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Root directory for new sessions (default `~`).
    #[serde(default = "default_work_root")]
    pub work_root: String,
    /// Maximum concurrent terminal sessions (default 20).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Output ring entries kept per session (default 10000).
    #[serde(default = "default_output_ring")]
    pub output_ring_size: usize,
    /// Input ring entries kept per session (default 1000).
    #[serde(default = "default_input_ring")]
    pub input_ring_size: usize,
    /// Initial reconnect backoff in seconds (default 1).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Reconnect backoff cap in seconds (default 30).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Consecutive failures before the client surfaces `disconnected`
    /// (default 5).
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_report_attempts: u32,
    /// Directory for persisted state (default `~/.echoshell`).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Which CLI flag carries the continuation session id for Claude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResumeFlag {
    /// `--resume <id>` (preferred).
    Resume,
    /// `--session-id <id>` (seen in older CLI builds).
    SessionId,
}

/// Headless CLI executor settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HeadlessConfig {
    /// Claude CLI binary (default `claude`).
    #[serde(default = "default_claude_bin")]
    pub claude_bin: String,
    /// Cursor CLI binary (default `cursor-agent`).
    #[serde(default = "default_cursor_bin")]
    pub cursor_bin: String,
    /// Extra args appended to every Claude invocation.
    #[serde(default)]
    pub claude_extra_args: Vec<String>,
    /// Extra args appended to every Cursor invocation.
    #[serde(default)]
    pub cursor_extra_args: Vec<String>,
    /// Hard completion deadline per command in seconds (default 60).
    #[serde(default = "default_completion_timeout")]
    pub completion_timeout_secs: u64,
    /// Continuation flag for Claude (default `resume`).
    #[serde(default = "default_resume_flag")]
    pub resume_flag: ResumeFlag,
}

/// LLM/STT/TTS provider settings for the agent event handler.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    /// Provider name (e.g. `openai`). None disables STT/TTS.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` or
    /// `LOG_LEVEL` env vars.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_port() -> u16 {
    8000
}
fn default_public_protocol() -> String {
    "http".to_string()
}
fn default_max_connections() -> usize {
    256
}
fn default_proxy_timeout() -> u64 {
    30
}
fn default_ping_interval() -> u64 {
    20
}
fn default_pong_timeout() -> u64 {
    30
}
fn default_legacy_tts_trigger() -> bool {
    true
}
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string())
}
fn default_work_root() -> String {
    "~".to_string()
}
fn default_max_sessions() -> usize {
    20
}
fn default_output_ring() -> usize {
    10_000
}
fn default_input_ring() -> usize {
    1_000
}
fn default_reconnect_delay() -> u64 {
    1
}
fn default_reconnect_max_delay() -> u64 {
    30
}
fn default_reconnect_attempts() -> u32 {
    5
}
fn default_data_dir() -> String {
    "~/.echoshell".to_string()
}
fn default_claude_bin() -> String {
    "claude".to_string()
}
fn default_cursor_bin() -> String {
    "cursor-agent".to_string()
}
fn default_completion_timeout() -> u64 {
    60
}
fn default_resume_flag() -> ResumeFlag {
    ResumeFlag::Resume
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            public_host: None,
            public_protocol: default_public_protocol(),
            registration_api_key: None,
            max_connections: default_max_connections(),
            proxy_timeout_secs: default_proxy_timeout(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            legacy_tts_trigger: default_legacy_tts_trigger(),
        }
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            tunnel_id: None,
            registration_api_key: None,
            shell: default_shell(),
            work_root: default_work_root(),
            max_sessions: default_max_sessions(),
            output_ring_size: default_output_ring(),
            input_ring_size: default_input_ring(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            reconnect_report_attempts: default_reconnect_attempts(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            claude_bin: default_claude_bin(),
            cursor_bin: default_cursor_bin(),
            claude_extra_args: Vec::new(),
            cursor_extra_args: Vec::new(),
            completion_timeout_secs: default_completion_timeout(),
            resume_flag: default_resume_flag(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Split a shell-ish extra-args string on whitespace. Quoting is intentionally
/// not supported; args with spaces belong in the TOML array form.
fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(ToString::to_string).collect()
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `echoshell.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("echoshell.toml").exists() {
            let content =
                std::fs::read_to_string("echoshell.toml").expect("Failed to read echoshell.toml");
            toml::from_str(&content).expect("Failed to parse echoshell.toml")
        } else {
            Config::default()
        };

        config.apply_env();
        config
    }

    /// Apply environment-variable overrides onto the loaded config.
    fn apply_env(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(p) = port.parse() {
                self.relay.port = p;
            }
        }
        if let Ok(host) = std::env::var("PUBLIC_HOST") {
            self.relay.public_host = Some(host);
        }
        if let Ok(proto) = std::env::var("PUBLIC_PROTOCOL") {
            self.relay.public_protocol = proto;
        }
        if let Ok(key) = std::env::var("TUNNEL_REGISTRATION_API_KEY") {
            self.relay.registration_api_key = Some(key.clone());
            self.station.registration_api_key = Some(key);
        }
        if let Ok(url) = std::env::var("RELAY_URL") {
            self.station.relay_url = Some(url);
        }
        if let Ok(id) = std::env::var("TUNNEL_ID") {
            self.station.tunnel_id = Some(id);
        }
        if let Ok(shell) = std::env::var("SHELL") {
            self.station.shell = shell;
        }
        if let Ok(root) = std::env::var("WORK_ROOT_PATH") {
            self.station.work_root = root;
        }
        if let Ok(bin) = std::env::var("CLAUDE_HEADLESS_BIN") {
            self.headless.claude_bin = bin;
        }
        if let Ok(bin) = std::env::var("CURSOR_HEADLESS_BIN") {
            self.headless.cursor_bin = bin;
        }
        if let Ok(args) = std::env::var("CLAUDE_HEADLESS_EXTRA_ARGS") {
            self.headless.claude_extra_args = split_args(&args);
        }
        if let Ok(args) = std::env::var("CURSOR_HEADLESS_EXTRA_ARGS") {
            self.headless.cursor_extra_args = split_args(&args);
        }
        if let Ok(secs) = std::env::var("HEADLESS_COMPLETION_TIMEOUT_SECS") {
            if let Ok(s) = secs.parse() {
                self.headless.completion_timeout_secs = s;
            }
        }
        if let Ok(flag) = std::env::var("HEADLESS_RESUME_FLAG") {
            match flag.as_str() {
                "session-id" => self.headless.resume_flag = ResumeFlag::SessionId,
                "resume" => self.headless.resume_flag = ResumeFlag::Resume,
                other => tracing::warn!("Unknown HEADLESS_RESUME_FLAG '{other}', keeping default"),
            }
        }
        if let Ok(provider) = std::env::var("AGENT_PROVIDER") {
            self.agent.provider = Some(provider);
        }
        if let Ok(key) = std::env::var("AGENT_API_KEY") {
            self.agent.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("AGENT_MODEL_NAME") {
            self.agent.model_name = Some(model);
        }
        if let Ok(url) = std::env::var("AGENT_BASE_URL") {
            self.agent.base_url = Some(url);
        }
        if let Ok(temp) = std::env::var("AGENT_TEMPERATURE") {
            if let Ok(t) = temp.parse() {
                self.agent.temperature = Some(t);
            }
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Validate the relay-mode config. Returns human-readable errors.
    pub fn validate_relay(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self
            .relay
            .registration_api_key
            .as_deref()
            .is_none_or(str::is_empty)
        {
            errors.push("TUNNEL_REGISTRATION_API_KEY is required in relay mode".to_string());
        }
        if !matches!(self.relay.public_protocol.as_str(), "http" | "https") {
            errors.push(format!(
                "PUBLIC_PROTOCOL must be http or https, got '{}'",
                self.relay.public_protocol
            ));
        }
        errors
    }

    /// Validate the agent-mode config. Returns human-readable errors.
    pub fn validate_station(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.station.relay_url.as_deref().is_none_or(str::is_empty) {
            errors.push("RELAY_URL is required in agent mode".to_string());
        }
        if self
            .station
            .registration_api_key
            .as_deref()
            .is_none_or(str::is_empty)
        {
            errors.push("TUNNEL_REGISTRATION_API_KEY is required in agent mode".to_string());
        }
        errors
    }

    /// Public base URL of the relay, e.g. `https://relay.example.com`.
    pub fn public_url(&self) -> String {
        let host = self
            .relay
            .public_host
            .clone()
            .unwrap_or_else(|| format!("localhost:{}", self.relay.port));
        format!("{}://{}", self.relay.public_protocol, host)
    }

    /// Public WS base URL of the relay, e.g. `wss://relay.example.com`.
    pub fn public_ws_url(&self) -> String {
        let scheme = if self.relay.public_protocol == "https" {
            "wss"
        } else {
            "ws"
        };
        let host = self
            .relay
            .public_host
            .clone()
            .unwrap_or_else(|| format!("localhost:{}", self.relay.port));
        format!("{scheme}://{host}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.relay.port, 8000);
        assert_eq!(config.relay.proxy_timeout_secs, 30);
        assert_eq!(config.relay.ping_interval_secs, 20);
        assert_eq!(config.relay.pong_timeout_secs, 30);
        assert_eq!(config.headless.completion_timeout_secs, 60);
        assert_eq!(config.headless.resume_flag, ResumeFlag::Resume);
        assert_eq!(config.station.output_ring_size, 10_000);
        assert_eq!(config.station.input_ring_size, 1_000);
    }

    #[test]
    fn relay_validation_requires_registration_key() {
        let config = Config::default();
        let errors = config.validate_relay();
        assert!(errors.iter().any(|e| e.contains("TUNNEL_REGISTRATION")));

        let mut config = Config::default();
        config.relay.registration_api_key = Some("REG".to_string());
        assert!(config.validate_relay().is_empty());
    }

    #[test]
    fn public_urls_follow_protocol() {
        let mut config = Config::default();
        config.relay.public_host = Some("relay.example.com".to_string());
        config.relay.public_protocol = "https".to_string();
        assert_eq!(config.public_url(), "https://relay.example.com");
        assert_eq!(config.public_ws_url(), "wss://relay.example.com");

        config.relay.public_protocol = "http".to_string();
        assert_eq!(config.public_ws_url(), "ws://relay.example.com");
    }

    #[test]
    fn toml_round_trip() {
        let toml = r#"
            [relay]
            port = 9000
            registration_api_key = "REG"

            [headless]
            resume_flag = "session-id"
            claude_extra_args = ["--model", "opus"]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.relay.port, 9000);
        assert_eq!(config.headless.resume_flag, ResumeFlag::SessionId);
        assert_eq!(config.headless.claude_extra_args, vec!["--model", "opus"]);
    }
}

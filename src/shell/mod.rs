//! Shell process management.
//!
//! Two modes of shell interaction:
//!
//! - **One-shot** ([`process::exec_command`]) — run a command, capture output,
//!   return. Used by the agent event handler's direct execution path.
//! - **Interactive** ([`pty::spawn_shell_pty`]) — spawn the login shell on a
//!   PTY, used by terminal sessions.

pub mod process;
pub mod pty;

/// The login shell for new sessions: `$SHELL` with a `bash` fallback.
pub fn login_shell(configured: &str) -> String {
    if configured.is_empty() {
        "bash".to_string()
    } else {
        configured.to_string()
    }
}

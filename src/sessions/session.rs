//! A PTY-backed terminal session.
//!
//! [`PtySession`] wraps the login shell spawned on a PTY. Output is pushed to
//! the session's [`OutputBuffer`] *and* routed through the per-session
//! [`OutputRouter`], which emits display and recording frames; the session
//! itself never touches a socket. Input goes through a single stdin writer
//! task so PTY writes are serialized.
//!
//! ## Process groups
//!
//! The shell is a session leader (`setsid` in `pre_exec`), so signals sent to
//! `-pgid` reach the entire process tree.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};

use super::buffer::OutputBuffer;
use crate::output::OutputRouter;
use crate::shell::pty;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Exited,
}

/// A running shell session with buffer-backed, router-split I/O.
pub struct PtySession {
    /// OS process ID of the shell.
    pub pid: u32,
    /// Process group ID (equals pid since the shell is the session leader).
    pub pgid: u32,
    /// Shared output ring.
    pub buffer: Arc<Mutex<OutputBuffer>>,
    /// Session lifecycle status.
    pub status: Arc<Mutex<SessionStatus>>,
    /// Exit code, set when the process exits.
    pub exit_code: Arc<Mutex<Option<i32>>>,
    /// Channel to write data to the PTY master (raw bytes).
    stdin_tx: mpsc::Sender<Vec<u8>>,
    /// Handles to the background I/O tasks — aborted on kill.
    tasks: Vec<tokio::task::JoinHandle<()>>,
    /// PTY master fd, kept alive for resize.
    pty_master: OwnedFd,
}

impl PtySession {
    /// Spawn the I/O tasks for a PTY-backed session: stdin writer, output
    /// reader (buffer + router), and exit watcher.
    pub fn spawn(
        session_id: String,
        mut child: Child,
        pty_master: OwnedFd,
        buffer_size: usize,
        router: Arc<Mutex<OutputRouter>>,
    ) -> Result<Self, String> {
        let process_id = child.id().unwrap_or(0);
        // pgid = pid because the shell is the session leader via setsid()
        let process_group_id = process_id;

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(buffer_size)));
        let status = Arc::new(Mutex::new(SessionStatus::Running));
        let exit_code: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));

        let master_raw: RawFd = pty_master.as_raw_fd();

        // Dup the master fd: one for writing, one for reading, the original
        // kept for resize.
        let writer_fd: RawFd = unsafe { libc::dup(master_raw) };
        if writer_fd < 0 {
            return Err(format!(
                "dup() failed for PTY master writer: {}",
                std::io::Error::last_os_error()
            ));
        }
        let reader_fd: RawFd = unsafe { libc::dup(master_raw) };
        if reader_fd < 0 {
            unsafe {
                libc::close(writer_fd);
            }
            return Err(format!(
                "dup() failed for PTY master reader: {}",
                std::io::Error::last_os_error()
            ));
        }

        // SAFETY: we own these file descriptors via dup
        let master_write =
            tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(writer_fd) });
        let master_read =
            tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(reader_fd) });

        // stdin writer task: mpsc → PTY master. The single consumer serializes
        // all writes to the PTY.
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let stdin_task = tokio::spawn(async move {
            let mut writer = master_write;
            while let Some(data) = stdin_rx.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        // Output reader task: PTY master → buffer + router
        let sid_out = session_id.clone();
        let buf_out = Arc::clone(&buffer);
        let router_out = Arc::clone(&router);
        let output_task = tokio::spawn(async move {
            let mut reader = master_read;
            let mut tmp = [0u8; 4096];
            loop {
                match reader.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let data = String::from_utf8_lossy(&tmp[..n]).into_owned();
                        buf_out.lock().await.push(data.clone());
                        router_out.lock().await.on_output(&data);
                    }
                }
            }
            info!("Session {sid_out} PTY output closed");
        });

        // Exit watcher task
        let sid_exit = session_id;
        let buf_exit = Arc::clone(&buffer);
        let status_exit = Arc::clone(&status);
        let exit_code_exit = Arc::clone(&exit_code);
        let exit_task = tokio::spawn(async move {
            match child.wait().await {
                Ok(s) => {
                    let code = s.code().unwrap_or(-1);
                    info!("Session {sid_exit} exited with code {code}");
                    *exit_code_exit.lock().await = Some(code);
                    buf_exit
                        .lock()
                        .await
                        .push(format!("Process exited with code {code}"));
                }
                Err(e) => {
                    error!("Session {sid_exit} wait error: {e}");
                    *exit_code_exit.lock().await = Some(-1);
                    buf_exit
                        .lock()
                        .await
                        .push(format!("Process wait error: {e}"));
                }
            }
            *status_exit.lock().await = SessionStatus::Exited;
        });

        Ok(PtySession {
            pid: process_id,
            pgid: process_group_id,
            buffer,
            status,
            exit_code,
            stdin_tx,
            tasks: vec![stdin_task, output_task, exit_task],
            pty_master,
        })
    }

    /// Send data to the session's PTY (as UTF-8 string).
    pub async fn write_stdin(&self, data: &str) -> Result<(), String> {
        self.stdin_tx
            .send(data.as_bytes().to_vec())
            .await
            .map_err(|_| "Session stdin closed".to_string())
    }

    /// Clone of the stdin queue, for writes performed outside the session-map
    /// lock. Order is preserved by the single writer task.
    pub fn stdin_handle(&self) -> mpsc::Sender<Vec<u8>> {
        self.stdin_tx.clone()
    }

    /// Gracefully kill the session: SIGTERM to the process group, wait up to
    /// 2 s for the process to exit, then SIGKILL if it's still running.
    pub async fn graceful_kill(&self) {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pgid as i32;
        if pgid <= 0 {
            for task in &self.tasks {
                task.abort();
            }
            return;
        }

        // Phase 1: SIGTERM
        unsafe {
            libc::kill(-pgid, libc::SIGTERM);
        }

        // Phase 2: poll status for up to 2 seconds
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(2);
        loop {
            if *self.status.lock().await == SessionStatus::Exited {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                // Still running — force kill
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        }

        for task in &self.tasks {
            task.abort();
        }
    }

    /// Resize the PTY. Fails gracefully once the shell has exited.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), String> {
        if *self.status.lock().await == SessionStatus::Exited {
            return Err("Session has exited".to_string());
        }
        pty::resize_pty(&self.pty_master, rows, cols).map_err(|e| e.to_string())
    }

    /// Abort all background I/O tasks (stdin writer, reader, exit watcher).
    pub fn abort_tasks(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

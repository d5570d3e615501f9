//! Durable chat history — an append-only per-session message log in SQLite.
//!
//! Lives at `~/.echoshell/chat_history.db` (WAL journal mode). Three tables:
//!
//! - `chat_sessions(session_id PK, created_at, updated_at, closed_at?, is_active)`
//! - `chat_messages(id PK, session_id FK, timestamp, type, content, metadata?)`,
//!   indexed on `(session_id, timestamp)`
//! - `terminal_sessions(session_id PK, working_dir, created_at, terminal_type,
//!   name?)` — restart metadata; PTYs are never reattached, so this table is
//!   cleared on startup.
//!
//! All access goes through one connection behind a `tokio::sync::Mutex`, so
//! writes are serialized. Operations are cheap single statements; holding the
//! async lock across them keeps ordering without a dedicated writer task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

use crate::sessions::SessionInfo;
use crate::util::now_ms;

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    User,
    Assistant,
    Tool,
    System,
    Error,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            "system" => Some(Self::System),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One stored chat message.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub timestamp_ms: u64,
    pub message_type: MessageType,
    pub content: String,
    pub metadata: Option<Value>,
}

/// Aggregate counts for diagnostics.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub total_messages: u64,
}

/// SQLite-backed chat history store.
pub struct ChatHistoryStore {
    conn: Mutex<Connection>,
}

/// Resolve the default database path under the data directory.
pub fn default_db_path(data_dir: &str) -> PathBuf {
    Path::new(&crate::util::expand_tilde(data_dir).into_owned()).join("chat_history.db")
}

impl ChatHistoryStore {
    /// Open (creating directories and schema as needed) at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create data directory: {e}"))?;
        }
        let conn =
            Connection::open(path).map_err(|e| format!("Failed to open chat history db: {e}"))?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Arc<Self>, String> {
        let conn = Connection::open_in_memory().map_err(|e| e.to_string())?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Arc<Self>, String> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| format!("Failed to set WAL mode: {e}"))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| e.to_string())?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chat_sessions (
                session_id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                closed_at  INTEGER,
                is_active  INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_chat_sessions_active
                ON chat_sessions(is_active);
            CREATE TABLE IF NOT EXISTS chat_messages (
                id         TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES chat_sessions(session_id)
                           ON DELETE CASCADE,
                timestamp  INTEGER NOT NULL,
                type       TEXT NOT NULL,
                content    TEXT NOT NULL,
                metadata   TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_chat_messages_session_time
                ON chat_messages(session_id, timestamp);
            CREATE TABLE IF NOT EXISTS terminal_sessions (
                session_id    TEXT PRIMARY KEY,
                working_dir   TEXT NOT NULL,
                created_at    INTEGER NOT NULL,
                terminal_type TEXT NOT NULL,
                name          TEXT
            );",
        )
        .map_err(|e| format!("Failed to create schema: {e}"))?;

        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    /// Register a session (idempotent).
    pub async fn create_session(&self, session_id: &str) -> Result<(), String> {
        let now = now_ms();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO chat_sessions (session_id, created_at, updated_at, is_active)
             VALUES (?1, ?2, ?2, 1)
             ON CONFLICT(session_id) DO UPDATE SET is_active = 1, updated_at = ?2",
            params![session_id, now],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Append a message. The session row must exist (FK).
    pub async fn add_message(
        &self,
        session_id: &str,
        message_type: MessageType,
        content: &str,
        metadata: Option<Value>,
    ) -> Result<String, String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let metadata_json = metadata.map(|m| m.to_string());
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO chat_messages (id, session_id, timestamp, type, content, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                session_id,
                now,
                message_type.as_str(),
                content,
                metadata_json
            ],
        )
        .map_err(|e| e.to_string())?;
        conn.execute(
            "UPDATE chat_sessions SET updated_at = ?2 WHERE session_id = ?1",
            params![session_id, now],
        )
        .map_err(|e| e.to_string())?;
        Ok(id)
    }

    /// Messages for a session, oldest first.
    pub async fn get_chat_history(&self, session_id: &str) -> Result<Vec<ChatMessage>, String> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, timestamp, type, content, metadata
                 FROM chat_messages WHERE session_id = ?1 ORDER BY timestamp, id",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(ChatMessage {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    timestamp_ms: row.get::<_, i64>(2)? as u64,
                    message_type: MessageType::parse(&row.get::<_, String>(3)?)
                        .unwrap_or(MessageType::System),
                    content: row.get(4)?,
                    metadata: row
                        .get::<_, Option<String>>(5)?
                        .and_then(|s| serde_json::from_str(&s).ok()),
                })
            })
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string())
    }

    /// Delete a session's messages, keeping the session row.
    pub async fn clear_history(&self, session_id: &str) -> Result<usize, String> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM chat_messages WHERE session_id = ?1",
            params![session_id],
        )
        .map_err(|e| e.to_string())
    }

    /// Mark a session inactive with a close timestamp.
    pub async fn close_session(&self, session_id: &str) -> Result<(), String> {
        let now = now_ms();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE chat_sessions SET is_active = 0, closed_at = ?2, updated_at = ?2
             WHERE session_id = ?1",
            params![session_id, now],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Remove a session and (via FK cascade) its messages.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), String> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM chat_sessions WHERE session_id = ?1",
            params![session_id],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Drop all sessions marked inactive before a restart. Called once on
    /// startup.
    pub async fn cleanup_old_sessions(&self) -> Result<usize, String> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute("DELETE FROM chat_sessions WHERE is_active = 0", [])
            .map_err(|e| e.to_string())?;
        if removed > 0 {
            info!("Cleaned up {removed} inactive chat session(s)");
        }
        Ok(removed)
    }

    pub async fn get_active_sessions(&self) -> Result<Vec<String>, String> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT session_id FROM chat_sessions WHERE is_active = 1")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string())
    }

    pub async fn get_session_stats(&self) -> Result<SessionStats, String> {
        let conn = self.conn.lock().await;
        let total_sessions: i64 = conn
            .query_row("SELECT COUNT(*) FROM chat_sessions", [], |r| r.get(0))
            .map_err(|e| e.to_string())?;
        let active_sessions: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chat_sessions WHERE is_active = 1",
                [],
                |r| r.get(0),
            )
            .map_err(|e| e.to_string())?;
        let total_messages: i64 = conn
            .query_row("SELECT COUNT(*) FROM chat_messages", [], |r| r.get(0))
            .map_err(|e| e.to_string())?;
        Ok(SessionStats {
            total_sessions: total_sessions as u64,
            active_sessions: active_sessions as u64,
            total_messages: total_messages as u64,
        })
    }

    // ─── Terminal session metadata (restart inspection only) ─────────────────

    pub async fn save_session_metadata(&self, info: &SessionInfo) -> Result<(), String> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO terminal_sessions
             (session_id, working_dir, created_at, terminal_type, name)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                info.session_id,
                info.working_dir,
                info.created_at_ms,
                info.terminal_type.as_str(),
                info.name
            ],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn delete_session_metadata(&self, session_id: &str) -> Result<(), String> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM terminal_sessions WHERE session_id = ?1",
            params![session_id],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// PTYs are never reattached after restart; the persisted list is cleared
    /// on startup.
    pub async fn clear_session_metadata(&self) -> Result<usize, String> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM terminal_sessions", [])
            .map_err(|e| e.to_string())
    }

    /// Whether a session row exists and is active (diagnostics).
    pub async fn is_session_active(&self, session_id: &str) -> Result<bool, String> {
        let conn = self.conn.lock().await;
        let active: Option<i64> = conn
            .query_row(
                "SELECT is_active FROM chat_sessions WHERE session_id = ?1",
                params![session_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        Ok(active == Some(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn message_round_trip() {
        let store = ChatHistoryStore::open_in_memory().unwrap();
        store.create_session("s1").await.unwrap();

        store
            .add_message("s1", MessageType::User, "run the tests", None)
            .await
            .unwrap();
        store
            .add_message(
                "s1",
                MessageType::Assistant,
                "All 42 tests pass.",
                Some(json!({"completion": true})),
            )
            .await
            .unwrap();

        let history = store.get_chat_history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message_type, MessageType::User);
        assert_eq!(history[1].content, "All 42 tests pass.");
        assert_eq!(history[1].metadata.as_ref().unwrap()["completion"], true);
    }

    #[tokio::test]
    async fn messages_require_a_session() {
        let store = ChatHistoryStore::open_in_memory().unwrap();
        let err = store
            .add_message("ghost", MessageType::User, "hi", None)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn clear_history_keeps_session() {
        let store = ChatHistoryStore::open_in_memory().unwrap();
        store.create_session("s1").await.unwrap();
        store
            .add_message("s1", MessageType::User, "hello", None)
            .await
            .unwrap();

        assert_eq!(store.clear_history("s1").await.unwrap(), 1);
        assert!(store.get_chat_history("s1").await.unwrap().is_empty());
        assert!(store.is_session_active("s1").await.unwrap());
    }

    #[tokio::test]
    async fn close_then_cleanup_drops_inactive() {
        let store = ChatHistoryStore::open_in_memory().unwrap();
        store.create_session("old").await.unwrap();
        store.create_session("live").await.unwrap();
        store.close_session("old").await.unwrap();

        assert_eq!(store.get_active_sessions().await.unwrap(), vec!["live"]);
        assert_eq!(store.cleanup_old_sessions().await.unwrap(), 1);

        let stats = store.get_session_stats().await.unwrap();
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.active_sessions, 1);
    }

    #[tokio::test]
    async fn delete_cascades_to_messages() {
        let store = ChatHistoryStore::open_in_memory().unwrap();
        store.create_session("s1").await.unwrap();
        store
            .add_message("s1", MessageType::Tool, "output", None)
            .await
            .unwrap();

        store.delete_session("s1").await.unwrap();
        let stats = store.get_session_stats().await.unwrap();
        assert_eq!(stats.total_sessions, 0);
        assert_eq!(stats.total_messages, 0);
    }

    #[tokio::test]
    async fn terminal_metadata_lifecycle() {
        use crate::sessions::{SessionInfo, TerminalType};
        let store = ChatHistoryStore::open_in_memory().unwrap();
        let info = SessionInfo {
            session_id: "s1".to_string(),
            working_dir: "/tmp".to_string(),
            terminal_type: TerminalType::Claude,
            name: Some("work".to_string()),
            created_at_ms: 123,
        };
        store.save_session_metadata(&info).await.unwrap();
        assert_eq!(store.clear_session_metadata().await.unwrap(), 1);
        assert_eq!(store.clear_session_metadata().await.unwrap(), 0);
    }
}

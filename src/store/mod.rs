//! SQLite-backed message log
//!
//! Append-only log of chat messages. Each message gets a monotonically
//! increasing sequence number from SQLite's rowid autoincrement, which is the
//! single authoritative counter shared by every process writing to the same
//! database file. Idempotency tokens live in the `client_offset` column and
//! are enforced unique by the schema, so duplicate submissions surface as a
//! typed conflict rather than a second row.
//!
//! Calls run on `spawn_blocking` so the SQLite driver never blocks the
//! async runtime.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, ErrorCode, OptionalExtension};
use tracing::info;

/// One row of the message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Position in the global append order. Assigned by the store, never reused.
    pub sequence: i64,
    /// Opaque text payload as submitted.
    pub content: String,
}

/// Errors surfaced by the message log.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The idempotency token is already recorded. The submission is a retry,
    /// not a new message.
    #[error("duplicate idempotency token")]
    DuplicateToken,

    #[error("storage failure: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// Map a rusqlite error, turning the UNIQUE constraint violation on the
    /// token column into the typed duplicate signal.
    fn from_sqlite(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == ErrorCode::ConstraintViolation =>
            {
                StoreError::DuplicateToken
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

/// Handle to the message log.
///
/// Cheap to clone; all clones share one connection. SQLite serializes writers
/// itself, so sequence assignment stays linearized even with several
/// processes appending to the same file.
#[derive(Clone)]
pub struct MessageStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl MessageStore {
    /// Open or create the message log at `path` and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent readers alongside the single writer
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_offset TEXT UNIQUE,
                content TEXT
            );",
        )?;

        info!(path = %path.display(), "Message log opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a message, returning its freshly assigned sequence number.
    ///
    /// An empty token is stored as NULL, so tokenless submissions never
    /// collide with each other. A non-empty token that is already recorded
    /// yields [`StoreError::DuplicateToken`].
    pub async fn append(
        &self,
        content: String,
        token: Option<String>,
    ) -> Result<i64, StoreError> {
        let conn = Arc::clone(&self.conn);
        self.blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            let token = token.filter(|t| !t.is_empty());
            conn.prepare_cached(
                "INSERT INTO messages (content, client_offset) VALUES (?1, ?2)",
            )?
            .execute(rusqlite::params![content, token])?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Look up the sequence number previously assigned to a token.
    pub async fn sequence_for_token(&self, token: String) -> Result<Option<i64>, StoreError> {
        let conn = Arc::clone(&self.conn);
        self.blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            let seq = conn
                .prepare_cached("SELECT id FROM messages WHERE client_offset = ?1")?
                .query_row([token], |row| row.get(0))
                .optional()?;
            Ok(seq)
        })
        .await
    }

    /// Read up to `limit` messages with sequence strictly greater than
    /// `offset`, in increasing sequence order.
    pub async fn messages_after(
        &self,
        offset: i64,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let conn = Arc::clone(&self.conn);
        self.blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            let mut stmt = conn.prepare_cached(
                "SELECT id, content FROM messages WHERE id > ?1 ORDER BY id LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![offset, limit as i64], |row| {
                Ok(Message {
                    sequence: row.get(0)?,
                    content: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                })
            })?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            Ok(messages)
        })
        .await
    }

    /// Highest sequence currently in the log (0 when empty).
    pub async fn latest_sequence(&self) -> Result<i64, StoreError> {
        let conn = Arc::clone(&self.conn);
        self.blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            let seq: Option<i64> = conn
                .prepare_cached("SELECT MAX(id) FROM messages")?
                .query_row([], |row| row.get(0))?;
            Ok(seq.unwrap_or(0))
        })
        .await
    }

    /// Run a blocking store operation off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, rusqlite::Error> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
            .map_err(StoreError::from_sqlite)
    }
}

//! Message store.
//!
//! [`MessageStore`] is what the session core persists through. [`Db`] is the
//! SQLite implementation; it uses WAL mode so history reads don't block the
//! network tasks inserting.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Result as SqlResult, Row, params};

use crate::message::{Message, Preview};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encoding preview: {0}")]
    Preview(#[from] serde_json::Error),
}

/// Persistence contract for chat history, scoped per account (`owner`).
///
/// Implementations must be safe to call from many network tasks at once.
pub trait MessageStore: Send + Sync {
    /// Store `msg` and return its new id.
    fn insert(&self, owner: &str, msg: &Message) -> Result<i64, StoreError>;

    /// Up to `limit` messages, newest first, optionally narrowed to a network
    /// and channel.
    fn history(
        &self,
        owner: &str,
        network: Option<&str>,
        channel: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Returns whether a message was removed.
    fn delete_message(&self, owner: &str, id: i64) -> Result<bool, StoreError>;

    /// Returns the number of messages removed.
    fn clear_channel(&self, owner: &str, network: &str, channel: &str) -> Result<usize, StoreError>;

    fn clear_network(&self, owner: &str, network: &str) -> Result<usize, StoreError>;

    fn clear_user(&self, owner: &str) -> Result<usize, StoreError>;
}

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing, or when no path is configured).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                email       TEXT NOT NULL,
                network     TEXT NOT NULL,
                channel     TEXT NOT NULL,
                timestamp   INTEGER NOT NULL,
                sender      TEXT NOT NULL,
                command     TEXT NOT NULL,
                message     TEXT NOT NULL,
                ownmessage  INTEGER NOT NULL DEFAULT 0,
                preview     TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_channel
                ON messages(email, network, channel, id);
            ",
        )?;
        Ok(())
    }

    /// Fetch a single message by id.
    pub fn get_message(&self, owner: &str, id: i64) -> Result<Option<Message>, StoreError> {
        let conn = self.conn.lock();
        let msg = conn
            .query_row(
                "SELECT id, network, channel, timestamp, sender, command, message, ownmessage, preview
                 FROM messages WHERE email = ?1 AND id = ?2",
                params![owner, id],
                map_message_row,
            )
            .optional()?;
        Ok(msg)
    }
}

impl MessageStore for Db {
    fn insert(&self, owner: &str, msg: &Message) -> Result<i64, StoreError> {
        let preview = msg.preview.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (email, network, channel, timestamp, sender, command, message, ownmessage, preview)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                owner,
                msg.network,
                msg.channel,
                msg.timestamp,
                msg.sender,
                msg.command,
                msg.body,
                msg.own,
                preview,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn history(
        &self,
        owner: &str,
        network: Option<&str>,
        channel: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, network, channel, timestamp, sender, command, message, ownmessage, preview
             FROM messages
             WHERE email = ?1
               AND (?2 IS NULL OR network = ?2)
               AND (?3 IS NULL OR channel = ?3)
             ORDER BY id DESC LIMIT ?4",
        )?;
        let rows = stmt.query_map(params![owner, network, channel, limit as i64], map_message_row)?;
        Ok(rows.collect::<SqlResult<Vec<_>>>()?)
    }

    fn delete_message(&self, owner: &str, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM messages WHERE email = ?1 AND id = ?2",
            params![owner, id],
        )?;
        Ok(changed > 0)
    }

    fn clear_channel(&self, owner: &str, network: &str, channel: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM messages WHERE email = ?1 AND network = ?2 AND channel = ?3",
            params![owner, network, channel],
        )?)
    }

    fn clear_network(&self, owner: &str, network: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM messages WHERE email = ?1 AND network = ?2",
            params![owner, network],
        )?)
    }

    fn clear_user(&self, owner: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM messages WHERE email = ?1", params![owner])?)
    }
}

fn map_message_row(row: &Row<'_>) -> SqlResult<Message> {
    let preview: Option<String> = row.get(8)?;
    Ok(Message {
        id: Some(row.get(0)?),
        network: row.get(1)?,
        channel: row.get(2)?,
        timestamp: row.get(3)?,
        sender: row.get(4)?,
        command: row.get(5)?,
        body: row.get(6)?,
        own: row.get(7)?,
        // A preview that no longer decodes is dropped rather than failing the row.
        preview: preview
            .filter(|p| !p.is_empty())
            .and_then(|p| serde_json::from_str::<Preview>(&p).ok()),
    })
}

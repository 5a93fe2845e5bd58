//! SQLite Database
//!
//! One database file holds every bot's users and message history.
//! The connection is shared behind a mutex; stores scope their queries by bot.

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Error types for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("An owner already exists for this bot")]
    OwnerExists,

    #[error("Cannot change existing user to owner")]
    CannotBecomeOwner,

    #[error("User {0} not found")]
    UserNotFound(i64),

    #[error("Permission denied")]
    PermissionDenied,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Shared SQLite handle
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database file
    pub fn open(path: &Path) -> StoreResult<Arc<Self>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let db = Self::from_connection(conn)?;
        info!("Database opened: {}", path.display());
        Ok(db)
    }

    /// In-memory database (tests, dry runs)
    pub fn open_in_memory() -> StoreResult<Arc<Self>> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Arc<Self>> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(Arc::new(db))
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS bots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identifier TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (unixepoch())
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id INTEGER NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                telegram_id INTEGER NOT NULL,
                username TEXT NOT NULL DEFAULT '',
                role TEXT NOT NULL CHECK(role IN ('user', 'admin', 'owner')),
                created_at INTEGER NOT NULL,
                UNIQUE(bot_id, telegram_id)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_users_one_owner
                ON users(bot_id) WHERE role = 'owner';

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id INTEGER NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                chat_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                username TEXT NOT NULL DEFAULT '',
                role TEXT NOT NULL CHECK(role IN ('user', 'assistant')),
                text TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                deleted_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_messages_chat
                ON messages(bot_id, chat_id, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_messages_user
                ON messages(bot_id, user_id);
            "#,
        )?;
        Ok(())
    }

    /// Lock the connection
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Look up a bot by identifier, registering it on first sight. Returns the row id.
    pub fn ensure_bot(&self, identifier: &str) -> StoreResult<i64> {
        let conn = self.conn();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM bots WHERE identifier = ?1",
                params![identifier],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            return Ok(id);
        }

        conn.execute(
            "INSERT INTO bots (identifier, name) VALUES (?1, ?1)",
            params![identifier],
        )?;
        let id = conn.last_insert_rowid();
        info!(bot = %identifier, "Registered bot (row {})", id);
        Ok(id)
    }
}

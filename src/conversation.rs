//! Conversation Store
//!
//! Persisted message turns per bot and chat. Backs the chat memory cache
//! (`find_recent`), `/clear` and the `/stats` counters.

use chrono::{DateTime, Utc};
use rusqlite::params;
use std::sync::Arc;
use tracing::{debug, info};

use crate::chat_memory::{MessageStore, Turn, TurnRole};
use crate::clock::Clock;
use crate::db::{Database, StoreResult};

/// Message counters for a whole bot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStats {
    pub total_messages: usize,
    pub total_chats: usize,
}

/// Activity of one user
#[derive(Debug, Clone, PartialEq)]
pub struct UserMessageStats {
    pub messages_sent: usize,
    pub replies_received: usize,
    pub first_message: Option<DateTime<Utc>>,
    pub last_message: Option<DateTime<Utc>>,
}

/// Message history of one bot
pub struct ConversationStore {
    db: Arc<Database>,
    bot_id: String,
    bot_row: i64,
    clock: Arc<dyn Clock>,
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

impl ConversationStore {
    /// Store for `bot_id`, registering the bot on first use
    pub fn open(db: Arc<Database>, bot_id: &str, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let bot_row = db.ensure_bot(bot_id)?;
        Ok(Self {
            db,
            bot_id: bot_id.to_string(),
            bot_row,
            clock,
        })
    }

    /// Persist a turn.
    ///
    /// `user_id` is the sender for user turns and the user being answered
    /// for assistant turns, so clearing a user's history removes both sides.
    pub fn store_turn(
        &self,
        chat_id: i64,
        user_id: i64,
        username: &str,
        turn: &Turn,
    ) -> StoreResult<i64> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO messages (bot_id, chat_id, user_id, username, role, text, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                self.bot_row,
                chat_id,
                user_id,
                username,
                turn.role.as_str(),
                turn.text,
                turn.timestamp.timestamp_millis(),
            ],
        )?;

        debug!(bot = %self.bot_id, "Stored {} turn in chat {}", turn.role, chat_id);
        Ok(conn.last_insert_rowid())
    }

    /// Most recent `limit` visible turns, oldest first
    pub fn history(&self, chat_id: i64, limit: usize) -> StoreResult<Vec<Turn>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT role, text, timestamp FROM messages
             WHERE bot_id = ?1 AND chat_id = ?2 AND deleted_at IS NULL
             ORDER BY timestamp DESC, id DESC
             LIMIT ?3",
        )?;

        let rows = stmt
            .query_map(params![self.bot_row, chat_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut turns = rows
            .into_iter()
            .map(|(role, text, ts)| {
                Ok(Turn {
                    role: role.parse::<TurnRole>()?,
                    text,
                    timestamp: from_millis(ts),
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        // Reverse to get chronological order
        turns.reverse();
        Ok(turns)
    }

    /// Remove a user's messages (and the replies to them) from a chat.
    ///
    /// Soft delete stamps rows with the current time and hides them from
    /// history; hard delete drops them.
    pub fn clear_user_history(&self, chat_id: i64, user_id: i64, hard: bool) -> StoreResult<usize> {
        let now = self.clock.now().timestamp_millis();
        let conn = self.db.conn();
        let rows = if hard {
            conn.execute(
                "DELETE FROM messages WHERE bot_id = ?1 AND chat_id = ?2 AND user_id = ?3",
                params![self.bot_row, chat_id, user_id],
            )?
        } else {
            conn.execute(
                "UPDATE messages SET deleted_at = ?4
                 WHERE bot_id = ?1 AND chat_id = ?2 AND user_id = ?3 AND deleted_at IS NULL",
                params![self.bot_row, chat_id, user_id, now],
            )?
        };

        info!(
            bot = %self.bot_id,
            "Cleared {} messages of user {} in chat {} ({})",
            rows,
            user_id,
            chat_id,
            if hard { "hard" } else { "soft" }
        );
        Ok(rows)
    }

    /// Counters over all visible messages of this bot
    pub fn stats(&self) -> StoreResult<MessageStats> {
        let conn = self.db.conn();
        let (total_messages, total_chats): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT chat_id) FROM messages
             WHERE bot_id = ?1 AND deleted_at IS NULL",
            params![self.bot_row],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(MessageStats {
            total_messages: total_messages as usize,
            total_chats: total_chats as usize,
        })
    }

    /// Counters for one user across all chats of this bot
    pub fn user_stats(&self, user_id: i64) -> StoreResult<UserMessageStats> {
        let conn = self.db.conn();
        let (sent, received, first, last): (i64, i64, Option<i64>, Option<i64>) = conn.query_row(
            "SELECT
                 COALESCE(SUM(role = 'user'), 0),
                 COALESCE(SUM(role = 'assistant'), 0),
                 MIN(CASE WHEN role = 'user' THEN timestamp END),
                 MAX(CASE WHEN role = 'user' THEN timestamp END)
             FROM messages
             WHERE bot_id = ?1 AND user_id = ?2 AND deleted_at IS NULL",
            params![self.bot_row, user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        Ok(UserMessageStats {
            messages_sent: sent as usize,
            replies_received: received as usize,
            first_message: first.map(from_millis),
            last_message: last.map(from_millis),
        })
    }
}

impl MessageStore for ConversationStore {
    fn find_recent(&self, chat_id: i64, limit: usize) -> StoreResult<Vec<Turn>> {
        self.history(chat_id, limit)
    }
}

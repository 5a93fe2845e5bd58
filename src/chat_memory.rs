//! Chat Memory Cache
//!
//! Short-term conversation context per chat, kept in memory and hydrated
//! from the message store the first time a chat is touched.
//!
//! - Each buffer holds at most `memory_size * 2` turns (user/assistant pairs)
//! - Overflow trims the oldest turns until exactly `capacity` remain
//! - Concurrent first touches of one chat hydrate once; other chats never wait on it

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::db::{StoreError, StoreResult};

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TurnRole {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(TurnRole::User),
            "assistant" => Ok(TurnRole::Assistant),
            other => Err(StoreError::UnknownRole(other.to_string())),
        }
    }
}

/// One message exchanged in a chat
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
            timestamp,
        }
    }

    pub fn assistant(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: text.into(),
            timestamp,
        }
    }
}

/// Turn as handed to the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMessage {
    pub role: TurnRole,
    pub text: String,
}

/// Read side of persisted history
pub trait MessageStore: Send + Sync {
    /// Up to `limit` most recent turns of a chat, oldest first
    fn find_recent(&self, chat_id: i64, limit: usize) -> StoreResult<Vec<Turn>>;
}

/// Bounded, insertion-ordered turns of one chat
#[derive(Debug)]
pub struct ConversationBuffer {
    chat_id: i64,
    capacity: usize,
    entries: RwLock<VecDeque<Turn>>,
}

impl ConversationBuffer {
    fn new(chat_id: i64, capacity: usize, history: Vec<Turn>) -> Self {
        let mut entries = VecDeque::with_capacity(capacity + 1);
        refill(&mut entries, history, capacity);
        Self {
            chat_id,
            capacity,
            entries: RwLock::new(entries),
        }
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Add a turn, evicting the oldest ones past capacity
    pub fn append(&self, turn: Turn) {
        let mut entries = self.entries.write();
        entries.push_back(turn);
        trim_to_capacity(&mut entries, self.capacity);
    }

    /// Context for the model: every non-blank turn, trimmed, oldest first
    pub fn to_context(&self) -> Vec<ContextMessage> {
        self.entries
            .read()
            .iter()
            .filter_map(|turn| {
                let text = turn.text.trim();
                if text.is_empty() {
                    None
                } else {
                    Some(ContextMessage {
                        role: turn.role,
                        text: text.to_string(),
                    })
                }
            })
            .collect()
    }

    /// Copy of the raw entries
    pub fn snapshot(&self) -> Vec<Turn> {
        self.entries.read().iter().cloned().collect()
    }
}

/// Swap the contents for `history`, keeping the newest `capacity` turns
fn refill(entries: &mut VecDeque<Turn>, history: Vec<Turn>, capacity: usize) {
    entries.clear();
    entries.extend(history);
    trim_to_capacity(entries, capacity);
}

/// Drop oldest turns until at most `capacity` remain
fn trim_to_capacity(entries: &mut VecDeque<Turn>, capacity: usize) {
    while entries.len() > capacity {
        entries.pop_front();
    }
}

type BufferSlot = Arc<OnceCell<Arc<ConversationBuffer>>>;

/// Chat id -> conversation buffer, lazily hydrated
pub struct ChatMemoryCache {
    bot_id: String,
    capacity: usize,
    store: Arc<dyn MessageStore>,
    chats: RwLock<HashMap<i64, BufferSlot>>,
}

impl ChatMemoryCache {
    /// `memory_size` is the number of user/assistant pairs kept per chat
    pub fn new(bot_id: &str, memory_size: usize, store: Arc<dyn MessageStore>) -> Self {
        Self {
            bot_id: bot_id.to_string(),
            capacity: memory_size * 2,
            store,
            chats: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of chats currently held in memory
    pub fn cached_chats(&self) -> usize {
        self.chats.read().len()
    }

    /// Shared buffer for `chat_id`, hydrating it from the store on first access
    pub fn get_or_create(&self, chat_id: i64) -> Arc<ConversationBuffer> {
        let existing = self.chats.read().get(&chat_id).cloned();

        let slot = match existing {
            Some(slot) => slot,
            None => {
                let mut chats = self.chats.write();
                Arc::clone(
                    chats
                        .entry(chat_id)
                        .or_insert_with(|| Arc::new(OnceCell::new())),
                )
            }
        };

        // Hydration runs outside the map lock, once per chat
        Arc::clone(slot.get_or_init(|| {
            Arc::new(ConversationBuffer::new(
                chat_id,
                self.capacity,
                self.load_history(chat_id),
            ))
        }))
    }

    /// Reload a chat's buffer from the store in place (after history was cleared).
    /// Appends made during the reload wait for it and land after it.
    pub fn rehydrate(&self, chat_id: i64) -> Arc<ConversationBuffer> {
        let buffer = self.get_or_create(chat_id);
        {
            let mut entries = buffer.entries.write();
            let history = self.load_history(chat_id);
            refill(&mut entries, history, self.capacity);
        }
        buffer
    }

    fn load_history(&self, chat_id: i64) -> Vec<Turn> {
        match self.store.find_recent(chat_id, self.capacity) {
            Ok(turns) => {
                debug!(
                    bot = %self.bot_id,
                    "Hydrated chat {} with {} turns",
                    chat_id,
                    turns.len()
                );
                turns
            }
            Err(e) => {
                warn!(
                    bot = %self.bot_id,
                    "Failed to load history for chat {}: {} (starting empty)",
                    chat_id, e
                );
                Vec::new()
            }
        }
    }
}

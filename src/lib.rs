//! RelayBot
//!
//! Multi-tenant Telegram chatbot relay: several bot personalities, each with
//! its own Telegram token, prompts and limits, forwarding conversations to
//! Claude from a single process.
//!
//! # Architecture
//!
//! ```text
//! Telegram ──► Dispatcher (per bot) ──► Relay ──► Claude API
//!                                         │
//!                                         ├── UserRateLimiter (hourly + daily buckets, bans)
//!                                         ├── ChatMemoryCache (bounded per-chat context)
//!                                         ├── ConversationStore (SQLite history)
//!                                         └── UserStore (roles: user/admin/owner)
//! ```

pub mod chat_memory;
pub mod claude;
pub mod clock;
pub mod commands;
pub mod config;
pub mod conversation;
pub mod db;
pub mod prompt;
pub mod rate_limit;
pub mod relay;
pub mod telegram;
pub mod users;

#[cfg(test)]
mod testing;

pub use chat_memory::{
    ChatMemoryCache, ContextMessage, ConversationBuffer, MessageStore, Turn, TurnRole,
};
pub use claude::{ChatModel, ChatRequest, ClaudeClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BotConfig, Config, ConfigError};
pub use conversation::ConversationStore;
pub use db::{Database, StoreError, StoreResult};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, UserRateLimiter};
pub use relay::{InboundMessage, Relay, StickerKind};
pub use users::{AccessRole, User, UserStore};

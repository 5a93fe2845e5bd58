//! Message relay
//!
//! One [`Relay`] per configured bot. It owns that bot's rate limiter, chat
//! memory, stores and model client, and turns an inbound message into the
//! reply to send (if any). Transport-agnostic: the Telegram layer only
//! converts updates and delivers replies.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::chat_memory::{ChatMemoryCache, ContextMessage, Turn, TurnRole};
use crate::claude::{ChatModel, ChatRequest};
use crate::clock::Clock;
use crate::commands::{parse_command, Command, CommandError};
use crate::config::BotConfig;
use crate::conversation::ConversationStore;
use crate::db::{Database, StoreError, StoreResult};
use crate::prompt::{
    compose_system_prompt, fill_placeholders, is_only_emojis, PromptContext, PromptFlags,
};
use crate::rate_limit::UserRateLimiter;
use crate::users::{User, UserStore};

pub const RATE_LIMIT_REPLY: &str = "Rate limit exceeded. Please try again later.";
pub const MODEL_FAILURE_REPLY: &str =
    "I'm sorry, I'm having trouble processing your request right now.";

const STICKER_PROMPT: &str = "User sent a sticker.";

/// Kind of sticker attached to a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StickerKind {
    Static,
    Animated,
    Video,
}

impl StickerKind {
    /// Reply used when the model can't be reached
    pub fn fallback_reply(&self) -> &'static str {
        match self {
            StickerKind::Animated => "Wow, that's a cool animated sticker!",
            StickerKind::Video => "Interesting video sticker!",
            StickerKind::Static => "That's a cool sticker!",
        }
    }
}

/// A message addressed to a bot, independent of the transport
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub user_id: i64,
    pub username: String,
    pub first_name: String,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub is_premium: bool,
    pub text: String,
    pub sticker: Option<StickerKind>,
    pub sent_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Plain text message from a user
    pub fn text(
        chat_id: i64,
        user_id: i64,
        username: impl Into<String>,
        text: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            chat_id,
            user_id,
            username: username.into(),
            first_name: String::new(),
            last_name: None,
            language_code: None,
            is_premium: false,
            text: text.into(),
            sticker: None,
            sent_at,
        }
    }

    fn prompt_context(&self) -> PromptContext<'_> {
        PromptContext {
            username: Some(self.username.as_str()),
            first_name: Some(self.first_name.as_str()),
            last_name: self.last_name.as_deref(),
            language: self.language_code.as_deref(),
            is_premium: self.is_premium,
            sent_at: self.sent_at,
        }
    }
}

/// Per-bot message pipeline
pub struct Relay {
    bot_id: String,
    config: BotConfig,
    limiter: UserRateLimiter,
    memory: ChatMemoryCache,
    conversations: Arc<ConversationStore>,
    users: UserStore,
    model: Arc<dyn ChatModel>,
    clock: Arc<dyn Clock>,
}

impl Relay {
    /// Register the bot in the database, make sure its owner exists and
    /// wire up limiter and memory
    pub fn new(
        config: BotConfig,
        db: Arc<Database>,
        model: Arc<dyn ChatModel>,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let conversations = Arc::new(ConversationStore::open(
            db.clone(),
            &config.id,
            clock.clone(),
        )?);
        let users = UserStore::open(db, &config.id, clock.clone())?;

        if config.owner_telegram_id != 0 {
            users.ensure_owner(config.owner_telegram_id)?;
        }

        let limiter = UserRateLimiter::new(&config.id, config.rate_limit_config(), clock.clone());
        let memory = ChatMemoryCache::new(&config.id, config.memory_size, conversations.clone());

        info!(
            bot = %config.id,
            "Relay ready: model={}, memory_size={}, limits={}/h {}/day",
            config.model,
            config.memory_size,
            config.messages_per_hour,
            config.messages_per_day
        );

        Ok(Self {
            bot_id: config.id.clone(),
            config,
            limiter,
            memory,
            conversations,
            users,
            model,
            clock,
        })
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn memory(&self) -> &ChatMemoryCache {
        &self.memory
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    /// Process one inbound message and return the reply to send
    pub async fn handle(&self, msg: &InboundMessage) -> Option<String> {
        let sender = match self.register_sender(msg) {
            Ok(user) => user,
            Err(e) => {
                error!(bot = %self.bot_id, "Failed to register user {}: {}", msg.user_id, e);
                return None;
            }
        };

        if let Some(parsed) = parse_command(&msg.text) {
            return Some(self.run_command(msg, &sender, parsed));
        }

        if !self.limiter.allow(msg.user_id) {
            info!(bot = %self.bot_id, "Rate limit exceeded for user {}", msg.user_id);
            return Some(RATE_LIMIT_REPLY.to_string());
        }

        if let Some(kind) = msg.sticker {
            return Some(self.sticker_reply(msg, &sender, kind).await);
        }

        let text = msg.text.trim();
        if text.is_empty() {
            debug!(
                bot = %self.bot_id,
                "Ignoring non-text message from user {} in chat {}",
                msg.user_id, msg.chat_id
            );
            return None;
        }

        Some(self.converse(msg, &sender, text).await)
    }

    fn register_sender(&self, msg: &InboundMessage) -> StoreResult<User> {
        let is_owner = msg.user_id == self.config.owner_telegram_id;
        let mut user = self
            .users
            .get_or_create_user(msg.user_id, &msg.username, is_owner)?;

        if user.username != msg.username {
            self.users.update_username(msg.user_id, &msg.username)?;
            user.username = msg.username.clone();
        }

        Ok(user)
    }

    fn system_prompt(&self, msg: &InboundMessage, flags: PromptFlags) -> String {
        let composed = compose_system_prompt(&self.config.system_prompts, flags);
        fill_placeholders(&composed, &msg.prompt_context())
    }

    async fn ask_model(
        &self,
        system: String,
        messages: Vec<ContextMessage>,
    ) -> anyhow::Result<String> {
        debug!(
            bot = %self.bot_id,
            "Calling model: model={}, messages={}",
            self.config.model,
            messages.len()
        );

        self.model
            .generate(ChatRequest {
                model: self.config.model.clone(),
                system,
                messages,
                max_tokens: self.config.max_tokens,
            })
            .await
    }

    async fn converse(&self, msg: &InboundMessage, sender: &User, text: &str) -> String {
        // Hydrate before persisting so the incoming turn isn't loaded twice
        let buffer = self.memory.get_or_create(msg.chat_id);
        let new_chat = buffer.is_empty();

        let incoming = Turn::user(text, self.clock.now());
        if let Err(e) = self
            .conversations
            .store_turn(msg.chat_id, msg.user_id, &msg.username, &incoming)
        {
            warn!(bot = %self.bot_id, "Failed to store message in chat {}: {}", msg.chat_id, e);
        }
        buffer.append(incoming);

        let flags = PromptFlags {
            privileged: sender.role.is_privileged(),
            new_chat,
            emoji_only: is_only_emojis(text),
        };
        let system = self.system_prompt(msg, flags);

        match self.ask_model(system, buffer.to_context()).await {
            Ok(reply) => {
                let outgoing = Turn::assistant(reply.clone(), self.clock.now());
                if let Err(e) = self
                    .conversations
                    .store_turn(msg.chat_id, msg.user_id, "", &outgoing)
                {
                    warn!(
                        bot = %self.bot_id,
                        "Failed to store reply in chat {}: {}",
                        msg.chat_id, e
                    );
                }
                buffer.append(outgoing);
                reply
            }
            Err(e) => {
                error!(bot = %self.bot_id, "Model call failed for chat {}: {:#}", msg.chat_id, e);
                MODEL_FAILURE_REPLY.to_string()
            }
        }
    }

    async fn sticker_reply(
        &self,
        msg: &InboundMessage,
        sender: &User,
        kind: StickerKind,
    ) -> String {
        let flags = PromptFlags {
            privileged: sender.role.is_privileged(),
            ..Default::default()
        };
        let system = self.system_prompt(msg, flags);
        let messages = vec![ContextMessage {
            role: TurnRole::User,
            text: STICKER_PROMPT.to_string(),
        }];

        match self.ask_model(system, messages).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(bot = %self.bot_id, "Sticker reply failed, using fallback: {:#}", e);
                kind.fallback_reply().to_string()
            }
        }
    }

    fn run_command(
        &self,
        msg: &InboundMessage,
        sender: &User,
        parsed: Result<Command, CommandError>,
    ) -> String {
        let command = match parsed {
            Ok(command) => command,
            Err(e) => {
                info!(
                    bot = %self.bot_id,
                    "User {} sent malformed command: {}",
                    msg.user_id, msg.text
                );
                return e.usage().to_string();
            }
        };

        debug!(bot = %self.bot_id, "User {} ran {:?}", msg.user_id, command);

        match command {
            Command::Stats => self.bot_stats(),
            Command::UserStats(target) => {
                self.user_stats(sender, target.unwrap_or(sender.telegram_id))
            }
            Command::Whoami => format!(
                "👤 Your Information:\n\n- Username: {}\n- Role: {}",
                sender.username,
                sender.role.title()
            ),
            Command::Clear { target, hard } => self.clear_history(
                msg.chat_id,
                sender,
                target.unwrap_or(sender.telegram_id),
                hard,
            ),
            Command::Promote(target) => self.promote(sender, target),
        }
    }

    fn bot_stats(&self) -> String {
        let totals = self
            .users
            .count()
            .and_then(|users| Ok((users, self.conversations.stats()?)));

        let limits = self.limiter.stats();

        match totals {
            Ok((users, messages)) => format!(
                "📊 Bot Statistics:\n\n- Total Users: {}\n- Total Messages: {}\n\
                 - Rate-Limited Users: {}\n- Currently Banned: {}",
                users, messages.total_messages, limits.tracked_users, limits.banned_users
            ),
            Err(e) => {
                error!(bot = %self.bot_id, "Error fetching stats: {}", e);
                "Sorry, I couldn't retrieve the stats at this time.".to_string()
            }
        }
    }

    fn user_stats(&self, sender: &User, target_id: i64) -> String {
        if target_id != sender.telegram_id && !self.users.is_admin_or_owner(sender.telegram_id) {
            info!(
                bot = %self.bot_id,
                "User {} denied stats for user {}",
                sender.telegram_id, target_id
            );
            return "Permission denied. Only admins and owners can view other users' statistics."
                .to_string();
        }

        let found = self.users.find_user(target_id).and_then(|user| match user {
            Some(user) => Ok((self.conversations.user_stats(target_id)?, user)),
            None => Err(StoreError::UserNotFound(target_id)),
        });

        let (stats, user) = match found {
            Ok(found) => found,
            Err(e) => {
                warn!(bot = %self.bot_id, "Stats lookup for user {} failed: {}", target_id, e);
                return format!("Sorry, I couldn't retrieve statistics for user ID {}.", target_id);
            }
        };

        let header = if user.username.is_empty() {
            format!("👤 User Statistics for user ID {}:", target_id)
        } else {
            format!("👤 User Statistics for @{} (ID: {}):", user.username, target_id)
        };

        format!(
            "{}\n\n- Role: {}\n- Messages Sent: {}\n- Replies Received: {}\n\
             - First Message: {}\n- Last Message: {}",
            header,
            user.role.title(),
            stats.messages_sent,
            stats.replies_received,
            format_time(stats.first_message),
            format_time(stats.last_message)
        )
    }

    fn clear_history(&self, chat_id: i64, sender: &User, target_id: i64, hard: bool) -> String {
        let own = target_id == sender.telegram_id;
        let mut target_name = String::new();

        if !own {
            if !self.users.is_admin_or_owner(sender.telegram_id) {
                info!(
                    bot = %self.bot_id,
                    "User {} attempted to clear history for user {} without permission",
                    sender.telegram_id, target_id
                );
                return "Permission denied. Only admins and owners can clear other users' histories."
                    .to_string();
            }

            match self.users.find_user(target_id) {
                Ok(Some(user)) => target_name = user.username,
                Ok(None) => return format!("User with ID {} not found.", target_id),
                Err(e) => {
                    error!(bot = %self.bot_id, "Error finding target user {}: {}", target_id, e);
                    return format!("User with ID {} not found.", target_id);
                }
            }
        }

        if let Err(e) = self.conversations.clear_user_history(chat_id, target_id, hard) {
            error!(bot = %self.bot_id, "Error clearing history of user {}: {}", target_id, e);
            return "Sorry, I couldn't clear the chat history.".to_string();
        }

        self.memory.rehydrate(chat_id);

        if own {
            "Your chat history has been cleared.".to_string()
        } else if target_name.is_empty() {
            format!("Chat history for user with ID {} has been cleared.", target_id)
        } else {
            format!(
                "Chat history for user @{} (ID: {}) has been cleared.",
                target_name, target_id
            )
        }
    }

    fn promote(&self, sender: &User, target_id: i64) -> String {
        match self.users.promote_to_admin(sender.telegram_id, target_id) {
            Ok(user) if user.username.is_empty() => {
                format!("User with ID {} is now an admin.", target_id)
            }
            Ok(user) => format!("User @{} (ID: {}) is now an admin.", user.username, target_id),
            Err(StoreError::PermissionDenied) => {
                "Permission denied. Only the owner can promote users, \
                 and the owner's role cannot change."
                    .to_string()
            }
            Err(StoreError::UserNotFound(id)) => format!("User with ID {} not found.", id),
            Err(e) => {
                error!(bot = %self.bot_id, "Error promoting user {}: {}", target_id, e);
                "Sorry, I couldn't promote that user.".to_string()
            }
        }
    }
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

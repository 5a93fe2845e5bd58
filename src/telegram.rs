//! Telegram transport
//!
//! Each bot runs its own teloxide dispatcher with long polling. Updates are
//! converted into [`InboundMessage`]s for the bot's [`Relay`] and the reply is
//! sent back, split into chunks Telegram accepts.
//!
//! The dispatcher processes updates of one chat sequentially and different
//! chats concurrently.

use anyhow::{Context, Result};
use std::sync::Arc;
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt},
    dptree,
    error_handlers::LoggingErrorHandler,
    prelude::*,
    types::{ChatAction, Update},
};

use crate::relay::{InboundMessage, Relay, StickerKind};

/// Telegram rejects messages above 4096 characters
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Run one bot until Ctrl-C
pub async fn run_bot(relay: Arc<Relay>) -> Result<()> {
    let bot = Bot::new(&relay.config().telegram_token);
    let bot_id = relay.bot_id().to_string();

    let me = bot
        .get_me()
        .await
        .with_context(|| format!("Telegram authentication failed for bot {}", bot_id))?;
    tracing::info!(
        bot = %bot_id,
        "Authorized on Telegram as @{}",
        me.username.as_deref().unwrap_or("<unknown>")
    );

    let handler = dptree::entry().branch(Update::filter_message().endpoint(message_handler));

    tracing::info!(bot = %bot_id, "Starting dispatcher with long polling...");

    let unhandled_bot = bot_id.clone();
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![relay])
        .default_handler(move |upd| {
            let bot_id = unhandled_bot.clone();
            async move {
                tracing::debug!(bot = %bot_id, "Unhandled update: {:?}", upd.kind);
            }
        })
        .error_handler(LoggingErrorHandler::with_custom_text(
            "Error in message handler",
        ))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    tracing::warn!(bot = %bot_id, "Dispatcher stopped");
    Ok(())
}

/// Message handler endpoint for the dispatcher
async fn message_handler(bot: Bot, msg: Message, relay: Arc<Relay>) -> ResponseResult<()> {
    let Some(inbound) = to_inbound(&msg) else {
        tracing::debug!(
            bot = %relay.bot_id(),
            "Ignoring message without sender in chat {}",
            msg.chat.id
        );
        return Ok(());
    };

    tracing::info!(
        bot = %relay.bot_id(),
        ">>> Message received: user={}, chat={}, text={:?}",
        inbound.user_id,
        inbound.chat_id,
        inbound.text.chars().take(50).collect::<String>()
    );

    // Typing indicator is best effort
    if let Err(e) = bot.send_chat_action(msg.chat.id, ChatAction::Typing).await {
        tracing::debug!(bot = %relay.bot_id(), "Failed to send typing action: {}", e);
    }

    if let Some(reply) = relay.handle(&inbound).await {
        if let Err(e) = send_reply(&bot, msg.chat.id, &reply).await {
            tracing::error!(bot = %relay.bot_id(), "Error sending response: {:#}", e);
        }
    }

    Ok(())
}

/// Build the relay's view of a Telegram message. `None` for messages without a
/// sender (channel posts).
fn to_inbound(msg: &Message) -> Option<InboundMessage> {
    let from = msg.from.as_ref()?;

    let sticker = msg.sticker().map(|s| {
        if s.is_animated() {
            StickerKind::Animated
        } else if s.is_video() {
            StickerKind::Video
        } else {
            StickerKind::Static
        }
    });

    Some(InboundMessage {
        chat_id: msg.chat.id.0,
        user_id: from.id.0 as i64,
        username: from.username.clone().unwrap_or_default(),
        first_name: from.first_name.clone(),
        last_name: from.last_name.clone(),
        language_code: from.language_code.clone(),
        is_premium: from.is_premium,
        text: msg.text().unwrap_or_default().to_string(),
        sticker,
        sent_at: msg.date,
    })
}

async fn send_reply(bot: &Bot, chat_id: ChatId, text: &str) -> Result<()> {
    for chunk in chunk_message(text, MAX_MESSAGE_CHARS) {
        bot.send_message(chat_id, chunk).await?;
    }
    Ok(())
}

/// Split `text` into pieces of at most `max_chars` characters, on char boundaries
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let split_at = remaining
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let (chunk, rest) = remaining.split_at(split_at);
        chunks.push(chunk);
        remaining = rest;
    }

    chunks
}

//! Claude API Client
//!
//! Anthropic Messages API behind the [`ChatModel`] trait, so the relay can be
//! driven by a scripted model in tests.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chat_memory::{ContextMessage, TurnRole};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One completion request
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<ContextMessage>,
    pub max_tokens: usize,
}

/// Anything that can answer a conversation
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate(&self, request: ChatRequest) -> Result<String>;
}

/// Claude API client
#[derive(Clone)]
pub struct ClaudeClient {
    client: Client,
    bot_id: String,
    api_key: Option<String>,
}

/// Message in conversation
#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

/// API request
#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: Vec<Message<'a>>,
}

/// API response
#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    r#type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: usize,
    output_tokens: usize,
}

impl ClaudeClient {
    pub fn new(bot_id: &str, api_key: Option<&str>) -> Self {
        Self {
            client: Client::new(),
            bot_id: bot_id.to_string(),
            api_key: api_key.map(|s| s.to_string()),
        }
    }

    /// Check if API key is configured
    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Wire messages for a context. The API wants the conversation to open with
/// a user turn, so leading assistant turns left over from trimming are dropped.
fn wire_messages(context: &[ContextMessage]) -> Vec<Message<'_>> {
    context
        .iter()
        .skip_while(|m| m.role == TurnRole::Assistant)
        .map(|m| Message {
            role: m.role.as_str(),
            content: &m.text,
        })
        .collect()
}

/// First text block of a response
fn first_text(response: MessageResponse) -> Result<String> {
    match response.content.into_iter().next() {
        Some(ContentBlock { r#type, text: Some(text) }) if r#type == "text" => Ok(text),
        _ => anyhow::bail!("unexpected response format from Anthropic"),
    }
}

#[async_trait]
impl ChatModel for ClaudeClient {
    async fn generate(&self, request: ChatRequest) -> Result<String> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("ANTHROPIC_API_KEY not set"))?;

        let body = MessageRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            system: &request.system,
            messages: wire_messages(&request.messages),
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            anyhow::bail!("Claude API error {}: {}", status, text);
        }

        let result: MessageResponse = response.json().await?;
        debug!(
            bot = %self.bot_id,
            "Claude response: model={}, in={}, out={}",
            request.model, result.usage.input_tokens, result.usage.output_tokens
        );

        first_text(result)
    }
}

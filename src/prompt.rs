//! System prompt assembly
//!
//! Each bot configures named prompt fragments. The system prompt for a reply
//! is stitched together from them depending on who is asking and where in the
//! conversation we are, then user placeholders are filled in.

use chrono::{DateTime, Timelike, Utc};
use std::collections::HashMap;

/// Conditions that select prompt fragments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromptFlags {
    /// Sender is admin or owner (no `avoid_sensitive` fragment)
    pub privileged: bool,
    /// First message of the chat
    pub new_chat: bool,
    /// Message text is emoji only
    pub emoji_only: bool,
}

/// Sender details available to placeholders
#[derive(Debug, Clone, Default)]
pub struct PromptContext<'a> {
    pub username: Option<&'a str>,
    pub first_name: Option<&'a str>,
    pub last_name: Option<&'a str>,
    pub language: Option<&'a str>,
    pub is_premium: bool,
    pub sent_at: DateTime<Utc>,
}

fn fragment<'a>(prompts: &'a HashMap<String, String>, name: &str) -> &'a str {
    prompts.get(name).map(String::as_str).unwrap_or("")
}

/// Join the configured fragments into one system prompt
pub fn compose_system_prompt(prompts: &HashMap<String, String>, flags: PromptFlags) -> String {
    let mut system = String::from(fragment(prompts, "default"));

    system.push(' ');
    system.push_str(fragment(prompts, "custom_instructions"));

    if !flags.privileged {
        system.push(' ');
        system.push_str(fragment(prompts, "avoid_sensitive"));
    }

    if flags.new_chat {
        system.push_str("\n\n");
        system.push_str(fragment(prompts, "new_chat"));
    } else {
        system.push(' ');
        system.push_str(fragment(prompts, "continue_conversation"));
    }

    if flags.emoji_only {
        system.push(' ');
        system.push_str(fragment(prompts, "respond_with_emojis"));
    }

    system
}

fn non_empty<'a>(value: Option<&'a str>, default: &'a str) -> &'a str {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => default,
    }
}

/// Substitute `{username}`, `{firstname}`, `{lastname}`, `{language}`,
/// `{premium_status}` and `{time_context}`
pub fn fill_placeholders(template: &str, ctx: &PromptContext<'_>) -> String {
    let premium = if ctx.is_premium {
        "premium user"
    } else {
        "regular user"
    };

    template
        .replace("{username}", non_empty(ctx.username, "unknown"))
        .replace("{firstname}", non_empty(ctx.first_name, "unknown"))
        .replace("{lastname}", non_empty(ctx.last_name, ""))
        .replace("{language}", non_empty(ctx.language, "en"))
        .replace("{premium_status}", premium)
        .replace("{time_context}", time_context(ctx.sent_at.hour()))
}

/// Part of day for an hour (0-23)
pub fn time_context(hour: u32) -> &'static str {
    match hour {
        5..=11 => "morning",
        12..=17 => "afternoon",
        18..=21 => "evening",
        _ => "night",
    }
}

fn is_emoji(c: char) -> bool {
    matches!(c as u32,
        0x1F600..=0x1F64F   // emoticons
        | 0x1F300..=0x1F5FF // symbols & pictographs
        | 0x1F680..=0x1F6FF // transport & map
        | 0x2600..=0x26FF   // misc symbols
        | 0x2700..=0x27BF   // dingbats
    )
}

/// True when `text` has at least one emoji and nothing else besides
/// whitespace, variation selectors and joiners
pub fn is_only_emojis(text: &str) -> bool {
    let mut seen = false;
    for c in text.chars() {
        if is_emoji(c) {
            seen = true;
        } else if !(c.is_whitespace() || c == '\u{FE0F}' || c == '\u{200D}') {
            return false;
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn prompts() -> HashMap<String, String> {
        [
            ("default", "You are a helpful assistant."),
            ("custom_instructions", "Be concise."),
            ("avoid_sensitive", "Avoid sensitive topics."),
            ("new_chat", "Greet the user."),
            ("continue_conversation", "Continue naturally."),
            ("respond_with_emojis", "Reply with emojis."),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_new_chat_for_regular_user() {
        let system = compose_system_prompt(
            &prompts(),
            PromptFlags {
                new_chat: true,
                ..Default::default()
            },
        );
        assert_eq!(
            system,
            "You are a helpful assistant. Be concise. Avoid sensitive topics.\n\nGreet the user."
        );
    }

    #[test]
    fn test_continuing_privileged_emoji() {
        let system = compose_system_prompt(
            &prompts(),
            PromptFlags {
                privileged: true,
                new_chat: false,
                emoji_only: true,
            },
        );
        assert_eq!(
            system,
            "You are a helpful assistant. Be concise. Continue naturally. Reply with emojis."
        );
        assert!(!system.contains("sensitive"));
    }

    #[test]
    fn test_missing_fragments_are_empty() {
        let system = compose_system_prompt(&HashMap::new(), PromptFlags::default());
        assert_eq!(system.trim(), "");
    }

    #[test]
    fn test_placeholder_replacement() {
        let template = "The user you're talking to has username '{username}' \
                        and display name '{firstname} {lastname}'.\n\
                        User's language preference: '{language}'\n\
                        User is a {premium_status}\n\
                        It's currently {time_context} in your timezone";

        let ctx = PromptContext {
            username: Some("testuser"),
            first_name: Some("Test"),
            last_name: Some("User"),
            language: Some("de"),
            is_premium: true,
            sent_at: Utc.with_ymd_and_hms(2025, 5, 15, 14, 0, 0).unwrap(),
        };

        let filled = fill_placeholders(template, &ctx);
        assert!(filled.contains("username 'testuser'"));
        assert!(filled.contains("display name 'Test User'"));
        assert!(filled.contains("language preference: 'de'"));
        assert!(filled.contains("User is a premium user"));
        assert!(filled.contains("It's currently afternoon in your timezone"));
    }

    #[test]
    fn test_placeholder_defaults() {
        let ctx = PromptContext {
            username: Some(""),
            sent_at: Utc.with_ymd_and_hms(2025, 5, 15, 23, 30, 0).unwrap(),
            ..Default::default()
        };

        let filled = fill_placeholders(
            "{username}|{firstname}|{lastname}|{language}|{premium_status}|{time_context}",
            &ctx,
        );
        assert_eq!(filled, "unknown|unknown||en|regular user|night");
    }

    #[test]
    fn test_time_context_boundaries() {
        assert_eq!(time_context(4), "night");
        assert_eq!(time_context(5), "morning");
        assert_eq!(time_context(11), "morning");
        assert_eq!(time_context(12), "afternoon");
        assert_eq!(time_context(17), "afternoon");
        assert_eq!(time_context(18), "evening");
        assert_eq!(time_context(21), "evening");
        assert_eq!(time_context(22), "night");
        assert_eq!(time_context(0), "night");
    }

    #[test]
    fn test_is_only_emojis() {
        assert!(is_only_emojis("😀"));
        assert!(is_only_emojis("😀 🚀"));
        assert!(is_only_emojis("❤️"));
        assert!(!is_only_emojis("hello 😀"));
        assert!(!is_only_emojis(""));
        assert!(!is_only_emojis("   "));
        assert!(!is_only_emojis("123"));
    }
}

//! Bot commands
//!
//! Parses the slash commands a bot understands. Anything else, including
//! unknown slash commands, is treated as regular conversation.

use std::fmt;

/// A recognized command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `/stats`
    Stats,
    /// `/stats user [id]`; `None` means the sender
    UserStats(Option<i64>),
    /// `/whoami`
    Whoami,
    /// `/clear [id]` and `/clear_hard [id]`
    Clear { target: Option<i64>, hard: bool },
    /// `/promote <id>`
    Promote(i64),
}

/// A recognized command with bad arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    StatsFormat,
    StatsUserId,
    ClearUserId { hard: bool },
    PromoteUsage,
}

impl CommandError {
    /// Reply text for the sender
    pub fn usage(&self) -> &'static str {
        match self {
            CommandError::StatsFormat => {
                "Invalid command format. Usage: /stats or /stats user [user_id]"
            }
            CommandError::StatsUserId => "Invalid user ID format. Usage: /stats user [user_id]",
            CommandError::ClearUserId { hard: false } => {
                "Invalid user ID format. Usage: /clear [user_id]"
            }
            CommandError::ClearUserId { hard: true } => {
                "Invalid user ID format. Usage: /clear_hard [user_id]"
            }
            CommandError::PromoteUsage => "Invalid command format. Usage: /promote [user_id]",
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.usage())
    }
}

impl std::error::Error for CommandError {}

/// Parse a message as a command.
///
/// Returns `None` when the text is not one of our commands. A `@botname`
/// suffix on the command word is ignored.
pub fn parse_command(text: &str) -> Option<Result<Command, CommandError>> {
    let mut parts = text.split_whitespace();
    let head = parts.next()?;
    if !head.starts_with('/') {
        return None;
    }
    let name = head.split('@').next().unwrap_or(head);
    let args: Vec<&str> = parts.collect();

    let parsed = match name {
        "/stats" => parse_stats(&args),
        "/whoami" => Ok(Command::Whoami),
        "/clear" => parse_clear(&args, false),
        "/clear_hard" => parse_clear(&args, true),
        "/promote" => match args.first().map(|id| id.parse::<i64>()) {
            Some(Ok(id)) => Ok(Command::Promote(id)),
            _ => Err(CommandError::PromoteUsage),
        },
        _ => return None,
    };

    Some(parsed)
}

fn parse_stats(args: &[&str]) -> Result<Command, CommandError> {
    match args {
        [] => Ok(Command::Stats),
        ["user"] => Ok(Command::UserStats(None)),
        ["user", id, ..] => id
            .parse()
            .map(|id| Command::UserStats(Some(id)))
            .map_err(|_| CommandError::StatsUserId),
        _ => Err(CommandError::StatsFormat),
    }
}

fn parse_clear(args: &[&str], hard: bool) -> Result<Command, CommandError> {
    match args.first() {
        None => Ok(Command::Clear { target: None, hard }),
        Some(id) => id
            .parse()
            .map(|id| Command::Clear {
                target: Some(id),
                hard,
            })
            .map_err(|_| CommandError::ClearUserId { hard }),
    }
}

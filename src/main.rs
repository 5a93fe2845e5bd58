//! RelayBot - Entry Point
//!
//! Loads every active bot config and runs all bots in one process.
//!
//! Modes:
//! - Default: run all active bots
//! - --check / -c: validate configs and exit

use std::sync::Arc;

use futures_util::future::join_all;
use relaybot::{
    config::load_all_configs, telegram, ClaudeClient, Config, Database, Relay, SystemClock,
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let check_mode = args.iter().any(|a| a == "--check" || a == "-c");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("RelayBot v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: relaybot [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --check, -c   Validate bot configs and exit");
        println!("  --help, -h    Show this help");
        println!();
        println!("Environment variables:");
        println!("  RELAYBOT_CONFIG_DIR   Directory of bot *.json configs (default: configs)");
        println!("  RELAYBOT_DB_PATH      SQLite database path");
        println!("  ANTHROPIC_API_KEY     Claude API key for bots without their own");
        println!("  RELAYBOT_LOG_JSON     Log JSON to stderr (true/1)");
        println!("  RUST_LOG              Log level (trace, debug, info, warn, error)");
        return Ok(());
    }

    let config = Config::from_env()?;

    // Setup logging
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    if config.log_json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("RelayBot v{}", env!("CARGO_PKG_VERSION"));

    let bots = load_all_configs(&config.config_dir)?;
    info!(
        "Loaded {} active bot(s) from {}",
        bots.len(),
        config.config_dir.display()
    );

    if check_mode {
        for bot in &bots {
            info!(bot = %bot.id, "OK: {:?}", bot);
        }
        return Ok(());
    }

    if bots.is_empty() {
        warn!("No active bots configured, exiting");
        return Ok(());
    }

    let db = Database::open(&config.db_path)?;
    let clock = Arc::new(SystemClock);

    let mut tasks = Vec::new();
    for bot in bots {
        let api_key = bot
            .anthropic_api_key
            .clone()
            .or_else(|| config.anthropic_api_key.clone());
        let model = Arc::new(ClaudeClient::new(&bot.id, api_key.as_deref()));
        if !model.is_available() {
            warn!(bot = %bot.id, "No Anthropic API key, replies will use the fallback text");
        }

        let bot_id = bot.id.clone();
        let relay = match Relay::new(bot, db.clone(), model, clock.clone()) {
            Ok(relay) => Arc::new(relay),
            Err(e) => {
                error!(bot = %bot_id, "Failed to initialize bot: {}", e);
                continue;
            }
        };

        tasks.push(tokio::spawn(async move {
            if let Err(e) = telegram::run_bot(relay).await {
                error!(bot = %bot_id, "Bot stopped with error: {:#}", e);
            }
        }));
    }

    for result in join_all(tasks).await {
        if let Err(e) = result {
            error!("Bot task panicked: {}", e);
        }
    }

    info!("All bots stopped");
    Ok(())
}

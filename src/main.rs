//! logsentinel CLI entry point.
//!
//! `start` runs the monitor daemon; the remaining subcommands are one-shot
//! operations against the state database.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use logsentinel::config::{load_config, runtime_paths, Config, RuntimePaths};
use logsentinel::db::StateDb;
use logsentinel::dispatch::{ChatChannel, Dispatcher, LiveFeed, RetryPolicy};
use logsentinel::gateway::{BotGateway, GatewaySettings};
use logsentinel::matcher::PatternMatcher;
use logsentinel::tailer::Tailer;
use logsentinel::telegram::{html_escape, MessagingApi, TelegramClient};

/// Per-listener buffer of the live feed.
const LIVE_FEED_CAPACITY: usize = 256;

/// logsentinel: watch log files and report new errors.
#[derive(Parser)]
#[command(name = "logsentinel", version, about)]
struct Cli {
    /// Config file (default: ~/.logsentinel/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the tailer, dispatcher and bot gateway until Ctrl-C.
    Start {
        /// Print each new error to stdout as a JSON line.
        #[arg(long)]
        echo: bool,
    },
    /// Process the watch directory once, without watching or notifying.
    Scan,
    /// List recently recorded errors.
    Errors {
        /// Maximum number of errors to show.
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// List active subscribers.
    Subscribers,
    /// Mark a notification as read.
    MarkRead {
        /// Notification id.
        id: i64,
    },
    /// Send a test message to the direct chat and every active subscriber.
    SendTest {
        /// Message text.
        message: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The bot token may live in a .env file next to the config.
    let _ = dotenvy::dotenv();

    let paths = runtime_paths()?;
    let config_path = cli.config.unwrap_or_else(|| paths.config_toml.clone());
    let config = load_config(&config_path)?;

    match cli.command {
        Command::Start { echo } => handle_start(&paths, &config, echo).await,
        Command::Scan => handle_scan(&paths, &config).await,
        Command::Errors { limit } => handle_errors(&paths, &config, limit).await,
        Command::Subscribers => handle_subscribers(&paths, &config).await,
        Command::MarkRead { id } => handle_mark_read(&paths, &config, id).await,
        Command::SendTest { message } => handle_send_test(&paths, &config, &message).await,
    }
}

/// Build the messaging client if a bot token is available.
fn messaging_api(config: &Config) -> anyhow::Result<Option<Arc<dyn MessagingApi>>> {
    let Some(token) = config.telegram.bot_token() else {
        return Ok(None);
    };
    let client = TelegramClient::new(
        &token,
        &config.telegram.api_base,
        config.telegram.long_poll_timeout_secs,
        Duration::from_secs(config.delivery.request_timeout_secs),
    )
    .context("failed to create Telegram client")?;
    Ok(Some(Arc::new(client)))
}

fn chat_channel(config: &Config, api: Arc<dyn MessagingApi>, db: StateDb) -> ChatChannel {
    ChatChannel::new(
        api,
        db,
        config.telegram.direct_chat_id.clone(),
        RetryPolicy::new(config.delivery.max_attempts, config.delivery.backoff_base()),
    )
}

async fn open_db(paths: &RuntimePaths, config: &Config) -> anyhow::Result<StateDb> {
    let path = config.state_db_path(paths);
    StateDb::open(&path).await
}

/// Run the monitor until Ctrl-C.
async fn handle_start(paths: &RuntimePaths, config: &Config, echo: bool) -> anyhow::Result<()> {
    let _logging_guard =
        logsentinel::logging::init_production(&config.logs_dir(paths), &config.logging.level)?;

    let db = open_db(paths, config).await?;
    let api = messaging_api(config)?;
    if api.is_none() {
        warn!(
            env = %config.telegram.bot_token_env,
            "no bot token set, chat delivery and bot gateway disabled"
        );
    }

    // Dispatcher and its channels.
    let mut dispatcher = Dispatcher::new(db.clone());
    let mut echo_task = None;
    if config.channels.live {
        let feed = LiveFeed::new(LIVE_FEED_CAPACITY);
        if echo {
            let mut listener = feed.subscribe();
            echo_task = Some(tokio::spawn(async move {
                while let Ok(record) = listener.recv().await {
                    match serde_json::to_string(&record) {
                        Ok(line) => println!("{line}"),
                        Err(e) => warn!(error = %e, "failed to serialize error record"),
                    }
                }
            }));
        }
        dispatcher = dispatcher.with_channel(Arc::new(feed));
    }
    if config.channels.chat {
        if let Some(api) = &api {
            dispatcher =
                dispatcher.with_channel(Arc::new(chat_channel(config, Arc::clone(api), db.clone())));
        }
    }
    let (queue_tx, queue_rx) = mpsc::channel(config.delivery.queue_capacity);
    let dispatcher_task = tokio::spawn(Arc::new(dispatcher).run(queue_rx));

    // Bot gateway.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway_task = api.map(|api| {
        let settings = GatewaySettings {
            poll_interval: Duration::from_secs(config.telegram.poll_interval_secs),
            error_backoff: Duration::from_secs(config.telegram.error_backoff_secs),
            reply_to_commands: config.telegram.reply_to_commands,
        };
        tokio::spawn(BotGateway::new(api, db.clone(), settings).run(shutdown_rx))
    });

    // Tailer. A missing watch directory aborts startup.
    let matcher = PatternMatcher::new(&config.monitor.patterns);
    let mut tailer = Tailer::new(db.clone(), matcher, Some(queue_tx));
    tailer
        .start(&config.monitor.directory, &config.monitor.masks)
        .await
        .with_context(|| {
            format!(
                "failed to start monitoring {}",
                config.monitor.directory.display()
            )
        })?;

    info!(
        dir = %config.monitor.directory.display(),
        state_db = %config.state_db_path(paths).display(),
        "logsentinel started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    if let Some(task) = gateway_task {
        if let Err(e) = task.await {
            warn!(error = %e, "bot gateway task failed");
        }
    }

    tailer.stop().await;
    // Dropping the tailer closes the queue so the dispatcher can drain.
    drop(tailer);
    if let Err(e) = dispatcher_task.await {
        warn!(error = %e, "dispatcher task failed");
    }
    if let Some(task) = echo_task {
        task.abort();
    }

    info!("logsentinel stopped");
    Ok(())
}

/// Process the watch directory once.
async fn handle_scan(paths: &RuntimePaths, config: &Config) -> anyhow::Result<()> {
    logsentinel::logging::init_cli(&config.logging.level);
    let db = open_db(paths, config).await?;
    let tailer = Tailer::new(db, PatternMatcher::new(&config.monitor.patterns), None);
    let report = tailer
        .scan_once(&config.monitor.directory, &config.monitor.masks)
        .await?;

    println!(
        "Scanned {} file(s), {} line(s): {} new error(s), {} file(s) failed",
        report.files, report.lines, report.created, report.failed
    );
    Ok(())
}

/// Print recent errors with their delivery flags.
async fn handle_errors(paths: &RuntimePaths, config: &Config, limit: i64) -> anyhow::Result<()> {
    logsentinel::logging::init_cli(&config.logging.level);
    let db = open_db(paths, config).await?;
    let errors = db.recent_errors(limit).await?;
    if errors.is_empty() {
        println!("No errors recorded.");
        return Ok(());
    }

    for error in errors {
        let flags = match db.notification_for_error(error.id).await? {
            Some(n) => format!(
                "notification #{} live={} chat={} read={}",
                n.id, n.live_sent, n.chat_sent, n.is_read
            ),
            None => "no notification".to_owned(),
        };
        println!(
            "#{} {} {}@{} [{}]\n    {}",
            error.id,
            error.created_at.format("%Y-%m-%d %H:%M:%S"),
            error.file_path.display(),
            error.offset,
            flags,
            error.content
        );
    }
    Ok(())
}

/// Print active subscribers.
async fn handle_subscribers(paths: &RuntimePaths, config: &Config) -> anyhow::Result<()> {
    logsentinel::logging::init_cli(&config.logging.level);
    let db = open_db(paths, config).await?;
    let subscribers = db.list_active_subscribers().await?;
    if subscribers.is_empty() {
        println!("No active subscribers.");
        return Ok(());
    }
    for s in subscribers {
        println!(
            "{} {} {} (since {})",
            s.chat_id,
            s.display_name.as_deref().unwrap_or("-"),
            s.username
                .as_deref()
                .map_or_else(|| "-".to_owned(), |u| format!("@{u}")),
            s.subscribed_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// Mark one notification read.
async fn handle_mark_read(paths: &RuntimePaths, config: &Config, id: i64) -> anyhow::Result<()> {
    logsentinel::logging::init_cli(&config.logging.level);
    let db = open_db(paths, config).await?;
    if !db.mark_read(id).await? {
        anyhow::bail!("notification #{id} not found");
    }
    println!("Notification #{id} marked as read.");
    Ok(())
}

/// Send a test message through the chat channel.
async fn handle_send_test(
    paths: &RuntimePaths,
    config: &Config,
    message: &str,
) -> anyhow::Result<()> {
    logsentinel::logging::init_cli(&config.logging.level);
    let db = open_db(paths, config).await?;
    let api = messaging_api(config)?.with_context(|| {
        format!(
            "no bot token: set {} in the environment or .env",
            config.telegram.bot_token_env
        )
    })?;

    let channel = chat_channel(config, api, db);
    let (succeeded, attempted) = channel.broadcast_text(&html_escape(message), None).await;
    println!("Delivered to {succeeded} of {attempted} recipient(s).");
    if attempted > 0 && succeeded == 0 {
        anyhow::bail!("test message was not delivered to any recipient");
    }
    Ok(())
}

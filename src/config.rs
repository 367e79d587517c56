//! Configuration loading for logsentinel.
//!
//! Loads `config.toml` with per-section defaults. Only `[monitor]` is
//! required; every other section uses `#[serde(default)]` so a minimal
//! config file naming the watch directory is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Top-level logsentinel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Watched directory, file masks and error patterns.
    pub monitor: MonitorConfig,

    /// Durable state database location.
    #[serde(default)]
    pub store: StoreConfig,

    /// Retry policy and queue sizing for notification delivery.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Per-channel enable flags.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Telegram bot settings for chat delivery and the command gateway.
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Log output location for the daemon.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What to watch and what counts as an error.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Directory holding the log files (watched non-recursively).
    pub directory: PathBuf,

    /// Glob masks matched against file names in `directory`.
    #[serde(default = "default_masks")]
    pub masks: Vec<String>,

    /// Error patterns: literal substrings or regexes, case-insensitive.
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,
}

/// Durable state database location.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database. Defaults to `~/.logsentinel/state.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Retry policy and queue sizing for notification delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Attempts per chat recipient before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles after every further failure.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Timeout for a single outbound send request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Capacity of the queue between the tailer and the dispatcher.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl DeliveryConfig {
    /// Backoff base as a [`Duration`].
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

/// Per-channel enable flags.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    /// Push each new error to in-process live listeners.
    #[serde(default = "default_true")]
    pub live: bool,

    /// Deliver each new error over Telegram.
    #[serde(default = "default_true")]
    pub chat: bool,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            live: true,
            chat: true,
        }
    }
}

/// Telegram bot settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Environment variable name holding the bot token.
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,

    /// Chat that always receives notifications, in addition to subscribers.
    /// Either a numeric chat id or an `@channel` username.
    #[serde(default)]
    pub direct_chat_id: Option<String>,

    /// Seconds between successful poll cycles.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Seconds to wait after a failed poll cycle.
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,

    /// Long-poll timeout passed to `getUpdates`.
    #[serde(default = "default_long_poll_timeout_secs")]
    pub long_poll_timeout_secs: u32,

    /// Reply to `/subscribe` and `/unsubscribe` with a confirmation.
    #[serde(default = "default_true")]
    pub reply_to_commands: bool,

    /// Bot API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token_env: default_bot_token_env(),
            direct_chat_id: None,
            poll_interval_secs: default_poll_interval_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            long_poll_timeout_secs: default_long_poll_timeout_secs(),
            reply_to_commands: true,
            api_base: default_api_base(),
        }
    }
}

impl TelegramConfig {
    /// Read the bot token from the configured environment variable.
    ///
    /// Returns `None` when the variable is unset or blank.
    pub fn bot_token(&self) -> Option<String> {
        std::env::var(&self.bot_token_env)
            .ok()
            .map(|token| token.trim().to_owned())
            .filter(|token| !token.is_empty())
    }
}

/// Log output location and verbosity.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Directory for JSON log files. Defaults to `~/.logsentinel/logs`.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Filter used when `RUST_LOG` is unset, e.g. `info` or
    /// `logsentinel=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            level: default_log_level(),
        }
    }
}

/// Resolved filesystem paths for logsentinel's own state.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Root directory (`~/.logsentinel/`).
    pub root: PathBuf,
    /// Default config file location.
    pub config_toml: PathBuf,
    /// Default state database location.
    pub state_db: PathBuf,
    /// Default log directory.
    pub logs_dir: PathBuf,
}

impl Config {
    /// Validate that configuration values are within sane bounds.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.monitor.masks.is_empty(),
            "monitor.masks must not be empty"
        );
        for mask in &self.monitor.masks {
            glob::Pattern::new(mask)
                .with_context(|| format!("monitor.masks contains invalid glob '{mask}'"))?;
        }
        anyhow::ensure!(
            (1..=10).contains(&self.delivery.max_attempts),
            "delivery.max_attempts must be in [1, 10]"
        );
        anyhow::ensure!(
            self.delivery.backoff_base_ms <= 60_000,
            "delivery.backoff_base_ms must be <= 60000"
        );
        anyhow::ensure!(
            self.delivery.request_timeout_secs >= 1,
            "delivery.request_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.delivery.queue_capacity >= 1,
            "delivery.queue_capacity must be >= 1"
        );
        anyhow::ensure!(
            self.telegram.poll_interval_secs >= 1,
            "telegram.poll_interval_secs must be >= 1"
        );
        anyhow::ensure!(
            self.telegram.long_poll_timeout_secs <= 50,
            "telegram.long_poll_timeout_secs must be <= 50"
        );
        url::Url::parse(&self.telegram.api_base)
            .with_context(|| format!("telegram.api_base '{}' is not a URL", self.telegram.api_base))?;
        tracing_subscriber::EnvFilter::try_new(&self.logging.level).with_context(|| {
            format!("logging.level '{}' is not a valid filter", self.logging.level)
        })?;
        if let Some(chat) = &self.telegram.direct_chat_id {
            anyhow::ensure!(
                chat.starts_with('@') || chat.parse::<i64>().is_ok(),
                "telegram.direct_chat_id must be a numeric id or an @username"
            );
        }
        Ok(())
    }

    /// State database path, falling back to the default under `paths`.
    pub fn state_db_path(&self, paths: &RuntimePaths) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| paths.state_db.clone())
    }

    /// Log directory, falling back to the default under `paths`.
    pub fn logs_dir(&self, paths: &RuntimePaths) -> PathBuf {
        self.logging
            .dir
            .clone()
            .unwrap_or_else(|| paths.logs_dir.clone())
    }
}

/// Parse and validate configuration from TOML text.
///
/// # Errors
///
/// Returns an error if the text is not valid TOML or fails validation.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or fails validation.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("invalid config at {}", path.display()))
}

/// Resolve logsentinel's filesystem paths under `~/.logsentinel/`.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_paths() -> anyhow::Result<RuntimePaths> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    let root = home.home_dir().join(".logsentinel");
    Ok(RuntimePaths {
        config_toml: root.join("config.toml"),
        state_db: root.join("state.db"),
        logs_dir: root.join("logs"),
        root,
    })
}

// Default value functions for serde.

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_masks() -> Vec<String> {
    vec!["*.log".to_owned()]
}

fn default_patterns() -> Vec<String> {
    vec!["ERR".to_owned()]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_bot_token_env() -> String {
    "LOGSENTINEL_TELEGRAM_TOKEN".to_owned()
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_error_backoff_secs() -> u64 {
    10
}

fn default_long_poll_timeout_secs() -> u32 {
    30
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_owned()
}

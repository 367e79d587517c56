//! Inbound command gateway.
//!
//! A single sequential long-poll loop reads bot updates and applies
//! `/subscribe` and `/unsubscribe` to the subscriber table. The poll cursor
//! advances past every update it sees, handled or not, so a bad update is
//! never replayed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::db::StateDb;
use crate::telegram::{InboundMessage, InboundUpdate, MessagingApi, TelegramError};

/// Last update id consumed. Starts at 0 and never decreases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct PollCursor(i64);

impl PollCursor {
    /// The last consumed update id.
    pub fn value(self) -> i64 {
        self.0
    }

    /// Move to `max(current, id)`. Returns whether the cursor moved.
    pub fn advance(&mut self, id: i64) -> bool {
        if id > self.0 {
            self.0 = id;
            true
        } else {
            false
        }
    }
}

/// Commands the gateway understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start receiving notifications.
    Subscribe,
    /// Stop receiving notifications.
    Unsubscribe,
}

/// Parse the first whitespace-delimited token of a message as a command.
///
/// A trailing `@botname` is stripped; anything else returns `None`.
pub fn parse_command(text: &str) -> Option<Command> {
    let token = text.split_whitespace().next()?;
    let command = token.split('@').next().unwrap_or(token);
    match command {
        "/subscribe" => Some(Command::Subscribe),
        "/unsubscribe" => Some(Command::Unsubscribe),
        _ => None,
    }
}

/// What a command did to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// absent -> active
    Created,
    /// inactive -> active
    Reactivated,
    /// active -> active
    AlreadyActive,
    /// active -> inactive
    Deactivated,
    /// inactive -> inactive
    AlreadyInactive,
    /// `/unsubscribe` from a chat that never subscribed.
    Unknown,
}

impl Transition {
    /// Whether the subscriber row was written.
    pub fn changed_state(self) -> bool {
        matches!(self, Self::Created | Self::Reactivated | Self::Deactivated)
    }

    fn reply(self) -> Option<&'static str> {
        match self {
            Self::Created | Self::Reactivated => {
                Some("Subscribed. You will receive error notifications here.")
            }
            Self::AlreadyActive => Some("You are already subscribed."),
            Self::Deactivated => Some("Unsubscribed. Send /subscribe to opt back in."),
            Self::AlreadyInactive => Some("You are not subscribed."),
            Self::Unknown => None,
        }
    }
}

/// Timing and behaviour of the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Pause after a successful cycle.
    pub poll_interval: Duration,
    /// Pause after a failed cycle.
    pub error_backoff: Duration,
    /// Send a confirmation reply for each command.
    pub reply_to_commands: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            error_backoff: Duration::from_secs(10),
            reply_to_commands: true,
        }
    }
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Updates received.
    pub updates: usize,
    /// Commands that changed subscriber state.
    pub changed: usize,
}

/// Polls for bot commands and maintains subscribers.
pub struct BotGateway {
    api: Arc<dyn MessagingApi>,
    db: StateDb,
    cursor: PollCursor,
    settings: GatewaySettings,
}

impl std::fmt::Debug for BotGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotGateway")
            .field("cursor", &self.cursor)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl BotGateway {
    /// Create a gateway with a fresh cursor.
    pub fn new(api: Arc<dyn MessagingApi>, db: StateDb, settings: GatewaySettings) -> Self {
        Self {
            api,
            db,
            cursor: PollCursor::default(),
            settings,
        }
    }

    /// Current cursor.
    pub fn cursor(&self) -> PollCursor {
        self.cursor
    }

    /// Run one poll cycle.
    ///
    /// Well-formed updates ahead of a malformed entry are applied and
    /// consumed before the parse error is returned.
    ///
    /// # Errors
    ///
    /// Returns the transport or parse error. The cursor never moves past an
    /// update that was not applied.
    pub async fn poll_once(&mut self) -> Result<CycleReport, TelegramError> {
        let batch = self.api.get_updates(self.cursor.value()).await?;
        let mut report = CycleReport {
            updates: batch.updates.len(),
            ..CycleReport::default()
        };

        for update in batch.updates {
            self.cursor.advance(update.id);
            if let Some(transition) = self.handle_update(&update).await {
                if transition.changed_state() {
                    report.changed = report.changed.saturating_add(1);
                }
            }
        }

        match batch.malformed {
            Some(e) => {
                if report.updates > 0 {
                    debug!(
                        applied = report.updates,
                        cursor = self.cursor.value(),
                        "applied updates ahead of a malformed entry"
                    );
                }
                Err(e)
            }
            None => Ok(report),
        }
    }

    async fn handle_update(&self, update: &InboundUpdate) -> Option<Transition> {
        let message = update.message.as_ref()?;
        let command = parse_command(message.text.as_deref()?)?;
        if message.chat_id <= 0 {
            debug!(update_id = update.id, chat_id = message.chat_id, "ignoring non-personal chat");
            return None;
        }

        let transition = match self.apply(message, command).await {
            Ok(transition) => transition,
            Err(e) => {
                warn!(
                    update_id = update.id,
                    chat_id = message.chat_id,
                    error = %e,
                    "failed to apply subscriber command"
                );
                return None;
            }
        };

        info!(chat_id = message.chat_id, ?command, ?transition, "subscriber command");

        if self.settings.reply_to_commands {
            if let Some(reply) = transition.reply() {
                let chat_id = message.chat_id.to_string();
                if let Err(e) = self.api.send_message(&chat_id, reply).await {
                    warn!(chat_id = message.chat_id, error = %e, "failed to send command reply");
                }
            }
        }
        Some(transition)
    }

    /// Apply a command to the subscriber state machine, persisting any change.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read or write fails.
    pub async fn apply(
        &self,
        message: &InboundMessage,
        command: Command,
    ) -> anyhow::Result<Transition> {
        let existing = self.db.find_subscriber(message.chat_id).await?;

        let transition = match (command, existing.map(|s| s.active)) {
            (Command::Subscribe, None) => Transition::Created,
            (Command::Subscribe, Some(false)) => Transition::Reactivated,
            (Command::Subscribe, Some(true)) => Transition::AlreadyActive,
            (Command::Unsubscribe, Some(true)) => Transition::Deactivated,
            (Command::Unsubscribe, Some(false)) => Transition::AlreadyInactive,
            (Command::Unsubscribe, None) => Transition::Unknown,
        };

        if transition.changed_state() {
            self.db
                .upsert_subscriber(
                    message.chat_id,
                    message.first_name.as_deref(),
                    message.username.as_deref(),
                    command == Command::Subscribe,
                )
                .await?;
        }
        Ok(transition)
    }

    /// Poll until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// Shutdown is observed between cycles; an in-flight request finishes
    /// (bounded by its timeout) first.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            "bot gateway started"
        );

        while !*shutdown.borrow() {
            let pause = match self.poll_once().await {
                Ok(report) => {
                    if report.updates > 0 {
                        debug!(
                            updates = report.updates,
                            changed = report.changed,
                            cursor = self.cursor.value(),
                            "poll cycle"
                        );
                    }
                    self.settings.poll_interval
                }
                Err(e) => {
                    warn!(
                        cursor = self.cursor.value(),
                        error = %e,
                        backoff_secs = self.settings.error_backoff.as_secs(),
                        "poll cycle failed"
                    );
                    self.settings.error_backoff
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = tokio::time::sleep(pause) => {}
            }
        }

        info!(cursor = self.cursor.value(), "bot gateway stopped");
    }
}

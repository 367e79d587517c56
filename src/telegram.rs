//! Telegram Bot API client.
//!
//! Inbound `getUpdates` goes through raw `reqwest` so the response can be
//! parsed defensively (proxies and gateways sometimes answer with HTML).
//! Outbound `sendMessage` uses a teloxide [`Bot`]. Both sit behind the
//! [`MessagingApi`] trait so the gateway and dispatcher can be exercised
//! without a network.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use teloxide::prelude::*;
use teloxide::types::{ParseMode, Recipient};
use thiserror::Error;
use tracing::debug;

/// Extra seconds added to the HTTP timeout beyond the long-poll timeout,
/// so the socket stays open while Telegram holds the request.
const POLL_TIMEOUT_MARGIN_SECS: u64 = 10;

/// Maximum number of body bytes quoted in error messages.
const BODY_SNIPPET_LEN: usize = 200;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Messaging API errors.
#[derive(Debug, Error)]
pub enum TelegramError {
    /// HTTP transport error (connect, timeout, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("HTTP status {status}: {body}")]
    Status {
        /// Response status code.
        status: u16,
        /// Leading part of the response body.
        body: String,
    },
    /// The Bot API answered `ok: false`.
    #[error("Telegram API error: {0}")]
    Api(String),
    /// The response was not a well-formed Bot API payload.
    #[error("malformed response: {0}")]
    Parse(String),
    /// `sendMessage` failed.
    #[error("send failed: {0}")]
    Send(#[from] teloxide::RequestError),
    /// `sendMessage` did not complete within the send timeout.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    /// The recipient is neither a numeric chat id nor an `@username`.
    #[error("invalid chat id '{0}'")]
    InvalidChat(String),
}

// ---------------------------------------------------------------------------
// Normalized inbound types
// ---------------------------------------------------------------------------

/// One inbound update, reduced to what the gateway uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundUpdate {
    /// Monotonic update id assigned by Telegram.
    pub id: i64,
    /// The message carried by the update, if it was a well-formed message.
    pub message: Option<InboundMessage>,
}

/// A chat message carried by an [`InboundUpdate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Chat the message was sent in. Positive for personal chats.
    pub chat_id: i64,
    /// Message text, absent for stickers, photos and the like.
    pub text: Option<String>,
    /// Sender's first name as exposed on the chat.
    pub first_name: Option<String>,
    /// Sender's username as exposed on the chat.
    pub username: Option<String>,
}

/// Updates from one `getUpdates` call.
///
/// When the response holds an entry without a usable `update_id`, only the
/// entries before it are kept and `malformed` carries the parse error.
#[derive(Debug, Default)]
pub struct UpdateBatch {
    /// Well-formed updates, in response order.
    pub updates: Vec<InboundUpdate>,
    /// Why the batch was cut short, if it was.
    pub malformed: Option<TelegramError>,
}

impl From<Vec<InboundUpdate>> for UpdateBatch {
    fn from(updates: Vec<InboundUpdate>) -> Self {
        Self {
            updates,
            malformed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// The two Bot API calls logsentinel needs.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    /// Fetch updates with ids strictly greater than `after_id`.
    async fn get_updates(&self, after_id: i64) -> Result<UpdateBatch, TelegramError>;

    /// Send an HTML-formatted text message to a chat id or `@username`.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), TelegramError>;
}

// ---------------------------------------------------------------------------
// Bot API wire types (minimal subset)
// ---------------------------------------------------------------------------

/// Generic Bot API response wrapper.
#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// Telegram `Message` object (subset of fields we use).
#[derive(Debug, Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    text: Option<String>,
}

/// Telegram `Chat` object.
#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    first_name: Option<String>,
    username: Option<String>,
}

/// Parse a `getUpdates` response body.
///
/// Entries are read in order up to the first one without an integer
/// `update_id`; that entry and everything after it are left out and the
/// batch is marked malformed. An update whose `message` is malformed is
/// kept with `message: None` so its id is still consumed.
///
/// # Errors
///
/// Returns [`TelegramError::Parse`] for non-JSON bodies and
/// [`TelegramError::Api`] when the API reports `ok: false`.
pub fn parse_updates(body: &str) -> Result<UpdateBatch, TelegramError> {
    let response: TelegramResponse<Vec<serde_json::Value>> = serde_json::from_str(body)
        .map_err(|e| TelegramError::Parse(format!("{e}; body starts with {:?}", snippet(body))))?;

    if !response.ok {
        return Err(TelegramError::Api(
            response
                .description
                .unwrap_or_else(|| "unknown error".to_owned()),
        ));
    }

    let mut batch = UpdateBatch::default();
    for raw in response.result.unwrap_or_default() {
        match normalize_update(raw) {
            Ok(update) => batch.updates.push(update),
            Err(e) => {
                batch.malformed = Some(e);
                break;
            }
        }
    }
    Ok(batch)
}

fn normalize_update(raw: serde_json::Value) -> Result<InboundUpdate, TelegramError> {
    let id = raw
        .get("update_id")
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| TelegramError::Parse("update without integer update_id".to_owned()))?;

    let message = raw
        .get("message")
        .cloned()
        .and_then(|m| serde_json::from_value::<TelegramMessage>(m).ok())
        .map(|m| InboundMessage {
            chat_id: m.chat.id,
            text: m.text,
            first_name: m.chat.first_name,
            username: m.chat.username,
        });

    Ok(InboundUpdate { id, message })
}

fn snippet(body: &str) -> String {
    body.chars().take(BODY_SNIPPET_LEN).collect()
}

/// Resolve a configured chat string into a teloxide recipient.
fn recipient(chat_id: &str) -> Result<Recipient, TelegramError> {
    if chat_id.starts_with('@') {
        return Ok(Recipient::ChannelUsername(chat_id.to_owned()));
    }
    chat_id
        .parse::<i64>()
        .map(|id| Recipient::Id(ChatId(id)))
        .map_err(|_| TelegramError::InvalidChat(chat_id.to_owned()))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// [`MessagingApi`] implementation talking to the Telegram Bot API.
pub struct TelegramClient {
    client: reqwest::Client,
    bot: Bot,
    api_base: url::Url,
    token: String,
    long_poll_timeout_secs: u32,
    send_timeout: Duration,
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The token is a credential; keep it out of logs.
        f.debug_struct("TelegramClient")
            .field("api_base", &self.api_base.as_str())
            .field("long_poll_timeout_secs", &self.long_poll_timeout_secs)
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

impl TelegramClient {
    /// Create a client for the given bot token.
    ///
    /// `send_timeout` bounds each `sendMessage` request; `getUpdates` uses
    /// the long-poll timeout plus a margin.
    ///
    /// # Errors
    ///
    /// Returns an error if `api_base` is not a URL.
    pub fn new(
        token: &str,
        api_base: &str,
        long_poll_timeout_secs: u32,
        send_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let api_base = url::Url::parse(api_base)
            .map_err(|e| anyhow::anyhow!("invalid Telegram API base '{api_base}': {e}"))?;

        let bot = Bot::new(token).set_api_url(api_base.clone());

        Ok(Self {
            client: reqwest::Client::new(),
            bot,
            api_base,
            token: token.to_owned(),
            long_poll_timeout_secs,
            send_timeout,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base.as_str().trim_end_matches('/'),
            self.token
        )
    }
}

#[async_trait]
impl MessagingApi for TelegramClient {
    async fn get_updates(&self, after_id: i64) -> Result<UpdateBatch, TelegramError> {
        let params = serde_json::json!({
            "offset": after_id.saturating_add(1),
            "timeout": self.long_poll_timeout_secs,
            "allowed_updates": ["message"],
        });

        let http_timeout_secs =
            u64::from(self.long_poll_timeout_secs).saturating_add(POLL_TIMEOUT_MARGIN_SECS);

        let resp = self
            .client
            .post(self.method_url("getUpdates"))
            .json(&params)
            .timeout(Duration::from_secs(http_timeout_secs))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(TelegramError::Status {
                status: status.as_u16(),
                body: snippet(&body),
            });
        }

        parse_updates(&body)
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), TelegramError> {
        let to = recipient(chat_id)?;
        let request = self.bot.send_message(to, text).parse_mode(ParseMode::Html);
        tokio::time::timeout(self.send_timeout, request.send())
            .await
            .map_err(|_| TelegramError::Timeout(self.send_timeout))??;
        debug!(chat_id, "sent Telegram message");
        Ok(())
    }
}

/// Escape text for Telegram's HTML parse mode.
pub fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

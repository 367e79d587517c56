//! Chat delivery over the messaging API.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::retry::RetryPolicy;
use super::{Channel, ChannelKind, DeliveryOutcome};
use crate::db::{ErrorRecord, StateDb};
use crate::telegram::{html_escape, MessagingApi};

/// Sends each error to the direct chat (if configured) and every active
/// subscriber, concurrently, each with its own retry budget.
pub struct ChatChannel {
    api: Arc<dyn MessagingApi>,
    db: StateDb,
    direct_chat: Option<String>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ChatChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatChannel")
            .field("direct_chat", &self.direct_chat)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ChatChannel {
    /// Create a chat channel.
    pub fn new(
        api: Arc<dyn MessagingApi>,
        db: StateDb,
        direct_chat: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            api,
            db,
            direct_chat,
            retry,
        }
    }

    /// The direct chat plus all active subscribers, without duplicates.
    ///
    /// A store failure is logged and leaves only the direct chat.
    pub async fn recipients(&self) -> Vec<String> {
        let mut recipients: Vec<String> = self.direct_chat.iter().cloned().collect();
        match self.db.list_active_subscribers().await {
            Ok(subscribers) => {
                for subscriber in subscribers {
                    let chat_id = subscriber.chat_id.to_string();
                    if !recipients.contains(&chat_id) {
                        recipients.push(chat_id);
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to load subscribers, sending to direct chat only"),
        }
        recipients
    }

    /// Send `text` to every recipient concurrently. Returns
    /// `(succeeded, attempted)`.
    pub async fn broadcast_text(&self, text: &str, error_id: Option<i64>) -> (usize, usize) {
        let recipients = self.recipients().await;
        let attempted = recipients.len();
        let text: Arc<str> = Arc::from(text);

        let mut sends = JoinSet::new();
        for chat_id in recipients {
            let api = Arc::clone(&self.api);
            let text = Arc::clone(&text);
            let retry = self.retry;
            sends.spawn(async move {
                let result = retry
                    .run(&chat_id, |_| api.send_message(&chat_id, &text))
                    .await;
                (chat_id, result)
            });
        }

        let mut succeeded: usize = 0;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(()))) => succeeded = succeeded.saturating_add(1),
                Ok((chat_id, Err(e))) => warn!(
                    chat_id = %chat_id,
                    error_id,
                    attempts = self.retry.max_attempts,
                    error = %e,
                    "chat delivery exhausted"
                ),
                Err(e) => warn!(error = %e, "chat delivery task failed"),
            }
        }
        (succeeded, attempted)
    }
}

#[async_trait]
impl Channel for ChatChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Chat
    }

    async fn deliver(&self, record: &ErrorRecord) -> DeliveryOutcome {
        let text = format_message(record);
        let (succeeded, attempted) = self.broadcast_text(&text, Some(record.id)).await;

        if attempted == 0 {
            return DeliveryOutcome::NoRecipients;
        }
        if succeeded == 0 {
            return DeliveryOutcome::Failed { attempted };
        }
        info!(error_id = record.id, succeeded, attempted, "chat notification sent");
        DeliveryOutcome::Delivered {
            succeeded,
            attempted,
        }
    }
}

/// Render an error as an HTML chat message: file, timestamp and content.
pub fn format_message(record: &ErrorRecord) -> String {
    format!(
        "<b>Error detected</b>\n\n<b>File:</b> {file}\n<b>Time:</b> {time}\n\n<pre>{content}</pre>",
        file = html_escape(&record.file_path.display().to_string()),
        time = record.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        content = html_escape(&record.content),
    )
}

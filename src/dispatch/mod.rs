//! Notification fan-out.
//!
//! Every newly recorded error is offered to each enabled [`Channel`]
//! independently. A channel that reaches at least one recipient gets its
//! sent flag set on the error's notification record; failures are logged
//! and never reach the tailer.

pub mod chat;
pub mod live;
pub mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::db::{ErrorRecord, StateDb};

pub use self::chat::ChatChannel;
pub use self::live::LiveFeed;
pub use self::retry::RetryPolicy;

/// Which notification flag a channel owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// In-process live push.
    Live,
    /// Chat messages via the messaging API.
    Chat,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => f.write_str("live"),
            Self::Chat => f.write_str("chat"),
        }
    }
}

/// Result of offering one error to one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// At least one recipient received it.
    Delivered {
        /// Recipients that received it.
        succeeded: usize,
        /// Recipients tried.
        attempted: usize,
    },
    /// Every recipient failed.
    Failed {
        /// Recipients tried.
        attempted: usize,
    },
    /// Nobody to deliver to.
    NoRecipients,
}

impl DeliveryOutcome {
    /// Whether the channel's sent flag should be set.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// A delivery path for new errors.
#[async_trait]
pub trait Channel: Send + Sync {
    /// The flag this channel sets when delivery succeeds.
    fn kind(&self) -> ChannelKind;

    /// Deliver one error. Must not panic or propagate failures.
    async fn deliver(&self, record: &ErrorRecord) -> DeliveryOutcome;
}

/// Offers each new error to every registered channel.
pub struct Dispatcher {
    db: StateDb,
    channels: Vec<Arc<dyn Channel>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<ChannelKind> = self.channels.iter().map(|c| c.kind()).collect();
        f.debug_struct("Dispatcher")
            .field("channels", &kinds)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher with no channels.
    pub fn new(db: StateDb) -> Self {
        Self {
            db,
            channels: Vec::new(),
        }
    }

    /// Register a channel.
    #[must_use]
    pub fn with_channel(mut self, channel: Arc<dyn Channel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Number of registered channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Deliver one error over every channel concurrently and record which
    /// channels succeeded.
    pub async fn notify(&self, record: &ErrorRecord) -> Vec<(ChannelKind, DeliveryOutcome)> {
        let mut deliveries = JoinSet::new();
        for channel in &self.channels {
            let channel = Arc::clone(channel);
            let record = record.clone();
            deliveries.spawn(async move {
                let outcome = channel.deliver(&record).await;
                (channel.kind(), outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(self.channels.len());
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((kind, outcome)) => {
                    self.record_outcome(record.id, kind, outcome).await;
                    outcomes.push((kind, outcome));
                }
                Err(e) => error!(error_id = record.id, error = %e, "delivery task panicked"),
            }
        }
        outcomes
    }

    async fn record_outcome(&self, error_id: i64, kind: ChannelKind, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered { .. } => {
                let marked = match kind {
                    ChannelKind::Live => self.db.mark_live_sent(error_id).await,
                    ChannelKind::Chat => self.db.mark_chat_sent(error_id).await,
                };
                if let Err(e) = marked {
                    warn!(error_id, channel = %kind, error = %e, "failed to record delivery");
                }
            }
            DeliveryOutcome::Failed { attempted } => {
                warn!(error_id, channel = %kind, attempted, "delivery failed for every recipient");
            }
            DeliveryOutcome::NoRecipients => {
                debug!(error_id, channel = %kind, "no recipients");
            }
        }
    }

    /// Consume errors from `queue` until every sender is dropped, handling
    /// each on its own task, then wait for in-flight deliveries.
    pub async fn run(self: Arc<Self>, mut queue: mpsc::Receiver<ErrorRecord>) {
        info!(channels = self.channels.len(), "dispatcher started");
        let mut in_flight = JoinSet::new();

        while let Some(record) = queue.recv().await {
            let dispatcher = Arc::clone(&self);
            in_flight.spawn(async move {
                dispatcher.notify(&record).await;
            });
            while let Some(done) = in_flight.try_join_next() {
                if let Err(e) = done {
                    error!(error = %e, "notification task panicked");
                }
            }
        }

        while let Some(done) = in_flight.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "notification task panicked");
            }
        }
        info!("dispatcher drained");
    }
}

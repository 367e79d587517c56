//! In-process live feed of new errors.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Channel, ChannelKind, DeliveryOutcome};
use crate::db::ErrorRecord;

/// Fire-and-forget broadcast to whoever is listening right now.
///
/// Listeners that fall behind lose the oldest records; nothing is retried.
#[derive(Debug, Clone)]
pub struct LiveFeed {
    tx: broadcast::Sender<ErrorRecord>,
}

impl LiveFeed {
    /// Create a feed that buffers up to `capacity` records per listener.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Attach a new listener. It only sees records sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorRecord> {
        self.tx.subscribe()
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Push a record to every current listener. Returns how many received it.
    pub fn broadcast(&self, record: &ErrorRecord) -> usize {
        self.tx.send(record.clone()).unwrap_or(0)
    }
}

#[async_trait]
impl Channel for LiveFeed {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Live
    }

    async fn deliver(&self, record: &ErrorRecord) -> DeliveryOutcome {
        match self.broadcast(record) {
            0 => {
                debug!(error_id = record.id, "no live listeners");
                DeliveryOutcome::NoRecipients
            }
            listeners => DeliveryOutcome::Delivered {
                succeeded: listeners,
                attempted: listeners,
            },
        }
    }
}

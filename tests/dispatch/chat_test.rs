//! Chat channel recipients and per-recipient retry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use logsentinel::db::{ErrorRecord, StateDb};
use logsentinel::dispatch::{ChatChannel, Channel, ChannelKind, DeliveryOutcome, RetryPolicy};

use crate::fake_api::FakeApi;

const FAST_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    base_delay: Duration::from_millis(40),
};

async fn setup_db() -> (tempfile::TempDir, StateDb) {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let db = StateDb::open(&dir.path().join("state.db"))
        .await
        .expect("state db should open");
    (dir, db)
}

fn sample_record() -> ErrorRecord {
    ErrorRecord {
        id: 1,
        file_path: PathBuf::from("/var/log/app.log"),
        offset: 22,
        content: "2024-01-01 [ERR] boom".to_owned(),
        content_hash: "h".to_owned(),
        created_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn delivers_to_direct_chat_and_active_subscribers() {
    let (_dir, db) = setup_db().await;
    db.upsert_subscriber(11, None, None, true).await.expect("upsert");
    db.upsert_subscriber(12, None, None, true).await.expect("upsert");
    db.upsert_subscriber(13, None, None, false).await.expect("upsert");

    let api = Arc::new(FakeApi::new());
    let channel = ChatChannel::new(api.clone(), db, Some("@ops".to_owned()), FAST_RETRY);
    assert_eq!(channel.kind(), ChannelKind::Chat);

    let outcome = channel.deliver(&sample_record()).await;
    assert_eq!(
        outcome,
        DeliveryOutcome::Delivered {
            succeeded: 3,
            attempted: 3
        }
    );

    let mut recipients: Vec<String> = api.sent().into_iter().map(|(chat, _)| chat).collect();
    recipients.sort();
    assert_eq!(recipients, vec!["11", "12", "@ops"]);

    let text = &api.sent_to("11")[0];
    assert!(text.contains("/var/log/app.log"));
    assert!(text.contains("[ERR] boom"));
}

#[tokio::test]
async fn direct_chat_that_is_also_a_subscriber_gets_one_message() {
    let (_dir, db) = setup_db().await;
    db.upsert_subscriber(11, None, None, true).await.expect("upsert");

    let api = Arc::new(FakeApi::new());
    let channel = ChatChannel::new(api.clone(), db, Some("11".to_owned()), FAST_RETRY);
    channel.deliver(&sample_record()).await;

    assert_eq!(api.sent_to("11").len(), 1);
}

#[tokio::test]
async fn no_recipients_is_reported() {
    let (_dir, db) = setup_db().await;
    let api = Arc::new(FakeApi::new());
    let channel = ChatChannel::new(api.clone(), db, None, FAST_RETRY);

    assert_eq!(
        channel.deliver(&sample_record()).await,
        DeliveryOutcome::NoRecipients
    );
    assert!(api.sent().is_empty());
}

#[tokio::test]
async fn failing_recipient_gets_three_attempts_with_doubling_gaps() {
    let (_dir, db) = setup_db().await;
    db.upsert_subscriber(11, None, None, true).await.expect("upsert");
    db.upsert_subscriber(12, None, None, true).await.expect("upsert");

    let api = Arc::new(FakeApi::new());
    api.fail_chat("12");
    let channel = ChatChannel::new(api.clone(), db, None, FAST_RETRY);

    let outcome = channel.deliver(&sample_record()).await;
    assert_eq!(
        outcome,
        DeliveryOutcome::Delivered {
            succeeded: 1,
            attempted: 2
        }
    );

    let attempts = api.attempts_for("12");
    assert_eq!(attempts.len(), 3);
    let first_gap = attempts[1].duration_since(attempts[0]);
    let second_gap = attempts[2].duration_since(attempts[1]);
    assert!(first_gap >= Duration::from_millis(40), "gap was {first_gap:?}");
    assert!(second_gap >= Duration::from_millis(80), "gap was {second_gap:?}");

    // The healthy recipient was not held back by the failing one.
    let ok_attempts = api.attempts_for("11");
    assert_eq!(ok_attempts.len(), 1);
    assert!(ok_attempts[0] <= attempts[1]);
}

#[tokio::test]
async fn every_recipient_failing_is_failed() {
    let (_dir, db) = setup_db().await;
    db.upsert_subscriber(11, None, None, true).await.expect("upsert");

    let api = Arc::new(FakeApi::new());
    api.fail_chat("11");
    let channel = ChatChannel::new(api.clone(), db, None, FAST_RETRY);

    assert_eq!(
        channel.deliver(&sample_record()).await,
        DeliveryOutcome::Failed { attempted: 1 }
    );
    assert_eq!(api.attempts_for("11").len(), 3);
}

//! Poll cycles: cursor handling and the subscriber state machine.

use std::sync::Arc;

use logsentinel::db::StateDb;
use logsentinel::gateway::{BotGateway, Command, GatewaySettings, Transition};
use logsentinel::telegram::{InboundMessage, InboundUpdate, TelegramError};

use crate::fake_api::{text_update, FakeApi};

async fn setup() -> (tempfile::TempDir, StateDb, Arc<FakeApi>, BotGateway) {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let db = StateDb::open(&dir.path().join("state.db"))
        .await
        .expect("state db should open");
    let api = Arc::new(FakeApi::new());
    let gateway = BotGateway::new(api.clone(), db.clone(), GatewaySettings::default());
    (dir, db, api, gateway)
}

#[tokio::test]
async fn subscribe_creates_active_subscriber_and_replies() {
    let (_dir, db, api, mut gateway) = setup().await;
    api.push_batch(Ok(vec![text_update(1, 42, "/subscribe")]));

    let report = gateway.poll_once().await.expect("poll");
    assert_eq!(report.updates, 1);
    assert_eq!(report.changed, 1);
    assert_eq!(gateway.cursor().value(), 1);

    let s = db.find_subscriber(42).await.expect("find").expect("exists");
    assert!(s.active);
    assert_eq!(s.display_name.as_deref(), Some("Ada"));
    assert_eq!(s.username.as_deref(), Some("ada"));

    assert_eq!(api.sent_to("42").len(), 1);
}

#[tokio::test]
async fn unsubscribe_from_unknown_chat_changes_nothing() {
    let (_dir, db, api, mut gateway) = setup().await;
    api.push_batch(Ok(vec![text_update(5, 42, "/unsubscribe")]));

    let report = gateway.poll_once().await.expect("poll must not fail");
    assert_eq!(report.changed, 0);
    assert_eq!(gateway.cursor().value(), 5);
    assert!(db.find_subscriber(42).await.expect("find").is_none());
    assert!(api.sent().is_empty());
}

#[tokio::test]
async fn full_subscription_lifecycle() {
    let (_dir, db, api, mut gateway) = setup().await;
    api.push_batch(Ok(vec![
        text_update(1, 42, "/subscribe"),
        text_update(2, 42, "/subscribe"),
        text_update(3, 42, "/unsubscribe"),
        text_update(4, 42, "/unsubscribe"),
    ]));

    let report = gateway.poll_once().await.expect("poll");
    // Created and Deactivated change state; the repeats are no-ops.
    assert_eq!(report.changed, 2);
    let s = db.find_subscriber(42).await.expect("find").expect("exists");
    assert!(!s.active);
    assert!(db.list_active_subscribers().await.expect("list").is_empty());

    api.push_batch(Ok(vec![text_update(5, 42, "/subscribe@log_sentinel_bot")]));
    gateway.poll_once().await.expect("poll");
    let again = db.find_subscriber(42).await.expect("find").expect("exists");
    assert!(again.active);
    assert!(again.subscribed_at >= s.subscribed_at);
}

#[tokio::test]
async fn apply_reports_state_machine_transitions() {
    let (_dir, _db, _api, gateway) = setup().await;
    let msg = InboundMessage {
        chat_id: 77,
        text: None,
        first_name: None,
        username: None,
    };

    let steps = [
        (Command::Unsubscribe, Transition::Unknown),
        (Command::Subscribe, Transition::Created),
        (Command::Subscribe, Transition::AlreadyActive),
        (Command::Unsubscribe, Transition::Deactivated),
        (Command::Unsubscribe, Transition::AlreadyInactive),
        (Command::Subscribe, Transition::Reactivated),
    ];
    for (command, expected) in steps {
        let got = gateway.apply(&msg, command).await.expect("apply");
        assert_eq!(got, expected, "after {command:?}");
    }
}

#[tokio::test]
async fn ignored_updates_still_advance_cursor() {
    let (_dir, db, api, mut gateway) = setup().await;
    api.push_batch(Ok(vec![
        // Group chat.
        text_update(10, -100_500, "/subscribe"),
        // Not a command we know.
        text_update(11, 42, "/start"),
        // No text.
        InboundUpdate {
            id: 12,
            message: Some(InboundMessage {
                chat_id: 42,
                text: None,
                first_name: None,
                username: None,
            }),
        },
        // No message at all.
        InboundUpdate {
            id: 13,
            message: None,
        },
    ]));

    let report = gateway.poll_once().await.expect("poll");
    assert_eq!(report.updates, 4);
    assert_eq!(report.changed, 0);
    assert_eq!(gateway.cursor().value(), 13);
    assert!(db.find_subscriber(-100_500).await.expect("find").is_none());
    assert!(db.find_subscriber(42).await.expect("find").is_none());
}

#[tokio::test]
async fn cursor_is_monotonic_across_cycles() {
    let (_dir, _db, api, mut gateway) = setup().await;
    api.push_batch(Ok(vec![
        text_update(5, 1, "hello"),
        text_update(3, 1, "late"),
    ]));
    api.push_batch(Ok(vec![text_update(7, 1, "again")]));
    api.push_batch(Ok(Vec::new()));

    gateway.poll_once().await.expect("poll");
    assert_eq!(gateway.cursor().value(), 5);
    gateway.poll_once().await.expect("poll");
    gateway.poll_once().await.expect("poll");

    assert_eq!(api.requested_after(), vec![0, 5, 7]);
}

#[tokio::test]
async fn malformed_response_keeps_cursor() {
    let (_dir, _db, api, mut gateway) = setup().await;
    api.push_batch(Ok(vec![text_update(4, 1, "hi")]));
    api.push_batch(Err(TelegramError::Parse(
        "expected value at line 1 column 1".to_owned(),
    )));
    api.push_batch(Ok(vec![text_update(5, 1, "hi")]));

    gateway.poll_once().await.expect("poll");
    assert!(matches!(
        gateway.poll_once().await,
        Err(TelegramError::Parse(_))
    ));
    assert_eq!(gateway.cursor().value(), 4);

    gateway.poll_once().await.expect("poll");
    assert_eq!(api.requested_after(), vec![0, 4, 4]);
    assert_eq!(gateway.cursor().value(), 5);
}

#[tokio::test]
async fn updates_before_a_malformed_entry_are_applied() {
    let (_dir, db, api, mut gateway) = setup().await;
    api.push_truncated(
        vec![text_update(5, 42, "/subscribe")],
        TelegramError::Parse("update without integer update_id".to_owned()),
    );
    api.push_batch(Ok(vec![text_update(6, 42, "/unsubscribe")]));

    assert!(matches!(
        gateway.poll_once().await,
        Err(TelegramError::Parse(_))
    ));
    assert_eq!(gateway.cursor().value(), 5);
    let subscriber = db
        .find_subscriber(42)
        .await
        .expect("find")
        .expect("subscribe ahead of the bad entry must be applied");
    assert!(subscriber.active);

    gateway.poll_once().await.expect("poll");
    assert_eq!(api.requested_after(), vec![0, 5]);
    assert!(!db.find_subscriber(42).await.expect("find").expect("row").active);
}

#[tokio::test]
async fn replies_can_be_disabled() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let db = StateDb::open(&dir.path().join("state.db"))
        .await
        .expect("state db should open");
    let api = Arc::new(FakeApi::new());
    let settings = GatewaySettings {
        reply_to_commands: false,
        ..GatewaySettings::default()
    };
    let mut gateway = BotGateway::new(api.clone(), db.clone(), settings);

    api.push_batch(Ok(vec![text_update(1, 42, "/subscribe")]));
    gateway.poll_once().await.expect("poll");

    assert!(db.find_subscriber(42).await.expect("find").is_some());
    assert!(api.sent().is_empty());
}

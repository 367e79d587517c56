//! The long-running poll loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use logsentinel::db::StateDb;
use logsentinel::gateway::{BotGateway, GatewaySettings};
use logsentinel::telegram::TelegramError;

use crate::fake_api::{text_update, FakeApi};

fn fast_settings() -> GatewaySettings {
    GatewaySettings {
        poll_interval: Duration::from_millis(10),
        error_backoff: Duration::from_millis(20),
        reply_to_commands: false,
    }
}

#[tokio::test]
async fn loop_survives_errors_and_stops_on_shutdown() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let db = StateDb::open(&dir.path().join("state.db"))
        .await
        .expect("state db should open");
    let api = Arc::new(FakeApi::new());
    api.push_batch(Err(TelegramError::Api("Bad Gateway".to_owned())));
    api.push_batch(Ok(vec![text_update(9, 42, "/subscribe")]));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = BotGateway::new(api.clone(), db.clone(), fast_settings());
    let handle = tokio::spawn(gateway.run(shutdown_rx));

    // Wait until the second batch has been applied.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if db
                .find_subscriber(42)
                .await
                .expect("find")
                .is_some_and(|s| s.active)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber should appear after the failed cycle");

    shutdown_tx.send(true).expect("gateway should be listening");
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("gateway should stop at the cycle boundary")
        .expect("gateway task");

    let requested = api.requested_after();
    assert_eq!(requested[0], 0);
    assert_eq!(requested[1], 0, "failed cycle must not move the cursor");
    assert!(requested.iter().skip(2).all(|&after| after == 9));
}

#[tokio::test]
async fn dropping_the_shutdown_sender_stops_the_loop() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let db = StateDb::open(&dir.path().join("state.db"))
        .await
        .expect("state db should open");
    let api = Arc::new(FakeApi::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(BotGateway::new(api, db, fast_settings()).run(shutdown_rx));
    drop(shutdown_tx);

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("gateway should stop")
        .expect("gateway task");
}

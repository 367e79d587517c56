//! Subscriber upsert and listing.

use logsentinel::db::StateDb;

async fn setup_db() -> (tempfile::TempDir, StateDb) {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let db = StateDb::open(&dir.path().join("state.db"))
        .await
        .expect("state db should open");
    (dir, db)
}

#[tokio::test]
async fn upsert_then_find() {
    let (_dir, db) = setup_db().await;
    db.upsert_subscriber(42, Some("Ada"), Some("ada"), true)
        .await
        .expect("upsert");

    let s = db.find_subscriber(42).await.expect("find").expect("exists");
    assert_eq!(s.chat_id, 42);
    assert_eq!(s.display_name.as_deref(), Some("Ada"));
    assert_eq!(s.username.as_deref(), Some("ada"));
    assert!(s.active);

    assert!(db.find_subscriber(43).await.expect("find").is_none());
}

#[tokio::test]
async fn deactivate_keeps_names_and_timestamp() {
    let (_dir, db) = setup_db().await;
    db.upsert_subscriber(42, Some("Ada"), None, true)
        .await
        .expect("upsert");
    let before = db.find_subscriber(42).await.expect("find").expect("exists");

    db.upsert_subscriber(42, None, None, false)
        .await
        .expect("deactivate");
    let after = db.find_subscriber(42).await.expect("find").expect("exists");

    assert!(!after.active);
    assert_eq!(after.display_name.as_deref(), Some("Ada"));
    assert_eq!(after.subscribed_at, before.subscribed_at);
}

#[tokio::test]
async fn reactivation_restamps_subscribed_at() {
    let (_dir, db) = setup_db().await;
    db.upsert_subscriber(42, Some("Ada"), None, true)
        .await
        .expect("upsert");
    let first = db.find_subscriber(42).await.expect("find").expect("exists");
    db.upsert_subscriber(42, None, None, false)
        .await
        .expect("deactivate");

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    db.upsert_subscriber(42, None, None, true)
        .await
        .expect("reactivate");
    let again = db.find_subscriber(42).await.expect("find").expect("exists");

    assert!(again.active);
    assert!(again.subscribed_at > first.subscribed_at);
}

#[tokio::test]
async fn active_list_excludes_inactive_and_group_chats() {
    let (_dir, db) = setup_db().await;
    db.upsert_subscriber(3, None, None, true).await.expect("upsert");
    db.upsert_subscriber(1, None, None, true).await.expect("upsert");
    db.upsert_subscriber(2, None, None, false).await.expect("upsert");
    db.upsert_subscriber(-100_500, None, None, true)
        .await
        .expect("upsert");

    let ids: Vec<i64> = db
        .list_active_subscribers()
        .await
        .expect("list")
        .into_iter()
        .map(|s| s.chat_id)
        .collect();
    assert_eq!(ids, vec![1, 3]);
}

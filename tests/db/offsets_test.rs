//! File offset persistence.

use std::path::{Path, PathBuf};

use logsentinel::db::StateDb;

#[tokio::test]
async fn unknown_file_starts_at_zero() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let db = StateDb::open(&dir.path().join("state.db"))
        .await
        .expect("open");
    assert_eq!(
        db.get_offset(Path::new("/never/seen.log")).await.expect("get"),
        0
    );
}

#[tokio::test]
async fn offsets_survive_reopen() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let db_path = dir.path().join("nested").join("state.db");

    {
        let db = StateDb::open(&db_path).await.expect("open");
        db.save_offset(Path::new("/logs/a.log"), 128)
            .await
            .expect("save");
        db.save_offset(Path::new("/logs/a.log"), 256)
            .await
            .expect("save");
        db.save_offset(Path::new("/logs/b.log"), 7)
            .await
            .expect("save");
    }

    let db = StateDb::open(&db_path).await.expect("reopen");
    let offsets = db.load_offsets().await.expect("load");
    assert_eq!(offsets.len(), 2);
    assert_eq!(offsets.get(&PathBuf::from("/logs/a.log")), Some(&256));
    assert_eq!(offsets.get(&PathBuf::from("/logs/b.log")), Some(&7));
}

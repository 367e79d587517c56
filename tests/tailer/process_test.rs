//! File passes: offsets, dedup and truncation handling.

use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use logsentinel::db::{ErrorRecord, StateDb};
use logsentinel::matcher::PatternMatcher;
use logsentinel::tailer::{process_file, OffsetCache, TailContext, Tailer, TailerError};

struct Fixture {
    _state: tempfile::TempDir,
    logs: tempfile::TempDir,
    db: StateDb,
}

impl Fixture {
    async fn new() -> Self {
        let state = tempfile::tempdir().expect("state dir");
        let logs = tempfile::tempdir().expect("logs dir");
        let db = StateDb::open(&state.path().join("state.db"))
            .await
            .expect("open");
        Self {
            _state: state,
            logs,
            db,
        }
    }

    fn log_path(&self, name: &str) -> PathBuf {
        // Canonical, so paths match what the tailer stores.
        std::fs::canonicalize(self.logs.path())
            .expect("canonicalize")
            .join(name)
    }

    fn append(&self, name: &str, text: &str) -> PathBuf {
        let path = self.log_path(name);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .expect("open log");
        file.write_all(text.as_bytes()).expect("write log");
        path
    }

    fn context(&self, sink: Option<mpsc::Sender<ErrorRecord>>) -> TailContext {
        TailContext {
            db: self.db.clone(),
            offsets: OffsetCache::new(self.db.clone()),
            matcher: PatternMatcher::new(&["ERR"]),
            sink,
        }
    }

    fn tailer(&self) -> Tailer {
        Tailer::new(self.db.clone(), PatternMatcher::new(&["ERR"]), None)
    }
}

#[tokio::test]
async fn appended_error_recorded_at_offset_after_line() {
    let fx = Fixture::new().await;
    let path = fx.append("app.log", "");
    let (tx, mut rx) = mpsc::channel(8);
    let ctx = fx.context(Some(tx));

    fx.append("app.log", "2024-01-01 [ERR] boom\n");
    let pass = process_file(&ctx, &path).await.expect("pass");

    assert_eq!(pass.created, 1);
    assert_eq!(pass.end_offset, 22);

    let record = rx.try_recv().expect("record should be queued for delivery");
    assert_eq!(record.offset, 22);
    assert_eq!(record.content, "2024-01-01 [ERR] boom");
    assert_eq!(record.file_path, path);

    let notification = fx
        .db
        .notification_for_error(record.id)
        .await
        .expect("query")
        .expect("notification created with the error");
    assert!(!notification.chat_sent);
    assert_eq!(fx.db.get_offset(&path).await.expect("offset"), 22);
}

#[tokio::test]
async fn repeated_line_is_not_recorded_again() {
    let fx = Fixture::new().await;
    let (tx, mut rx) = mpsc::channel(8);
    let ctx = fx.context(Some(tx));

    let path = fx.append("app.log", "2024-01-01 [ERR] boom\n");
    process_file(&ctx, &path).await.expect("first pass");
    rx.try_recv().expect("first record");

    fx.append("app.log", "info: recovered\n2024-01-01 [ERR] boom\n");
    let pass = process_file(&ctx, &path).await.expect("second pass");

    assert_eq!(pass.detected, 1);
    assert_eq!(pass.created, 0);
    assert!(rx.try_recv().is_err(), "duplicate must not be delivered");
    assert_eq!(fx.db.error_count().await.expect("count"), 1);
    assert_eq!(fx.db.recent_notifications(10).await.expect("list").len(), 1);
}

#[tokio::test]
async fn offset_counts_utf8_bytes_and_terminators() {
    let fx = Fixture::new().await;
    let ctx = fx.context(None);

    // "ok\n" = 3 bytes, "ошибка ERR\n" = 12 + 1 + 3 + 1 = 17 bytes.
    let path = fx.append("app.log", "ok\nошибка ERR\n");
    let pass = process_file(&ctx, &path).await.expect("pass");
    assert_eq!(pass.lines, 2);
    assert_eq!(pass.end_offset, 20);

    let errors = fx.db.recent_errors(1).await.expect("list");
    assert_eq!(errors[0].offset, 20);
    assert_eq!(errors[0].content, "ошибка ERR");
}

#[tokio::test]
async fn crlf_is_stripped_but_counted() {
    let fx = Fixture::new().await;
    let ctx = fx.context(None);

    let path = fx.append("app.log", "ERR crlf\r\n");
    let pass = process_file(&ctx, &path).await.expect("pass");
    assert_eq!(pass.end_offset, 10);
    assert_eq!(
        fx.db.recent_errors(1).await.expect("list")[0].content,
        "ERR crlf"
    );
}

#[tokio::test]
async fn partial_line_waits_for_terminator() {
    let fx = Fixture::new().await;
    let ctx = fx.context(None);

    let path = fx.append("app.log", "ERR half");
    let pass = process_file(&ctx, &path).await.expect("pass");
    assert_eq!(pass.lines, 0);
    assert_eq!(pass.end_offset, 0);
    assert_eq!(fx.db.error_count().await.expect("count"), 0);

    fx.append("app.log", " written\n");
    let pass = process_file(&ctx, &path).await.expect("pass");
    assert_eq!(pass.created, 1);
    assert_eq!(pass.end_offset, 17);
    assert_eq!(
        fx.db.recent_errors(1).await.expect("list")[0].content,
        "ERR half written"
    );
}

#[tokio::test]
async fn stored_offset_past_end_resets_to_zero() {
    let fx = Fixture::new().await;
    let path = fx.append("app.log", "fresh ERR line\n");
    fx.db.save_offset(&path, 1_000).await.expect("save");
    let ctx = fx.context(None);

    let pass = process_file(&ctx, &path).await.expect("pass");
    assert_eq!(pass.start_offset, 0);
    assert_eq!(pass.end_offset, 15);
    assert_eq!(pass.created, 1);
}

#[tokio::test]
async fn missing_file_is_access_error() {
    let fx = Fixture::new().await;
    let ctx = fx.context(None);
    let result = process_file(&ctx, &fx.log_path("gone.log")).await;
    assert!(matches!(result, Err(TailerError::FileAccess { .. })));
}

#[tokio::test]
async fn scan_once_honours_masks() {
    let fx = Fixture::new().await;
    fx.append("app.log", "ERR one\n");
    fx.append("worker.log", "ERR two\n");
    fx.append("notes.txt", "ERR ignored\n");

    let report = fx
        .tailer()
        .scan_once(fx.logs.path(), &["*.log"])
        .await
        .expect("scan");
    assert_eq!(report.files, 2);
    assert_eq!(report.created, 2);
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn restart_resumes_from_flushed_offset() {
    let fx = Fixture::new().await;
    let path = fx.append("app.log", "ERR first\ninfo trailing\n");

    let report = fx
        .tailer()
        .scan_once(fx.logs.path(), &["*.log"])
        .await
        .expect("scan");
    assert_eq!(report.created, 1);
    // The non-error tail was flushed too.
    assert_eq!(fx.db.get_offset(&path).await.expect("offset"), 24);

    // A fresh tailer (empty cache) sees nothing new...
    let report = fx
        .tailer()
        .scan_once(fx.logs.path(), &["*.log"])
        .await
        .expect("rescan");
    assert_eq!(report.lines, 0);
    assert_eq!(report.created, 0);

    // ...until something is appended.
    fx.append("app.log", "ERR second\n");
    let report = fx
        .tailer()
        .scan_once(fx.logs.path(), &["*.log"])
        .await
        .expect("rescan");
    assert_eq!(report.created, 1);
    assert_eq!(fx.db.error_count().await.expect("count"), 2);
}

#[tokio::test]
async fn missing_directory_is_unavailable() {
    let fx = Fixture::new().await;
    let missing = fx.logs.path().join("nope");

    let scan = fx.tailer().scan_once(&missing, &["*.log"]).await;
    assert!(matches!(scan, Err(TailerError::DirectoryUnavailable { .. })));

    let mut tailer = fx.tailer();
    let start = tailer.start(&missing, &["*.log"]).await;
    assert!(matches!(start, Err(TailerError::DirectoryUnavailable { .. })));
    assert!(!tailer.is_running());
}

#[tokio::test]
async fn offsets_are_per_path() {
    let fx = Fixture::new().await;
    let ctx = fx.context(None);
    let a = fx.append("a.log", "ERR in a\n");
    let b = fx.append("b.log", "noise\nERR in b\n");

    process_file(&ctx, &a).await.expect("a");
    process_file(&ctx, &b).await.expect("b");

    assert_eq!(ctx.offsets.get(&a).await.expect("a offset"), 9);
    assert_eq!(ctx.offsets.get(&b).await.expect("b offset"), 15);
    assert_eq!(fx.db.get_offset(Path::new(&b)).await.expect("b stored"), 15);
}

//! Durable state backed by SQLite.
//!
//! Stores file offsets, detected errors with their notification records,
//! and Telegram subscribers. The schema is applied inline via
//! `include_str!` on every open. [`StateDb`] is the single source of truth
//! for all of it; in-memory caches elsewhere are only optimizations.

pub mod ledger;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

pub use self::ledger::{Detection, LedgerOutcome};

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// logsentinel's SQLite state database.
#[derive(Debug, Clone)]
pub struct StateDb {
    pool: SqlitePool,
}

/// A detected error line. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Database row id.
    pub id: i64,
    /// File the line was read from.
    pub file_path: PathBuf,
    /// Byte offset immediately after the matched line.
    pub offset: u64,
    /// Line text without its terminator.
    pub content: String,
    /// Lowercase hex SHA-256 of `content`.
    pub content_hash: String,
    /// When the error was recorded.
    pub created_at: DateTime<Utc>,
}

/// Delivery bookkeeping for one [`ErrorRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Database row id.
    pub id: i64,
    /// The error this notification belongs to (1:1).
    pub error_id: i64,
    /// When the notification was created.
    pub created_at: DateTime<Utc>,
    /// Whether an operator marked it read.
    pub is_read: bool,
    /// Whether at least one live listener received it.
    pub live_sent: bool,
    /// Whether at least one chat recipient received it.
    pub chat_sent: bool,
}

/// An opted-in chat recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    /// Telegram chat id (always positive for personal chats).
    pub chat_id: i64,
    /// First name shown by Telegram, if any.
    pub display_name: Option<String>,
    /// Telegram `@username` without the `@`, if any.
    pub username: Option<String>,
    /// Whether the subscriber currently receives notifications.
    pub active: bool,
    /// When the subscriber last (re)subscribed.
    pub subscribed_at: DateTime<Utc>,
}

impl StateDb {
    /// Open (or create) the state database at the given path and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create state db directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .pragma("trusted_schema", "OFF")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open state db at {}", path.display()))?;

        let migration_sql = include_str!("../../migrations/001_logsentinel_schema.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply logsentinel schema migration")?;

        Ok(Self { pool })
    }

    // -- Offsets --

    /// Last committed offset for a file, or 0 if it was never tracked.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn get_offset(&self, path: &Path) -> anyhow::Result<u64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_offset FROM file_offsets WHERE file_path = ?1")
                .bind(path_key(path))
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("failed to read offset for {}", path.display()))?;

        row.map_or(Ok(0), |(offset,)| offset_from_db(offset))
    }

    /// All persisted offsets, keyed by file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn load_offsets(&self) -> anyhow::Result<HashMap<PathBuf, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT file_path, last_offset FROM file_offsets")
                .fetch_all(&self.pool)
                .await
                .context("failed to load file offsets")?;

        rows.into_iter()
            .map(|(path, offset)| Ok((PathBuf::from(path), offset_from_db(offset)?)))
            .collect()
    }

    /// Upsert the offset for a file outside of any detection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn save_offset(&self, path: &Path, offset: u64) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO file_offsets (file_path, last_offset, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(file_path) DO UPDATE SET
                last_offset = excluded.last_offset,
                updated_at = excluded.updated_at",
        )
        .bind(path_key(path))
        .bind(offset_to_db(offset)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save offset for {}", path.display()))?;

        Ok(())
    }

    // -- Errors and notifications --

    /// Most recently recorded errors, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn recent_errors(&self, limit: i64) -> anyhow::Result<Vec<ErrorRecord>> {
        let rows = sqlx::query_as::<_, ErrorRow>(
            "SELECT id, file_path, line_offset, content, content_hash, created_at
             FROM errors
             ORDER BY id DESC
             LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to query recent errors")?;

        rows.into_iter().map(error_row_into_record).collect()
    }

    /// Total number of recorded errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn error_count(&self) -> anyhow::Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM errors")
            .fetch_one(&self.pool)
            .await
            .context("failed to count errors")?;
        Ok(count)
    }

    /// The notification record paired with an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn notification_for_error(
        &self,
        error_id: i64,
    ) -> anyhow::Result<Option<NotificationRecord>> {
        let row = sqlx::query_as::<_, NotificationRow>(
            "SELECT id, error_id, created_at, is_read, live_sent, chat_sent
             FROM notifications
             WHERE error_id = ?1",
        )
        .bind(error_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query notification")?;

        row.map(notification_row_into_record).transpose()
    }

    /// Most recent notifications, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn recent_notifications(
        &self,
        limit: i64,
    ) -> anyhow::Result<Vec<NotificationRecord>> {
        let rows = sqlx::query_as::<_, NotificationRow>(
            "SELECT id, error_id, created_at, is_read, live_sent, chat_sent
             FROM notifications
             ORDER BY id DESC
             LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to query recent notifications")?;

        rows.into_iter().map(notification_row_into_record).collect()
    }

    /// Set the chat-sent flag on an error's notification.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn mark_chat_sent(&self, error_id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE notifications SET chat_sent = 1 WHERE error_id = ?1")
            .bind(error_id)
            .execute(&self.pool)
            .await
            .context("failed to mark chat sent")?;
        Ok(())
    }

    /// Set the live-sent flag on an error's notification.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn mark_live_sent(&self, error_id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE notifications SET live_sent = 1 WHERE error_id = ?1")
            .bind(error_id)
            .execute(&self.pool)
            .await
            .context("failed to mark live sent")?;
        Ok(())
    }

    /// Mark a notification as read. Returns `false` if no such notification exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn mark_read(&self, notification_id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE notifications SET is_read = 1 WHERE id = ?1")
            .bind(notification_id)
            .execute(&self.pool)
            .await
            .context("failed to mark notification read")?;
        Ok(result.rows_affected() > 0)
    }

    // -- Subscribers --

    /// Insert or update a subscriber.
    ///
    /// Activating (`active = true`) stamps `subscribed_at` with the current
    /// time; deactivating keeps the previous timestamp. Names are only
    /// overwritten when a new value is supplied.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn upsert_subscriber(
        &self,
        chat_id: i64,
        display_name: Option<&str>,
        username: Option<&str>,
        active: bool,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO subscribers (chat_id, display_name, username, active, subscribed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(chat_id) DO UPDATE SET
                display_name = COALESCE(?2, display_name),
                username = COALESCE(?3, username),
                active = ?4,
                subscribed_at = CASE WHEN ?4 = 1 THEN ?5 ELSE subscribed_at END",
        )
        .bind(chat_id)
        .bind(display_name)
        .bind(username)
        .bind(active)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert subscriber {chat_id}"))?;

        Ok(())
    }

    /// Look up a subscriber by chat id, active or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn find_subscriber(&self, chat_id: i64) -> anyhow::Result<Option<Subscriber>> {
        let row = sqlx::query_as::<_, SubscriberRow>(
            "SELECT chat_id, display_name, username, active, subscribed_at
             FROM subscribers
             WHERE chat_id = ?1",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to find subscriber {chat_id}"))?;

        row.map(subscriber_row_into_record).transpose()
    }

    /// All active subscribers with personal (positive) chat ids.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn list_active_subscribers(&self) -> anyhow::Result<Vec<Subscriber>> {
        let rows = sqlx::query_as::<_, SubscriberRow>(
            "SELECT chat_id, display_name, username, active, subscribed_at
             FROM subscribers
             WHERE active = 1 AND chat_id > 0
             ORDER BY chat_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list active subscribers")?;

        rows.into_iter().map(subscriber_row_into_record).collect()
    }
}

/// Key under which a path is stored.
fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn offset_to_db(offset: u64) -> anyhow::Result<i64> {
    i64::try_from(offset).with_context(|| format!("offset {offset} exceeds i64 range"))
}

fn offset_from_db(offset: i64) -> anyhow::Result<u64> {
    u64::try_from(offset).with_context(|| format!("stored offset {offset} is negative"))
}

fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("malformed timestamp in state db: {raw}"))?
        .with_timezone(&Utc))
}

/// Raw row tuple from the `errors` table.
type ErrorRow = (i64, String, i64, String, String, String);

fn error_row_into_record(row: ErrorRow) -> anyhow::Result<ErrorRecord> {
    let (id, file_path, offset, content, content_hash, created_at) = row;
    Ok(ErrorRecord {
        id,
        file_path: PathBuf::from(file_path),
        offset: offset_from_db(offset)?,
        content,
        content_hash,
        created_at: parse_timestamp(&created_at)?,
    })
}

/// Raw row tuple from the `notifications` table.
type NotificationRow = (i64, i64, String, bool, bool, bool);

fn notification_row_into_record(row: NotificationRow) -> anyhow::Result<NotificationRecord> {
    let (id, error_id, created_at, is_read, live_sent, chat_sent) = row;
    Ok(NotificationRecord {
        id,
        error_id,
        created_at: parse_timestamp(&created_at)?,
        is_read,
        live_sent,
        chat_sent,
    })
}

/// Raw row tuple from the `subscribers` table.
type SubscriberRow = (i64, Option<String>, Option<String>, bool, String);

fn subscriber_row_into_record(row: SubscriberRow) -> anyhow::Result<Subscriber> {
    let (chat_id, display_name, username, active, subscribed_at) = row;
    Ok(Subscriber {
        chat_id,
        display_name,
        username,
        active,
        subscribed_at: parse_timestamp(&subscribed_at)?,
    })
}

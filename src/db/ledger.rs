//! Exactly-once error recording.
//!
//! [`StateDb::record_if_new`] is the only place errors are created. The
//! error row, its notification row and the file offset are written in one
//! transaction. Uniqueness on `(file_path, line_offset)` and on
//! `content_hash` is enforced by the schema, so two tailer passes racing
//! over the same line cannot both create a record: the loser's insert is
//! ignored and it reports a duplicate.

use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use tracing::debug;

use super::{offset_to_db, path_key, ErrorRecord, StateDb};

/// A candidate error line produced by the tailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// File the line was read from.
    pub file_path: PathBuf,
    /// Byte offset immediately after the line's terminator.
    pub offset: u64,
    /// Line text without its terminator.
    pub content: String,
    /// Content fingerprint from [`crate::matcher::PatternMatcher::fingerprint`].
    pub content_hash: String,
}

/// Result of [`StateDb::record_if_new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// A new error and notification were committed.
    Created(ErrorRecord),
    /// The line was already recorded, by position or by content hash.
    Duplicate {
        /// Id of the record that already covers this line.
        error_id: i64,
    },
}

impl LedgerOutcome {
    /// Whether a new record was created. Only then should anyone be notified.
    pub fn created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    /// Id of the created or pre-existing error.
    pub fn error_id(&self) -> i64 {
        match self {
            Self::Created(record) => record.id,
            Self::Duplicate { error_id } => *error_id,
        }
    }
}

impl StateDb {
    /// Record a detection unless an error with the same position or the same
    /// content hash already exists.
    ///
    /// On creation the error row, a notification row with all flags cleared,
    /// and the file's offset are committed atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails for any reason other than a
    /// uniqueness conflict, which is reported as [`LedgerOutcome::Duplicate`].
    pub async fn record_if_new(&self, detection: &Detection) -> anyhow::Result<LedgerOutcome> {
        let file_key = path_key(&detection.file_path);
        let offset = offset_to_db(detection.offset)?;
        let created_at = Utc::now();
        let created_at_str = created_at.to_rfc3339();

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin ledger transaction")?;

        // Writing first takes the database write lock up front, so the
        // existence check and the insert cannot interleave with another writer.
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO errors (file_path, line_offset, content, content_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&file_key)
        .bind(offset)
        .bind(&detection.content)
        .bind(&detection.content_hash)
        .bind(&created_at_str)
        .execute(&mut *tx)
        .await
        .context("failed to insert error record")?;

        if inserted.rows_affected() == 0 {
            let (error_id,): (i64,) = sqlx::query_as(
                "SELECT id FROM errors
                 WHERE (file_path = ?1 AND line_offset = ?2) OR content_hash = ?3
                 ORDER BY id ASC
                 LIMIT 1",
            )
            .bind(&file_key)
            .bind(offset)
            .bind(&detection.content_hash)
            .fetch_one(&mut *tx)
            .await
            .context("failed to look up existing error record")?;

            tx.rollback()
                .await
                .context("failed to roll back ledger transaction")?;

            debug!(
                path = %detection.file_path.display(),
                offset = detection.offset,
                error_id,
                "duplicate error line, not recorded"
            );
            return Ok(LedgerOutcome::Duplicate { error_id });
        }

        let error_id = inserted.last_insert_rowid();

        sqlx::query(
            "INSERT INTO notifications (error_id, created_at, is_read, live_sent, chat_sent)
             VALUES (?1, ?2, 0, 0, 0)",
        )
        .bind(error_id)
        .bind(&created_at_str)
        .execute(&mut *tx)
        .await
        .context("failed to insert notification record")?;

        sqlx::query(
            "INSERT INTO file_offsets (file_path, last_offset, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(file_path) DO UPDATE SET
                last_offset = excluded.last_offset,
                updated_at = excluded.updated_at",
        )
        .bind(&file_key)
        .bind(offset)
        .bind(&created_at_str)
        .execute(&mut *tx)
        .await
        .context("failed to advance file offset")?;

        tx.commit()
            .await
            .context("failed to commit ledger transaction")?;

        Ok(LedgerOutcome::Created(ErrorRecord {
            id: error_id,
            file_path: detection.file_path.clone(),
            offset: detection.offset,
            content: detection.content.clone(),
            content_hash: detection.content_hash.clone(),
            created_at,
        }))
    }
}

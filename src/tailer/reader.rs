//! Incremental processing of one log file.

use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::offsets::OffsetCache;
use super::TailerError;
use crate::db::{Detection, ErrorRecord, LedgerOutcome, StateDb};
use crate::matcher::PatternMatcher;

/// Everything a file pass needs, shared by all workers.
#[derive(Debug)]
pub struct TailContext {
    /// Durable store, for the ledger.
    pub db: StateDb,
    /// Offset cache in front of the store.
    pub offsets: OffsetCache,
    /// Line classifier.
    pub matcher: PatternMatcher,
    /// Where newly created errors are sent for delivery, if anywhere.
    pub sink: Option<mpsc::Sender<ErrorRecord>>,
}

/// Counters from a single pass over a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilePass {
    /// Offset the pass started from, after any truncation reset.
    pub start_offset: u64,
    /// Offset after the last complete line consumed.
    pub end_offset: u64,
    /// Complete lines read.
    pub lines: u64,
    /// Lines classified as errors.
    pub detected: u64,
    /// Errors newly recorded by the ledger.
    pub created: u64,
}

/// Read every complete line appended to `path` since its last offset.
///
/// Offsets count raw bytes, terminator included. A trailing fragment with
/// no newline is left for the next pass. Each detection goes through the
/// ledger before the next line is read; a ledger failure stops the pass
/// with the offset still pointing at the failed line.
///
/// # Errors
///
/// Returns [`TailerError::FileAccess`] if the file cannot be opened or
/// read, and [`TailerError::Store`] if the store fails.
pub async fn process_file(ctx: &TailContext, path: &Path) -> Result<FilePass, TailerError> {
    let mut offset = ctx.offsets.get(path).await.map_err(TailerError::Store)?;

    let file_access = |source: std::io::Error| TailerError::FileAccess {
        path: path.to_path_buf(),
        source,
    };

    let mut file = tokio::fs::File::open(path).await.map_err(file_access)?;
    let len = file.metadata().await.map_err(file_access)?.len();

    if offset > len {
        info!(
            path = %path.display(),
            stored = offset,
            size = len,
            "file shrank, assuming truncation or rotation and reading from start"
        );
        offset = 0;
        ctx.offsets.advance(path, 0);
    }

    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(file_access)?;
    let mut reader = BufReader::new(file);

    let mut pass = FilePass {
        start_offset: offset,
        end_offset: offset,
        ..FilePass::default()
    };
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf).await.map_err(file_access)?;
        if read == 0 || buf.last() != Some(&b'\n') {
            // EOF, or a line still being written.
            break;
        }

        let next = offset.saturating_add(u64::try_from(read).unwrap_or(u64::MAX));
        let line = decode_line(&buf);
        pass.lines = pass.lines.saturating_add(1);

        if ctx.matcher.is_error(&line) {
            pass.detected = pass.detected.saturating_add(1);
            let detection = Detection {
                file_path: path.to_path_buf(),
                offset: next,
                content_hash: PatternMatcher::fingerprint(&line),
                content: line,
            };
            match ctx
                .db
                .record_if_new(&detection)
                .await
                .map_err(TailerError::Store)?
            {
                LedgerOutcome::Created(record) => {
                    pass.created = pass.created.saturating_add(1);
                    ctx.offsets.committed(path, next);
                    info!(
                        path = %path.display(),
                        offset = next,
                        error_id = record.id,
                        "new error recorded"
                    );
                    deliver(ctx, record).await;
                }
                LedgerOutcome::Duplicate { .. } => ctx.offsets.advance(path, next),
            }
        } else {
            ctx.offsets.advance(path, next);
        }

        offset = next;
        pass.end_offset = next;
    }

    debug!(
        path = %path.display(),
        from = pass.start_offset,
        to = pass.end_offset,
        lines = pass.lines,
        created = pass.created,
        "file pass complete"
    );
    Ok(pass)
}

/// Strip the line terminator (and a preceding `\r`) and decode as UTF-8.
fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

async fn deliver(ctx: &TailContext, record: ErrorRecord) {
    let Some(sink) = &ctx.sink else {
        return;
    };
    let error_id = record.id;
    if sink.send(record).await.is_err() {
        warn!(error_id, "dispatcher queue closed, notification not delivered");
    }
}

//! In-memory offset cache in front of [`StateDb`].
//!
//! Reads fall through to the store on a miss. Offsets committed by the
//! ledger are already durable and are cached clean; offsets advanced past
//! non-error lines or duplicates are dirty until [`OffsetCache::flush`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::db::StateDb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CachedOffset {
    offset: u64,
    dirty: bool,
}

/// Write-through offset cache. The store stays authoritative.
#[derive(Debug)]
pub struct OffsetCache {
    db: StateDb,
    entries: Mutex<HashMap<PathBuf, CachedOffset>>,
}

impl OffsetCache {
    /// Create an empty cache over `db`.
    pub fn new(db: StateDb) -> Self {
        Self {
            db,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, CachedOffset>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed the cache with every persisted offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn preload(&self) -> anyhow::Result<usize> {
        let stored = self.db.load_offsets().await?;
        let count = stored.len();
        let mut entries = self.lock();
        for (path, offset) in stored {
            entries
                .entry(path)
                .or_insert(CachedOffset { offset, dirty: false });
        }
        Ok(count)
    }

    /// Current offset for `path`, reading through to the store on a miss.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn get(&self, path: &Path) -> anyhow::Result<u64> {
        if let Some(cached) = self.lock().get(path) {
            return Ok(cached.offset);
        }
        let offset = self.db.get_offset(path).await?;
        self.lock()
            .entry(path.to_path_buf())
            .or_insert(CachedOffset { offset, dirty: false });
        Ok(offset)
    }

    /// Record progress that is not yet durable.
    pub fn advance(&self, path: &Path, offset: u64) {
        self.lock().insert(
            path.to_path_buf(),
            CachedOffset {
                offset,
                dirty: true,
            },
        );
    }

    /// Record progress the ledger has already committed.
    pub fn committed(&self, path: &Path, offset: u64) {
        self.lock().insert(
            path.to_path_buf(),
            CachedOffset {
                offset,
                dirty: false,
            },
        );
    }

    /// Drop the in-memory offset so the next read goes to the store.
    pub fn forget(&self, path: &Path) {
        self.lock().remove(path);
    }

    /// Persist every dirty offset. Returns how many were written.
    ///
    /// Entries that fail to save stay dirty.
    ///
    /// # Errors
    ///
    /// Returns the first store error after attempting every entry.
    pub async fn flush(&self) -> anyhow::Result<usize> {
        let dirty: Vec<(PathBuf, u64)> = self
            .lock()
            .iter()
            .filter(|(_, cached)| cached.dirty)
            .map(|(path, cached)| (path.clone(), cached.offset))
            .collect();

        let mut written: usize = 0;
        let mut first_error = None;
        for (path, offset) in dirty {
            match self.db.save_offset(&path, offset).await {
                Ok(()) => {
                    written = written.saturating_add(1);
                    let mut entries = self.lock();
                    // Only clear the flag if nothing advanced it meanwhile.
                    if let Some(cached) = entries.get_mut(&path) {
                        if cached.offset == offset {
                            cached.dirty = false;
                        }
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        debug!(written, "flushed file offsets");
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }
}

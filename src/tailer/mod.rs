//! Directory tailer.
//!
//! Watches one directory (non-recursively) for files matching a set of glob
//! masks and feeds every complete appended line through the
//! [`PatternMatcher`] and the ledger. Filesystem events are routed to one
//! worker task per path; each worker owns a capacity-1 wake channel, so a
//! burst of events for the same file collapses into at most one pending
//! pass. The ledger's uniqueness constraints remain the final guard against
//! duplicate detections.

pub mod masks;
pub mod offsets;
pub mod reader;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::db::{ErrorRecord, StateDb};
use crate::matcher::PatternMatcher;

pub use self::masks::MaskSet;
pub use self::offsets::OffsetCache;
pub use self::reader::{process_file, FilePass, TailContext};

/// Tailer errors.
#[derive(Debug, Error)]
pub enum TailerError {
    /// The watch directory is missing or unreadable. Fatal at startup.
    #[error("watch directory {} is unavailable: {source}", .path.display())]
    DirectoryUnavailable {
        /// Directory that was requested.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A mask is not a valid glob.
    #[error("invalid file mask '{mask}': {source}")]
    InvalidMask {
        /// The offending mask.
        mask: String,
        /// Glob parse error.
        #[source]
        source: glob::PatternError,
    },
    /// The filesystem watcher could not be set up.
    #[error("failed to watch {}: {source}", .path.display())]
    Watch {
        /// Directory being watched.
        path: PathBuf,
        /// Watcher error.
        #[source]
        source: notify::Error,
    },
    /// A log file could not be opened or read. The pass is abandoned and
    /// retried on the next event.
    #[error("cannot read {}: {source}", .path.display())]
    FileAccess {
        /// File being processed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The state store failed.
    #[error("state store error: {0:#}")]
    Store(anyhow::Error),
    /// `start` was called on a running tailer.
    #[error("tailer is already running")]
    AlreadyRunning,
}

/// Totals from [`Tailer::scan_once`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Files that matched a mask.
    pub files: usize,
    /// Files whose pass failed.
    pub failed: usize,
    /// Complete lines read across all files.
    pub lines: u64,
    /// Errors newly recorded.
    pub created: u64,
}

/// Filesystem change relevant to the tailer, reduced from a notify event.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FsChange {
    /// Created or written; processed if it matches a mask.
    Touched(PathBuf),
    /// Deleted, or renamed away.
    Gone(PathBuf),
    /// Renamed into place; rescanned from its own persisted offset.
    Arrived(PathBuf),
}

/// Watches a directory and records errors appended to matching files.
pub struct Tailer {
    ctx: Arc<TailContext>,
    running: Option<Running>,
}

struct Running {
    dir: PathBuf,
    shutdown: watch::Sender<bool>,
    router: JoinHandle<()>,
    watcher: RecommendedWatcher,
}

impl std::fmt::Debug for Tailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tailer")
            .field("dir", &self.running.as_ref().map(|r| r.dir.clone()))
            .finish()
    }
}

impl Tailer {
    /// Create a stopped tailer. Newly recorded errors are sent to `sink`
    /// when one is given.
    pub fn new(
        db: StateDb,
        matcher: PatternMatcher,
        sink: Option<mpsc::Sender<ErrorRecord>>,
    ) -> Self {
        let ctx = TailContext {
            offsets: OffsetCache::new(db.clone()),
            db,
            matcher,
            sink,
        };
        Self {
            ctx: Arc::new(ctx),
            running: None,
        }
    }

    /// Whether [`Tailer::start`] has been called without a matching stop.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start watching `dir`.
    ///
    /// Loads persisted offsets, then installs the watcher and wakes a worker
    /// for every file already matching a mask, so nothing written between
    /// the initial listing and the first event is missed.
    ///
    /// # Errors
    ///
    /// Returns [`TailerError::DirectoryUnavailable`] if `dir` is missing or
    /// unreadable, and other variants if masks, the store, or the watcher
    /// cannot be set up.
    pub async fn start<S: AsRef<str>>(
        &mut self,
        dir: &Path,
        masks: &[S],
    ) -> Result<(), TailerError> {
        if self.running.is_some() {
            return Err(TailerError::AlreadyRunning);
        }

        let masks = MaskSet::new(masks)?;
        let dir = resolve_dir(dir)?;

        let preloaded = self
            .ctx
            .offsets
            .preload()
            .await
            .map_err(TailerError::Store)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel::<notify::Event>();
        let mut watcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| match event {
                Ok(event) => {
                    // The receiver only goes away during shutdown.
                    let _ = event_tx.send(event);
                }
                Err(e) => warn!(error = %e, "filesystem watcher error"),
            })
            .map_err(|source| TailerError::Watch {
                path: dir.clone(),
                source,
            })?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|source| TailerError::Watch {
                path: dir.clone(),
                source,
            })?;

        let initial = masks
            .list_matching(&dir)
            .map_err(|source| TailerError::DirectoryUnavailable {
                path: dir.clone(),
                source,
            })?;

        info!(
            dir = %dir.display(),
            files = initial.len(),
            offsets = preloaded,
            "tailer started"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let router = Router {
            ctx: Arc::clone(&self.ctx),
            dir: dir.clone(),
            masks,
            workers: HashMap::new(),
            tasks: JoinSet::new(),
        };
        let router = tokio::spawn(router.run(initial, event_rx, shutdown_rx));

        self.running = Some(Running {
            dir,
            shutdown: shutdown_tx,
            router,
            watcher,
        });
        Ok(())
    }

    /// Stop watching. Waits for in-flight passes, flushes offsets that are
    /// not yet durable (best-effort), then releases the watcher.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        if let Err(e) = running.router.await {
            error!(error = %e, "tailer router task failed");
        }

        match self.ctx.offsets.flush().await {
            Ok(written) => debug!(written, "offsets flushed on stop"),
            Err(e) => warn!(error = %e, "failed to flush offsets on stop"),
        }

        drop(running.watcher);
        info!(dir = %running.dir.display(), "tailer stopped");
    }

    /// Process every matching file in `dir` once, without watching, and
    /// flush offsets afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`TailerError::DirectoryUnavailable`] if `dir` cannot be
    /// listed, or [`TailerError::InvalidMask`] for a bad mask. Per-file
    /// failures are counted in the report.
    pub async fn scan_once<S: AsRef<str>>(
        &self,
        dir: &Path,
        masks: &[S],
    ) -> Result<ScanReport, TailerError> {
        let masks = MaskSet::new(masks)?;
        let dir = resolve_dir(dir)?;
        let files = masks
            .list_matching(&dir)
            .map_err(|source| TailerError::DirectoryUnavailable {
                path: dir.clone(),
                source,
            })?;

        let mut report = ScanReport {
            files: files.len(),
            ..ScanReport::default()
        };
        for path in &files {
            match process_file(&self.ctx, path).await {
                Ok(pass) => {
                    report.lines = report.lines.saturating_add(pass.lines);
                    report.created = report.created.saturating_add(pass.created);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "file pass failed");
                    report.failed = report.failed.saturating_add(1);
                }
            }
        }

        self.ctx.offsets.flush().await.map_err(TailerError::Store)?;
        Ok(report)
    }
}

/// Canonicalize the watch directory and make sure it is one.
fn resolve_dir(dir: &Path) -> Result<PathBuf, TailerError> {
    let unavailable = |source| TailerError::DirectoryUnavailable {
        path: dir.to_path_buf(),
        source,
    };
    let resolved = std::fs::canonicalize(dir).map_err(unavailable)?;
    if !resolved.is_dir() {
        return Err(unavailable(std::io::Error::other("not a directory")));
    }
    Ok(resolved)
}

/// Reduce a notify event to the changes the router acts on.
fn classify(event: notify::Event) -> Vec<FsChange> {
    match event.kind {
        EventKind::Access(_) => Vec::new(),
        EventKind::Remove(_) => event.paths.into_iter().map(FsChange::Gone).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            let mut changes = Vec::with_capacity(2);
            if let Some(from) = paths.next() {
                changes.push(FsChange::Gone(from));
            }
            if let Some(to) = paths.next() {
                changes.push(FsChange::Arrived(to));
            }
            changes
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.into_iter().map(FsChange::Gone).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.into_iter().map(FsChange::Arrived).collect()
        }
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .into_iter()
            .map(|p| {
                if p.exists() {
                    FsChange::Arrived(p)
                } else {
                    FsChange::Gone(p)
                }
            })
            .collect(),
        _ => event.paths.into_iter().map(FsChange::Touched).collect(),
    }
}

/// Routes filesystem events to per-path workers.
struct Router {
    ctx: Arc<TailContext>,
    dir: PathBuf,
    masks: MaskSet,
    workers: HashMap<PathBuf, mpsc::Sender<()>>,
    tasks: JoinSet<()>,
}

impl Router {
    async fn run(
        mut self,
        initial: Vec<PathBuf>,
        mut events: mpsc::UnboundedReceiver<notify::Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        for path in initial {
            self.wake(path);
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
            // Reap workers that exited after their path went away.
            while let Some(joined) = self.tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "tailer worker panicked");
                }
            }
        }

        // Closing every wake channel lets each worker finish its current
        // pass and exit.
        self.workers.clear();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "tailer worker panicked");
            }
        }
    }

    fn handle(&mut self, event: notify::Event) {
        // The watcher dropped events; any listed file may have new data.
        let rescan = event.need_rescan();
        if rescan {
            warn!(dir = %self.dir.display(), "watcher requested a rescan, waking every file");
        }
        let mut touched = Vec::new();
        for change in classify(event) {
            match change {
                FsChange::Gone(path) => {
                    debug!(path = %path.display(), "file gone, dropping offset");
                    self.retire(&path);
                }
                FsChange::Arrived(path) => {
                    debug!(path = %path.display(), "file renamed into place, rescanning");
                    self.retire(&path);
                    touched.push(path);
                }
                FsChange::Touched(path) => touched.push(path),
            }
        }

        // Directory contents are re-listed on every event.
        let listed = match self.masks.list_matching(&self.dir) {
            Ok(listed) => listed,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "failed to list watch directory");
                return;
            }
        };
        for path in listed {
            if rescan || touched.contains(&path) || !self.workers.contains_key(&path) {
                self.wake(path);
            }
        }
    }

    /// Stop the path's worker and forget its in-memory offset.
    fn retire(&mut self, path: &Path) {
        self.workers.remove(path);
        self.ctx.offsets.forget(path);
    }

    /// Schedule a pass over `path`, spawning its worker on first use.
    fn wake(&mut self, path: PathBuf) {
        let ctx = &self.ctx;
        let tasks = &mut self.tasks;
        let wake = self.workers.entry(path.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(1);
            tasks.spawn(worker(Arc::clone(ctx), path, rx));
            tx
        });
        // A full channel already has a pass pending.
        let _ = wake.try_send(());
    }
}

async fn worker(ctx: Arc<TailContext>, path: PathBuf, mut wake: mpsc::Receiver<()>) {
    while wake.recv().await.is_some() {
        match process_file(&ctx, &path).await {
            Ok(_) => {}
            Err(e @ TailerError::FileAccess { .. }) => {
                warn!(path = %path.display(), error = %e, "abandoning file pass");
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "file pass failed");
            }
        }
    }
}

//! OS filesystem change notifications.
//!
//! Uses the raw `notify` crate rather than a debounced wrapper: one
//! OS-level watch per directory with no internal debouncing, since
//! coalescing belongs to the Broadcaster's drop-newest queues, not the
//! watcher itself.

use crate::broadcaster::{self, Broadcaster};
use crate::error::SweepError;
use crate::model::{FileEntry, FileEventKind, LargeFileRecord};
use crate::store::Store;
use globset::{Glob, GlobSet, GlobSetBuilder};
use jwalk::WalkDir;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub large_file_threshold: i64,
    pub exclude_patterns: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            large_file_threshold: 10 * 1024 * 1024,
            exclude_patterns: vec![
                "**/.git/**".to_string(),
                "**/node_modules/**".to_string(),
                "**/target/**".to_string(),
            ],
        }
    }
}

/// One `notify::RecommendedWatcher` shared across every watched directory,
/// with a registry of currently-watched paths so re-adding a directory (or
/// tearing down a whole root) is idempotent.
pub struct Watcher {
    inner: Mutex<RecommendedWatcher>,
    watched: Mutex<HashSet<PathBuf>>,
    exclude: GlobSet,
    large_file_threshold: i64,
}

impl Watcher {
    /// Starts the background event-processing thread and returns a handle
    /// usable from any tokio task to add/remove watched roots.
    pub fn spawn(
        store: Store,
        broadcaster: Arc<Broadcaster>,
        config: WatcherConfig,
    ) -> Result<Arc<Self>, SweepError> {
        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
        let notify_watcher = notify::recommended_watcher(move |res| {
            if tx.send(res).is_err() {
                debug!("watcher channel closed, dropping event");
            }
        })
        .map_err(|e| SweepError::Unavailable(e.to_string()))?;

        let exclude = build_globset(&config.exclude_patterns)
            .map_err(|e| SweepError::Invalid(e.to_string()))?;

        let watcher = Arc::new(Self {
            inner: Mutex::new(notify_watcher),
            watched: Mutex::new(HashSet::new()),
            exclude,
            large_file_threshold: config.large_file_threshold,
        });

        let worker = Arc::clone(&watcher);
        std::thread::spawn(move || {
            for result in rx {
                match result {
                    Ok(event) => worker.handle_event(event, &store, &broadcaster),
                    Err(e) => warn!(error = %e, "watcher reported an error"),
                }
            }
        });

        Ok(watcher)
    }

    /// Registers one non-recursive watch per directory under `root`
    /// (`root` included). Per-directory failures are logged and skipped
    /// rather than aborting the whole seed.
    pub fn watch_root(&self, root: &Path) -> usize {
        let mut watched_count = 0;
        for entry in WalkDir::new(root).follow_links(false).skip_hidden(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!(error = %e, "walk error while seeding watches");
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path();
            if self.exclude.is_match(&path) {
                continue;
            }
            match self.watch_dir(&path) {
                Ok(()) => watched_count += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to watch directory (skipping)"),
            }
        }
        watched_count
    }

    /// Removes every watch registered under `root`, used when a root is
    /// subsumed or the daemon is shutting down a subtree.
    pub fn unwatch_root(&self, root: &Path) {
        let mut watched = self.watched.lock().unwrap();
        let to_remove: Vec<PathBuf> = watched
            .iter()
            .filter(|p| p.starts_with(root))
            .cloned()
            .collect();
        let mut inner = self.inner.lock().unwrap();
        for path in to_remove {
            let _ = inner.unwatch(&path);
            watched.remove(&path);
        }
    }

    fn watch_dir(&self, dir: &Path) -> Result<(), SweepError> {
        let mut watched = self.watched.lock().unwrap();
        if watched.contains(dir) {
            return Ok(());
        }
        self.inner
            .lock()
            .unwrap()
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| SweepError::Unavailable(e.to_string()))?;
        watched.insert(dir.to_path_buf());
        Ok(())
    }

    fn handle_event(&self, event: Event, store: &Store, broadcaster: &Broadcaster) {
        use notify::event::{ModifyKind, RenameMode};

        // A `RenameMode::Both` event carries both paths together
        // (paths[0] = from, paths[1] = to) and is handled as a unit rather
        // than per-path, since the spec treats rename-as-remove: the old
        // path is evicted and the new path re-discovered as a create.
        if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = &event.kind {
            if event.paths.len() >= 2 {
                let from = &event.paths[0];
                let to = &event.paths[1];
                if !self.exclude.is_match(from) {
                    let from_str = from.to_string_lossy().to_string();
                    self.on_remove(from, &from_str, store, broadcaster);
                }
                if !self.exclude.is_match(to) {
                    let to_str = to.to_string_lossy().to_string();
                    self.on_create(to, &to_str, store, broadcaster);
                }
                return;
            }
        }

        for path in &event.paths {
            if self.exclude.is_match(path) {
                continue;
            }
            let path_str = path.to_string_lossy().to_string();
            match &event.kind {
                EventKind::Create(_) => self.on_create(path, &path_str, store, broadcaster),
                // "From" half of a split rename: the source path is gone.
                // Treat as remove per spec (subsequent create, if any,
                // re-adds it under the new path).
                EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                    self.on_remove(path, &path_str, store, broadcaster)
                }
                // "To" half of a split rename: a new path has appeared.
                EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                    self.on_create(path, &path_str, store, broadcaster)
                }
                // Ambiguous rename notification with no from/to split
                // available; fall back to remove, matching "treat rename as
                // remove" since we cannot tell which side of the rename this
                // path is on.
                EventKind::Modify(ModifyKind::Name(_)) => {
                    self.on_remove(path, &path_str, store, broadcaster)
                }
                EventKind::Modify(_) => {
                    self.on_modify(path, &path_str, store, broadcaster, FileEventKind::Modified)
                }
                EventKind::Remove(_) => self.on_remove(path, &path_str, store, broadcaster),
                EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
            }
        }
    }

    fn on_create(&self, path: &Path, path_str: &str, store: &Store, broadcaster: &Broadcaster) {
        if path.is_dir() {
            if let Err(e) = self.watch_dir(path) {
                warn!(path = %path_str, error = %e, "failed to watch newly created directory");
            }
            let entry = FileEntry {
                path: path_str.to_string(),
                size: 0,
                mtime: now_secs(),
                is_dir: true,
                children: Vec::new(),
            };
            if let Err(e) = store.put_entry(&entry) {
                warn!(path = %path_str, error = %e, "failed to record new directory");
            }
            return;
        }
        self.on_modify(path, path_str, store, broadcaster, FileEventKind::Created);
    }

    fn on_modify(
        &self,
        path: &Path,
        path_str: &str,
        store: &Store,
        broadcaster: &Broadcaster,
        kind: FileEventKind,
    ) {
        let metadata = match path.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %path_str, error = %e, "stat error, ignoring event");
                return;
            }
        };
        let is_dir = metadata.is_dir();
        let size = if is_dir { 0 } else { metadata.len() as i64 };
        let mtime = mtime_secs(&metadata);

        let entry = FileEntry {
            path: path_str.to_string(),
            size,
            mtime,
            is_dir,
            children: Vec::new(),
        };
        if let Err(e) = store.put_entry(&entry) {
            warn!(path = %path_str, error = %e, "failed to update entry");
            return;
        }

        if !is_dir {
            if size >= self.large_file_threshold {
                let record = LargeFileRecord { size, mtime };
                if let Err(e) = store.put_large_file(path_str, record) {
                    warn!(path = %path_str, error = %e, "failed to record large file");
                }
            } else if let Err(e) = store.remove_large_file(path_str) {
                warn!(path = %path_str, error = %e, "failed to clear stale large-file record");
            }
        }

        broadcaster.notify(broadcaster::event(kind, path_str, size, mtime));
    }

    fn on_remove(&self, path: &Path, path_str: &str, store: &Store, broadcaster: &Broadcaster) {
        // Emit the Deleted event first, with size = 0, so the broadcaster
        // can still match subscribers by path before the entry disappears
        // from the store.
        broadcaster.notify(broadcaster::event(
            FileEventKind::Deleted,
            path_str,
            0,
            now_secs(),
        ));

        if let Err(e) = store.delete_prefix(path_str) {
            warn!(path = %path_str, error = %e, "failed to delete entry subtree");
        }

        self.unwatch_root(path);
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

#[cfg(unix)]
fn mtime_secs(metadata: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    metadata.mtime()
}

#[cfg(not(unix))]
fn mtime_secs(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

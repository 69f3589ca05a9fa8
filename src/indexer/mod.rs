//! Parallel recursive indexer.
//!
//! Walks a root with `jwalk`, batches writes into the `Store`, and reports
//! progress via a coalesced last-value callback.

use crate::error::SweepError;
use crate::model::{FileEntry, IndexMeta, LargeFileRecord, CURRENT_SCHEMA_VERSION};
use crate::store::Store;
use jwalk::{Parallelism, WalkDir};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_BATCH_SIZE: usize = 1000;
const PROGRESS_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub large_file_threshold: i64,
    pub batch_size: usize,
    pub num_threads: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            large_file_threshold: 10 * 1024 * 1024,
            batch_size: DEFAULT_BATCH_SIZE,
            num_threads: num_cpus(),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Snapshot handed to the progress callback; overwritten every tick, never
/// queued — last value wins.
#[derive(Debug, Clone, Default)]
pub struct IndexProgress {
    pub files_scanned: u64,
    pub dirs_scanned: u64,
    pub current_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct IndexOutcome {
    pub files: i64,
    pub dirs: i64,
    pub total_size: i64,
    pub elapsed: Duration,
    pub cached: bool,
    pub covered_by: Option<String>,
    pub subsumed_paths: Vec<String>,
}

#[derive(Default)]
struct Counters {
    dirs_scanned: AtomicU64,
    files_scanned: AtomicU64,
    total_size: AtomicU64,
    current_path: Mutex<String>,
}

impl Counters {
    fn snapshot(&self) -> IndexProgress {
        IndexProgress {
            files_scanned: self.files_scanned.load(Ordering::Relaxed),
            dirs_scanned: self.dirs_scanned.load(Ordering::Relaxed),
            current_path: self.current_path.lock().unwrap().clone(),
        }
    }
}

pub struct Indexer {
    store: Store,
    config: IndexerConfig,
}

impl Indexer {
    pub fn new(store: Store, config: IndexerConfig) -> Self {
        Self { store, config }
    }

    /// Runs a full recursive scan of `root`. Blocking — callers invoke this
    /// from a dedicated thread (`tokio::task::spawn_blocking`), never
    /// directly on a tokio worker thread.
    pub fn index(
        &self,
        root: &Path,
        cancel: CancellationToken,
        on_progress: impl Fn(IndexProgress) + Send + Sync + 'static,
    ) -> Result<IndexOutcome, SweepError> {
        let start = Instant::now();
        let root_str = canonicalize(root)?;

        if let Some(covered_by) = self
            .store
            .is_path_covered(&root_str)
            .map_err(SweepError::Storage)?
        {
            debug!(root = %root_str, covered_by = %covered_by, "root already covered, skipping scan");
            return Ok(IndexOutcome {
                cached: true,
                covered_by: Some(covered_by),
                elapsed: start.elapsed(),
                ..Default::default()
            });
        }

        let counters = Arc::new(Counters::default());
        let done = Arc::new(AtomicBool::new(false));

        let ticker = {
            let counters = Arc::clone(&counters);
            let done = Arc::clone(&done);
            let on_progress = Arc::new(on_progress);
            let on_progress_thread = Arc::clone(&on_progress);
            on_progress(counters.snapshot()); // initial emit brackets the run
            std::thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    std::thread::sleep(PROGRESS_TICK);
                    on_progress_thread(counters.snapshot());
                }
            })
        };

        let entry_buffer: Arc<Mutex<Vec<FileEntry>>> = Arc::new(Mutex::new(Vec::new()));
        let large_buffer: Arc<Mutex<Vec<(String, LargeFileRecord)>>> =
            Arc::new(Mutex::new(Vec::new()));

        let walker = WalkDir::new(&root_str)
            .follow_links(false)
            .skip_hidden(false)
            .parallelism(Parallelism::RayonNewPool(self.config.num_threads));

        let mut cancelled = false;
        for entry in walker {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!(error = %e, "walk error, skipping entry");
                    continue;
                }
            };

            let path = entry.path();
            let path_str = path.to_string_lossy().to_string();
            let is_dir = entry.file_type().is_dir();
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    debug!(path = %path_str, error = %e, "stat error, skipping entry");
                    continue;
                }
            };
            let size = if is_dir { 0 } else { metadata.len() as i64 };
            let mtime = mtime_secs(&metadata);

            *counters.current_path.lock().unwrap() = path_str.clone();
            if is_dir {
                counters.dirs_scanned.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.files_scanned.fetch_add(1, Ordering::Relaxed);
                counters
                    .total_size
                    .fetch_add(size as u64, Ordering::Relaxed);
            }

            let file_entry = FileEntry {
                path: path_str.clone(),
                size,
                mtime,
                is_dir,
                children: Vec::new(),
            };

            let mut flush_needed = false;
            {
                let mut buf = entry_buffer.lock().unwrap();
                buf.push(file_entry);
                if buf.len() >= self.config.batch_size {
                    flush_needed = true;
                }
            }
            if flush_needed {
                self.flush_entries(&entry_buffer)?;
            }

            if !is_dir && size >= self.config.large_file_threshold {
                large_buffer
                    .lock()
                    .unwrap()
                    .push((path_str, LargeFileRecord { size, mtime }));
            }
        }

        self.flush_entries(&entry_buffer)?;
        {
            let files: Vec<(String, LargeFileRecord)> =
                std::mem::take(&mut *large_buffer.lock().unwrap());
            if !files.is_empty() {
                self.store
                    .add_large_file_batch(&files)
                    .map_err(SweepError::Storage)?;
            }
        }

        done.store(true, Ordering::Relaxed);
        let _ = ticker.join();

        if cancelled {
            return Err(SweepError::Cancelled);
        }

        let files = counters.files_scanned.load(Ordering::Relaxed) as i64;
        let dirs = counters.dirs_scanned.load(Ordering::Relaxed) as i64;
        let total_size = counters.total_size.load(Ordering::Relaxed) as i64;

        self.store
            .put_index_meta(&root_str, &IndexMeta { files, dirs })
            .map_err(SweepError::Storage)?;
        self.store.ensure_current_schema().map_err(SweepError::Storage)?;

        let subsumed_paths = self
            .store
            .add_indexed_path_with_subsumption(&root_str)
            .map_err(SweepError::Storage)?;

        info!(
            root = %root_str,
            files,
            dirs,
            total_size,
            elapsed_ms = start.elapsed().as_millis(),
            schema_version = CURRENT_SCHEMA_VERSION,
            "index complete"
        );

        Ok(IndexOutcome {
            files,
            dirs,
            total_size,
            elapsed: start.elapsed(),
            cached: false,
            covered_by: None,
            subsumed_paths,
        })
    }

    fn flush_entries(&self, buffer: &Arc<Mutex<Vec<FileEntry>>>) -> Result<(), SweepError> {
        let batch: Vec<FileEntry> = std::mem::take(&mut *buffer.lock().unwrap());
        if batch.is_empty() {
            return Ok(());
        }
        self.store.put_batch(&batch).map_err(SweepError::Storage)
    }
}

fn canonicalize(root: &Path) -> Result<String, SweepError> {
    let canonical = root
        .canonicalize()
        .map_err(|e| SweepError::Walk {
            path: root.display().to_string(),
            source: e,
        })?;
    Ok(canonical.to_string_lossy().to_string())
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

#[allow(dead_code)]
fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn make_store(dir: &Path) -> Store {
        Store::open(dir).unwrap()
    }

    #[test]
    fn indexes_files_and_records_large_files() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("small.txt"), vec![0u8; 100]).unwrap();
        fs::write(temp.path().join("big.bin"), vec![0u8; 20_000]).unwrap();

        let store_dir = TempDir::new().unwrap();
        let store = make_store(store_dir.path());
        let indexer = Indexer::new(
            store.clone(),
            IndexerConfig {
                large_file_threshold: 10_000,
                ..Default::default()
            },
        );

        let outcome = indexer
            .index(temp.path(), CancellationToken::new(), |_| {})
            .unwrap();

        assert!(!outcome.cached);
        assert_eq!(outcome.files, 2);

        let root_str = temp.path().canonicalize().unwrap().to_string_lossy().to_string();
        let large = store.get_large_files(&root_str, 0, 10).unwrap();
        assert_eq!(large.len(), 1);
        assert!(large[0].0.ends_with("big.bin"));
    }

    #[test]
    fn second_index_of_covered_subdir_is_a_cache_hit() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), vec![0u8; 10]).unwrap();
        let sub = temp.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("b.txt"), vec![0u8; 10]).unwrap();

        let store_dir = TempDir::new().unwrap();
        let store = make_store(store_dir.path());
        let indexer = Indexer::new(store, IndexerConfig::default());

        indexer
            .index(temp.path(), CancellationToken::new(), |_| {})
            .unwrap();
        let outcome = indexer
            .index(&sub, CancellationToken::new(), |_| {})
            .unwrap();

        assert!(outcome.cached);
        assert!(outcome.covered_by.is_some());
    }
}

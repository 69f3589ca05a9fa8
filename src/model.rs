//! Data types shared across the store, indexer, watcher, broadcaster and
//! service layers.
//!
//! Everything here is plain data — ownership and mutation rules live with
//! the component that's responsible for them (see `DESIGN.md`).

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Separator used for all path-prefix and subsumption comparisons. The
/// daemon only targets Unix hosts (see `src/lifecycle`), so this is a
/// literal `/` rather than `std::path::MAIN_SEPARATOR`.
pub const SEPARATOR: char = '/';

/// A persisted record of one filesystem entry (file or directory).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: i64,
    pub mtime: i64,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

/// A large-file record: present iff `path` is a non-directory whose size
/// was `>= min_large_file_size` at the moment of last write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LargeFileRecord {
    pub size: i64,
    pub mtime: i64,
}

impl LargeFileRecord {
    pub fn to_be_bytes(self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&self.size.to_be_bytes());
        buf[8..16].copy_from_slice(&self.mtime.to_be_bytes());
        buf
    }

    pub fn from_be_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != 16 {
            return None;
        }
        let size = i64::from_be_bytes(buf[0..8].try_into().ok()?);
        let mtime = i64::from_be_bytes(buf[8..16].try_into().ok()?);
        Some(Self { size, mtime })
    }
}

/// Cached aggregate counts for a single indexed root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub files: i64,
    pub dirs: i64,
}

/// Monotonic on-disk schema marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub version: u32,
    pub updated_at: i64,
}

/// Current schema version. Bumped to 2 to mean: every `FileEntry` has a
/// corresponding large-file record rebuilt from scratch (see
/// `Store::migrate`).
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Transient, in-memory per-root lifecycle tag. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    NotIndexed,
    Indexing,
    Ready,
    Stale,
}

/// A sample of in-flight indexing progress, exposed via `WatchIndexProgress`.
#[derive(Debug, Clone, Default)]
pub struct IndexProgress {
    pub files_scanned: u64,
    pub dirs_scanned: u64,
    pub current_path: String,
}

/// A change observed by the watcher or synthesized at watch-deletion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub path: String,
    pub size: i64,
    pub mtime: i64,
}

/// `true` iff `path` is `root` itself or a strict descendant of `root`,
/// with separator-boundary-correct comparison (Testable Property 2:
/// `/a/bcd` does not count as under `/a/b`).
pub fn is_path_under(path: &str, root: &str) -> bool {
    if path == root {
        return true;
    }
    match path.strip_prefix(root) {
        Some(rest) => rest.starts_with(SEPARATOR),
        None => false,
    }
}

/// Join a directory path and a basename the way the store expects it —
/// plain path concatenation with a single separator, no normalization.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with(SEPARATOR) {
        format!("{parent}{name}")
    } else {
        format!("{parent}{SEPARATOR}{name}")
    }
}

pub fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

//! Embedded ordered key-value store.
//!
//! Backed by `redb`, a pure-Rust, crash-safe, ordered KV engine — the same
//! choice the `SV-stark-FindAll` flash-search tool makes for its metadata
//! database (see `DESIGN.md`). The `entries`/`large_files`/`meta` key
//! namespaces are implemented as three separate `redb` tables rather than
//! single-byte key prefixes within one table, since a table is already its
//! own ordered keyspace.

use crate::error::StorageError;
use crate::model::{
    is_path_under, FileEntry, IndexMeta, LargeFileRecord, Schema, CURRENT_SCHEMA_VERSION,
};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");
const LARGE_FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("large_files");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const SCHEMA_KEY: &str = "schema";
const ROOTS_KEY: &str = "roots";

/// Progress sample emitted during a `Migrate` run, every ~10k entries.
#[derive(Debug, Clone, Default)]
pub struct MigrationProgress {
    pub from_version: u32,
    pub to_version: u32,
    pub entries_total: u64,
    pub entries_done: u64,
    pub current_path: String,
}

#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Opens (creating if absent) the `index.db` database under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("index.db");
        let db = Database::create(db_path)?;
        // Ensure all three tables exist even on a brand new database.
        let txn = db.begin_write()?;
        {
            txn.open_table(ENTRIES)?;
            txn.open_table(LARGE_FILES)?;
            txn.open_table(META)?;
        }
        txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Remove the on-disk lock file left behind by a crashed process. Called
    /// from `src/lifecycle` during stale-instance recovery, before `open`.
    pub fn remove_stale_lock(data_dir: &Path) -> std::io::Result<()> {
        let lock_path = data_dir.join("index.db.lock");
        if lock_path.exists() {
            std::fs::remove_file(lock_path)?;
        }
        Ok(())
    }

    // ---- entries -------------------------------------------------------

    pub fn get_entry(&self, path: &str) -> Result<Option<FileEntry>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTRIES)?;
        match table.get(path)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// Atomically writes a batch of entries and their corresponding
    /// large-file records (size/mtime permitting). The indexer flushes
    /// every ~1000 entries; the watcher flushes one entry at a time.
    pub fn put_batch(&self, entries: &[FileEntry]) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ENTRIES)?;
            for entry in entries {
                let encoded = serde_json::to_vec(entry)?;
                table.insert(entry.path.as_str(), encoded.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn put_entry(&self, entry: &FileEntry) -> Result<(), StorageError> {
        self.put_batch(std::slice::from_ref(entry))
    }

    // ---- large files -----------------------------------------------------

    pub fn add_large_file_batch(
        &self,
        files: &[(String, LargeFileRecord)],
    ) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LARGE_FILES)?;
            for (path, record) in files {
                let bytes = record.to_be_bytes();
                table.insert(path.as_str(), bytes.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn put_large_file(&self, path: &str, record: LargeFileRecord) -> Result<(), StorageError> {
        self.add_large_file_batch(&[(path.to_string(), record)])
    }

    pub fn remove_large_file(&self, path: &str) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LARGE_FILES)?;
            table.remove(path)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Removes a single entry, used by the watcher on a `Remove` event.
    /// `delete_prefix` is the bulk equivalent used for whole-root eviction.
    pub fn remove_entry(&self, path: &str) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ENTRIES)?;
            table.remove(path)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Prefix scan of the `large_files` table bounded to paths under `root`.
    /// Invariant: only ever touches `large_files`, never `entries`/`meta`
    /// (Testable Property 1).
    pub fn get_large_files(
        &self,
        root: &str,
        min_size: i64,
        limit: usize,
    ) -> Result<Vec<(String, LargeFileRecord)>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LARGE_FILES)?;
        let mut out = Vec::new();

        for item in table.range(root..)? {
            let (key, value) = item?;
            let path = key.value();
            if !path.starts_with(root) {
                break; // past the lexicographic run sharing `root` as a prefix
            }
            if !is_path_under(path, root) {
                continue; // e.g. "/a/bcd" lexically follows "/a/b" but isn't under it
            }
            let Some(record) = LargeFileRecord::from_be_bytes(value.value()) else {
                continue;
            };
            if record.size >= min_size {
                out.push((path.to_string(), record));
            }
        }

        out.sort_by(|a, b| b.1.size.cmp(&a.1.size));
        out.truncate(limit);
        Ok(out)
    }

    // ---- meta / roots / schema ------------------------------------------

    pub fn get_index_meta(&self, root: &str) -> Result<Option<IndexMeta>, StorageError> {
        let key = format!("meta:{root}");
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META)?;
        match table.get(key.as_str())? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn put_index_meta(&self, root: &str, meta: &IndexMeta) -> Result<(), StorageError> {
        let key = format!("meta:{root}");
        let encoded = serde_json::to_vec(meta)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(META)?;
            table.insert(key.as_str(), encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_indexed_roots(&self) -> Result<Vec<String>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META)?;
        match table.get(ROOTS_KEY)? {
            Some(v) => Ok(serde_json::from_slice(v.value())?),
            None => Ok(Vec::new()),
        }
    }

    fn put_indexed_roots(&self, roots: &[String]) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec(roots)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(META)?;
            table.insert(ROOTS_KEY, encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// `IsPathCovered(path)`: longest indexed root `R` with `path == R` or
    /// `path` a strict descendant of `R`, else `None`.
    pub fn is_path_covered(&self, path: &str) -> Result<Option<String>, StorageError> {
        let roots = self.get_indexed_roots()?;
        Ok(roots
            .into_iter()
            .filter(|r| is_path_under(path, r))
            .max_by_key(|r| r.len()))
    }

    /// Adds `root` to the indexed-roots set, removing (subsuming) every
    /// previously-indexed root that `root` covers. Returns the subsumed
    /// paths and also clears their store entries via `delete_prefix`.
    pub fn add_indexed_path_with_subsumption(
        &self,
        root: &str,
    ) -> Result<Vec<String>, StorageError> {
        let mut roots = self.get_indexed_roots()?;
        let mut subsumed = Vec::new();
        roots.retain(|r| {
            if r != root && is_path_under(r, root) {
                subsumed.push(r.clone());
                false
            } else {
                true
            }
        });
        if !roots.iter().any(|r| r == root) {
            roots.push(root.to_string());
        }
        self.put_indexed_roots(&roots)?;
        for path in &subsumed {
            self.delete_prefix(path)?;
        }
        Ok(subsumed)
    }

    /// Removes every `entries`/`large_files` key under `prefix` (by path
    /// boundary, not raw string prefix) plus that root's `meta:` record and
    /// membership in the indexed-roots set.
    pub fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut entries = txn.open_table(ENTRIES)?;
            let keys: Vec<String> = entries
                .range(prefix..)?
                .map_while(|item| item.ok())
                .take_while(|(k, _)| k.value().starts_with(prefix))
                .map(|(k, _)| k.value().to_string())
                .filter(|k| is_path_under(k, prefix))
                .collect();
            for key in keys {
                entries.remove(key.as_str())?;
            }

            let mut large_files = txn.open_table(LARGE_FILES)?;
            let keys: Vec<String> = large_files
                .range(prefix..)?
                .map_while(|item| item.ok())
                .take_while(|(k, _)| k.value().starts_with(prefix))
                .map(|(k, _)| k.value().to_string())
                .filter(|k| is_path_under(k, prefix))
                .collect();
            for key in keys {
                large_files.remove(key.as_str())?;
            }

            let mut meta = txn.open_table(META)?;
            meta.remove(format!("meta:{prefix}").as_str())?;
        }
        txn.commit()?;

        let mut roots = self.get_indexed_roots()?;
        roots.retain(|r| r != prefix);
        self.put_indexed_roots(&roots)?;
        Ok(())
    }

    // ---- schema / migration ----------------------------------------------

    pub fn get_schema(&self) -> Result<Option<Schema>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META)?;
        match table.get(SCHEMA_KEY)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// Stamps the current schema version if no schema record exists yet.
    /// Called by the indexer after a from-scratch scan, since a fresh store
    /// is always written in the current (v2) shape and needs no migration.
    pub fn ensure_current_schema(&self) -> Result<(), StorageError> {
        if self.get_schema()?.is_none() {
            self.put_schema(&Schema {
                version: CURRENT_SCHEMA_VERSION,
                updated_at: now_secs(),
            })?;
        }
        Ok(())
    }

    fn put_schema(&self, schema: &Schema) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec(schema)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(META)?;
            table.insert(SCHEMA_KEY, encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn has_any_entries(&self) -> Result<bool, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTRIES)?;
        Ok(table.iter()?.next().is_some())
    }

    pub fn needs_migration(&self) -> Result<bool, StorageError> {
        if !self.has_any_entries()? {
            return Ok(false);
        }
        match self.get_schema()? {
            Some(schema) => Ok(schema.version < CURRENT_SCHEMA_VERSION),
            None => Ok(true),
        }
    }

    /// Runs all pending migration steps in order. Version 2 rebuilds
    /// `large_files` and per-root `meta` entries from the `entries` table.
    /// Cancelling `cancel` aborts cleanly with `StorageError`-free early
    /// return (caller maps that to `SweepError::Cancelled`); a retry starts
    /// the same rebuild again and converges to the same end state.
    pub fn migrate(
        &self,
        large_file_threshold: i64,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(MigrationProgress),
    ) -> Result<bool, StorageError> {
        let from_version = self.get_schema()?.map(|s| s.version).unwrap_or(0);
        if from_version >= CURRENT_SCHEMA_VERSION {
            return Ok(true);
        }

        let entries_total = {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(ENTRIES)?;
            table.len()?
        };

        let mut entries_done: u64 = 0;
        let mut rebuilt_large_files: Vec<(String, LargeFileRecord)> = Vec::new();
        let mut per_root_meta: std::collections::HashMap<String, IndexMeta> =
            std::collections::HashMap::new();
        let roots = self.get_indexed_roots()?;

        let all_entries: Vec<FileEntry> = {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(ENTRIES)?;
            table
                .iter()?
                .filter_map(|item| item.ok())
                .filter_map(|(_, v)| serde_json::from_slice::<FileEntry>(v.value()).ok())
                .collect()
        };

        for entry in &all_entries {
            if cancel.is_cancelled() {
                debug!("migration cancelled mid-rebuild");
                return Ok(false);
            }

            if !entry.is_dir && entry.size >= large_file_threshold {
                rebuilt_large_files.push((
                    entry.path.clone(),
                    LargeFileRecord {
                        size: entry.size,
                        mtime: entry.mtime,
                    },
                ));
            }

            if let Some(root) = roots.iter().find(|r| is_path_under(&entry.path, r)) {
                let m = per_root_meta.entry(root.clone()).or_default();
                if entry.is_dir {
                    m.dirs += 1;
                } else {
                    m.files += 1;
                }
            }

            entries_done += 1;
            if entries_done % 10_000 == 0 {
                on_progress(MigrationProgress {
                    from_version,
                    to_version: CURRENT_SCHEMA_VERSION,
                    entries_total,
                    entries_done,
                    current_path: entry.path.clone(),
                });
            }
        }

        if cancel.is_cancelled() {
            return Ok(false);
        }

        // Rebuild from scratch: clear then repopulate, so a re-run after a
        // prior partial failure converges to the same state.
        {
            let txn = self.db.begin_write()?;
            {
                let mut table = txn.open_table(LARGE_FILES)?;
                let keys: Vec<String> = table
                    .iter()?
                    .filter_map(|item| item.ok())
                    .map(|(k, _)| k.value().to_string())
                    .collect();
                for key in keys {
                    table.remove(key.as_str())?;
                }
            }
            txn.commit()?;
        }
        self.add_large_file_batch(&rebuilt_large_files)?;
        for (root, meta) in &per_root_meta {
            self.put_index_meta(root, meta)?;
        }

        on_progress(MigrationProgress {
            from_version,
            to_version: CURRENT_SCHEMA_VERSION,
            entries_total,
            entries_done,
            current_path: String::new(),
        });

        self.put_schema(&Schema {
            version: CURRENT_SCHEMA_VERSION,
            updated_at: now_secs(),
        })?;
        Ok(true)
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn put_and_get_entry_round_trips() {
        let (_dir, store) = open_temp();
        let entry = FileEntry {
            path: "/tmp/T/a.txt".to_string(),
            size: 10,
            mtime: 100,
            is_dir: false,
            children: vec![],
        };
        store.put_entry(&entry).unwrap();
        let got = store.get_entry("/tmp/T/a.txt").unwrap().unwrap();
        assert_eq!(got, entry);
    }

    #[test]
    fn get_large_files_is_size_filtered_and_sorted_descending() {
        let (_dir, store) = open_temp();
        store
            .add_large_file_batch(&[
                ("/tmp/T/a".to_string(), LargeFileRecord { size: 100, mtime: 1 }),
                (
                    "/tmp/T/b".to_string(),
                    LargeFileRecord {
                        size: 10_000,
                        mtime: 1,
                    },
                ),
                (
                    "/tmp/T/c".to_string(),
                    LargeFileRecord {
                        size: 100_000,
                        mtime: 1,
                    },
                ),
            ])
            .unwrap();

        let results = store.get_large_files("/tmp/T", 5_000, 10).unwrap();
        let sizes: Vec<i64> = results.iter().map(|(_, r)| r.size).collect();
        assert_eq!(sizes, vec![100_000, 10_000]);
    }

    #[test]
    fn get_large_files_respects_path_boundary() {
        let (_dir, store) = open_temp();
        store
            .add_large_file_batch(&[
                (
                    "/a/b/file".to_string(),
                    LargeFileRecord {
                        size: 1_000,
                        mtime: 1,
                    },
                ),
                (
                    "/a/bcd/file".to_string(),
                    LargeFileRecord {
                        size: 1_000,
                        mtime: 1,
                    },
                ),
            ])
            .unwrap();

        let results = store.get_large_files("/a/b", 0, 100).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "/a/b/file");
    }

    #[test]
    fn subsumption_removes_covered_roots() {
        let (_dir, store) = open_temp();
        store
            .add_indexed_path_with_subsumption("/tmp/T/Downloads")
            .unwrap();
        store
            .add_indexed_path_with_subsumption("/tmp/T/Desktop")
            .unwrap();

        let mut roots = store.get_indexed_roots().unwrap();
        roots.sort();
        assert_eq!(roots, vec!["/tmp/T/Desktop", "/tmp/T/Downloads"]);

        let mut subsumed = store.add_indexed_path_with_subsumption("/tmp/T").unwrap();
        subsumed.sort();
        assert_eq!(subsumed, vec!["/tmp/T/Desktop", "/tmp/T/Downloads"]);
        assert_eq!(store.get_indexed_roots().unwrap(), vec!["/tmp/T"]);
    }

    #[test]
    fn is_path_covered_returns_longest_covering_root() {
        let (_dir, store) = open_temp();
        store.add_indexed_path_with_subsumption("/tmp/T").unwrap();
        assert_eq!(
            store.is_path_covered("/tmp/T/sub/file").unwrap(),
            Some("/tmp/T".to_string())
        );
        assert_eq!(store.is_path_covered("/tmp/Other").unwrap(), None);
    }

    #[test]
    fn needs_migration_false_on_empty_store() {
        let (_dir, store) = open_temp();
        assert!(!store.needs_migration().unwrap());
    }

    #[test]
    fn migration_runs_to_current_version_and_is_idempotent() {
        let (_dir, store) = open_temp();
        store
            .put_batch(&[
                FileEntry {
                    path: "/tmp/T".to_string(),
                    size: 0,
                    mtime: 1,
                    is_dir: true,
                    children: vec!["big.bin".to_string()],
                },
                FileEntry {
                    path: "/tmp/T/big.bin".to_string(),
                    size: 20 * 1024 * 1024,
                    mtime: 1,
                    is_dir: false,
                    children: vec![],
                },
            ])
            .unwrap();

        assert!(store.needs_migration().unwrap());
        let cancel = CancellationToken::new();
        store
            .migrate(10 * 1024 * 1024, &cancel, |_| {})
            .unwrap();
        assert!(!store.needs_migration().unwrap());
        assert_eq!(store.get_schema().unwrap().unwrap().version, CURRENT_SCHEMA_VERSION);

        let results = store.get_large_files("/tmp/T", 10 * 1024 * 1024, 100).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "/tmp/T/big.bin");

        // Re-running migrate is a no-op and does not change the end state.
        store.migrate(10 * 1024 * 1024, &cancel, |_| {}).unwrap();
        assert_eq!(store.get_schema().unwrap().unwrap().version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn delete_prefix_removes_entries_and_large_files_under_path() {
        let (_dir, store) = open_temp();
        store
            .put_batch(&[FileEntry {
                path: "/tmp/T/a".to_string(),
                size: 1,
                mtime: 1,
                is_dir: false,
                children: vec![],
            }])
            .unwrap();
        store
            .add_large_file_batch(&[(
                "/tmp/T/a".to_string(),
                LargeFileRecord { size: 1, mtime: 1 },
            )])
            .unwrap();
        store.add_indexed_path_with_subsumption("/tmp/T").unwrap();

        store.delete_prefix("/tmp/T").unwrap();

        assert!(store.get_entry("/tmp/T/a").unwrap().is_none());
        assert!(store.get_large_files("/tmp/T", 0, 10).unwrap().is_empty());
        assert!(store.get_indexed_roots().unwrap().is_empty());
    }
}

//! The daemon's IPC surface: `tonic`-generated `Sweep` trait, bridging
//! `Store`/`Indexer`/`Watcher`/`Broadcaster`/`Filter`/`Tree`.
//!
//! A `tonic::include_proto!` module plus a struct holding shared component
//! handles; streaming RPCs use `mpsc::channel` + `tokio::spawn` +
//! `ReceiverStream`, including the long-lived subscriptions
//! (`WatchLargeFiles`, `WatchIndexProgress`) that must clean up their
//! `Broadcaster` subscription when the client goes away.

use crate::broadcaster::Broadcaster;
use crate::error::SweepError;
use crate::filter::{Candidate, Filter, FilterOptions, SortBy as FilterSortBy};
use crate::indexer::{Indexer, IndexProgress};
use crate::model::{FileEventKind, IndexState};
use crate::store::Store;
use crate::tree::{Tree, TreeNode as LocalTreeNode};
use crate::watcher::Watcher;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

pub mod proto {
    tonic::include_proto!("sweep");
}

use proto::sweep_server::{Sweep, SweepServer};
use proto::{
    ClearCacheResponse, DaemonStatus, Empty, FileEvent as ProtoFileEvent, FileEventType,
    FileInfo, GetLargeFilesRequest, GetTreeRequest, GetTreeResponse, IndexProgress as ProtoProgress,
    IndexStateProto, IndexStatus, PathRequest, ShutdownResponse, SortBy as ProtoSortBy,
    TreeNode as ProtoTreeNode, TriggerIndexRequest, TriggerIndexResponse, WatchLargeFilesRequest,
};

struct RootEntry {
    state: IndexState,
    progress: IndexProgress,
    files: i64,
    dirs: i64,
    cancel: CancellationToken,
}

/// Everything the RPC handlers share. `roots` is the only piece of state
/// that lives purely in memory: it tracks per-root lifecycle tags
/// (`NOT_INDEXED`/`INDEXING`/`READY`/`STALE`) that the store itself has no
/// concept of.
pub struct SweepService {
    store: Store,
    indexer: Arc<Indexer>,
    broadcaster: Arc<Broadcaster>,
    watcher: Arc<Watcher>,
    roots: Arc<Mutex<HashMap<String, RootEntry>>>,
    shutdown: CancellationToken,
    started_at: Instant,
    large_file_threshold: i64,
}

impl SweepService {
    pub fn new(
        store: Store,
        indexer: Arc<Indexer>,
        broadcaster: Arc<Broadcaster>,
        watcher: Arc<Watcher>,
        shutdown: CancellationToken,
        large_file_threshold: i64,
    ) -> Self {
        Self {
            store,
            indexer,
            broadcaster,
            watcher,
            roots: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
            started_at: Instant::now(),
            large_file_threshold,
        }
    }

    /// A clone of the daemon-scoped cancellation token. `main.rs` awaits
    /// `.cancelled()` on this to know when `Shutdown` was called.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

fn index_state_proto(state: IndexState) -> IndexStateProto {
    match state {
        IndexState::NotIndexed => IndexStateProto::NotIndexed,
        IndexState::Indexing => IndexStateProto::Indexing,
        IndexState::Ready => IndexStateProto::Ready,
        IndexState::Stale => IndexStateProto::Stale,
    }
}

fn file_event_type_proto(kind: FileEventKind) -> FileEventType {
    match kind {
        FileEventKind::Created => FileEventType::Created,
        FileEventKind::Modified => FileEventType::Modified,
        FileEventKind::Deleted => FileEventType::Deleted,
        FileEventKind::Renamed => FileEventType::Renamed,
    }
}

/// Converts a rendered tree node to wire format, aggregating large-file
/// size/count bottom-up so a directory reports the total footprint of its
/// over-threshold descendants without a second store scan.
fn to_proto_tree_node(node: &LocalTreeNode, threshold: i64) -> (ProtoTreeNode, u64, u64) {
    if node.is_dir {
        let mut large_size = 0u64;
        let mut large_count = 0u64;
        let children = node
            .children
            .iter()
            .map(|child| {
                let (proto_child, size, count) = to_proto_tree_node(child, threshold);
                large_size += size;
                large_count += count;
                proto_child
            })
            .collect();
        let proto = ProtoTreeNode {
            path: node.path.clone(),
            name: node.name.clone(),
            is_dir: true,
            size: node.size,
            mtime: node.mtime,
            large_file_size: large_size,
            large_file_count: large_count,
            children,
        };
        (proto, large_size, large_count)
    } else {
        let is_large = node.size >= threshold;
        let size = if is_large { node.size as u64 } else { 0 };
        let count = if is_large { 1 } else { 0 };
        let proto = ProtoTreeNode {
            path: node.path.clone(),
            name: node.name.clone(),
            is_dir: false,
            size: node.size,
            mtime: node.mtime,
            large_file_size: size,
            large_file_count: count,
            children: Vec::new(),
        };
        (proto, size, count)
    }
}

impl Sweep for SweepService {
    type GetLargeFilesStream = ReceiverStream<Result<FileInfo, Status>>;
    type WatchIndexProgressStream = ReceiverStream<Result<ProtoProgress, Status>>;
    type WatchLargeFilesStream = ReceiverStream<Result<ProtoFileEvent, Status>>;

    async fn get_large_files(
        &self,
        request: Request<GetLargeFilesRequest>,
    ) -> Result<Response<Self::GetLargeFilesStream>, Status> {
        let req = request.into_inner();

        // Two-pass filtering by design (DESIGN.md "Open Questions resolved"
        // #2): the store's prefix scan already sorts/filters by size, and
        // the Filter below may further restrict the result on top of that.
        let fetch_limit = (10 * req.limit as usize).max(10_000);
        let records = self
            .store
            .get_large_files(&req.path, req.min_size, fetch_limit)
            .map_err(SweepError::Storage)?;
        let candidates: Vec<Candidate> = records
            .into_iter()
            .map(|(path, record)| Candidate {
                path,
                size: record.size,
                mtime: record.mtime,
            })
            .collect();

        let sort_by = ProtoSortBy::try_from(req.sort_by).ok().map(|s| match s {
            ProtoSortBy::SortBySize => FilterSortBy::Size,
            ProtoSortBy::SortByModTime => FilterSortBy::ModTime,
            ProtoSortBy::SortByPath => FilterSortBy::Path,
        });

        let filter = Filter::new(FilterOptions {
            limit: req.limit as usize,
            include: req.include,
            exclude: req.exclude,
            extensions: req.extensions,
            type_groups: req.type_groups,
            older_than_s: (req.older_than_s > 0).then_some(req.older_than_s),
            newer_than_s: (req.newer_than_s > 0).then_some(req.newer_than_s),
            max_depth: (req.max_depth > 0).then_some(req.max_depth as usize),
            sort_by,
            sort_descending: req.sort_desc,
        })
        .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let filtered = filter.apply(&req.path, candidates);

        let (tx, rx) = mpsc::channel(128);
        tokio::spawn(async move {
            for candidate in filtered {
                let info = FileInfo {
                    path: candidate.path,
                    size: candidate.size,
                    mtime: candidate.mtime,
                };
                if tx.send(Ok(info)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_index_status(
        &self,
        request: Request<PathRequest>,
    ) -> Result<Response<IndexStatus>, Status> {
        let req = request.into_inner();
        let covering = self
            .store
            .is_path_covered(&req.path)
            .map_err(SweepError::Storage)?;
        let key = covering.clone().unwrap_or_else(|| req.path.clone());

        let roots = self.roots.lock().unwrap();
        let (state, files, dirs) = match roots.get(&key) {
            Some(entry) => (entry.state, entry.files, entry.dirs),
            None if covering.is_some() => {
                let meta = self
                    .store
                    .get_index_meta(&key)
                    .map_err(SweepError::Storage)?
                    .unwrap_or_default();
                (IndexState::Ready, meta.files, meta.dirs)
            }
            None => (IndexState::NotIndexed, 0, 0),
        };
        drop(roots);

        let progress = match state {
            IndexState::Ready | IndexState::Stale => 1.0,
            IndexState::NotIndexed => 0.0,
            IndexState::Indexing => 0.0,
        };

        Ok(Response::new(IndexStatus {
            path: req.path,
            state: index_state_proto(state) as i32,
            progress,
            files_indexed: files.max(0) as u64,
            dirs_indexed: dirs.max(0) as u64,
        }))
    }

    async fn trigger_index(
        &self,
        request: Request<TriggerIndexRequest>,
    ) -> Result<Response<TriggerIndexResponse>, Status> {
        let req = request.into_inner();
        let path = PathBuf::from(&req.path);
        let root_key = req.path.clone();

        if req.force {
            self.store
                .delete_prefix(&req.path)
                .map_err(SweepError::Storage)?;
        }

        let cancel = {
            let mut roots = self.roots.lock().unwrap();
            if let Some(entry) = roots.get(&root_key) {
                if entry.state == IndexState::Indexing && !req.force {
                    return Ok(Response::new(TriggerIndexResponse {
                        started: false,
                        message: "already indexing".to_string(),
                    }));
                }
            }
            let cancel = self.shutdown.child_token();
            roots.insert(
                root_key.clone(),
                RootEntry {
                    state: IndexState::Indexing,
                    progress: IndexProgress::default(),
                    files: 0,
                    dirs: 0,
                    cancel: cancel.clone(),
                },
            );
            cancel
        };

        let indexer = Arc::clone(&self.indexer);
        let watcher = Arc::clone(&self.watcher);
        let roots = Arc::clone(&self.roots);
        let progress_key = root_key.clone();
        let roots_for_progress = Arc::clone(&roots);

        tokio::task::spawn_blocking(move || {
            let outcome = indexer.index(&path, cancel, move |progress| {
                if let Some(entry) = roots_for_progress.lock().unwrap().get_mut(&progress_key) {
                    entry.progress = progress;
                }
            });

            let mut roots = roots.lock().unwrap();
            match outcome {
                Ok(outcome) => {
                    watcher.watch_root(&path);
                    if let Some(entry) = roots.get_mut(&root_key) {
                        entry.state = IndexState::Ready;
                        entry.files = outcome.files;
                        entry.dirs = outcome.dirs;
                    }
                }
                Err(SweepError::Cancelled) => {
                    roots.remove(&root_key);
                }
                Err(e) => {
                    warn!(root = %root_key, error = %e, "indexing failed");
                    if let Some(entry) = roots.get_mut(&root_key) {
                        entry.state = IndexState::Stale;
                    }
                }
            }
        });

        Ok(Response::new(TriggerIndexResponse {
            started: true,
            message: "indexing started".to_string(),
        }))
    }

    async fn watch_index_progress(
        &self,
        request: Request<PathRequest>,
    ) -> Result<Response<Self::WatchIndexProgressStream>, Status> {
        let req = request.into_inner();
        let roots = Arc::clone(&self.roots);
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            loop {
                ticker.tick().await;
                let sample = {
                    let roots = roots.lock().unwrap();
                    match roots.get(&req.path) {
                        Some(entry) => Some((entry.state, entry.progress.clone())),
                        None => None,
                    }
                };
                let Some((state, progress)) = sample else {
                    break;
                };
                let terminal = matches!(state, IndexState::Ready | IndexState::Stale);
                let message = ProtoProgress {
                    path: req.path.clone(),
                    state: index_state_proto(state) as i32,
                    progress: if terminal { 1.0 } else { 0.0 },
                    files_scanned: progress.files_scanned,
                    dirs_scanned: progress.dirs_scanned,
                    current_path: progress.current_path,
                };
                if tx.send(Ok(message)).await.is_err() || terminal {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_daemon_status(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DaemonStatus>, Status> {
        let pid = Pid::from_u32(std::process::id());
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let memory_bytes = sys.process(pid).map(|p| p.memory()).unwrap_or(0);

        let watched_paths = self
            .store
            .get_indexed_roots()
            .map_err(SweepError::Storage)?;
        let total_files_indexed: i64 = watched_paths
            .iter()
            .filter_map(|root| self.store.get_index_meta(root).ok().flatten())
            .map(|meta| meta.files)
            .sum();

        Ok(Response::new(DaemonStatus {
            running: true,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            memory_bytes,
            watched_paths,
            total_files_indexed: total_files_indexed.max(0) as u64,
        }))
    }

    async fn clear_cache(
        &self,
        request: Request<PathRequest>,
    ) -> Result<Response<ClearCacheResponse>, Status> {
        let req = request.into_inner();
        let meta = self
            .store
            .get_index_meta(&req.path)
            .map_err(SweepError::Storage)?;
        let cleared = meta.map(|m| (m.files + m.dirs).max(0) as u64).unwrap_or(0);

        self.store
            .delete_prefix(&req.path)
            .map_err(SweepError::Storage)?;
        self.watcher.unwatch_root(Path::new(&req.path));
        if let Some(entry) = self.roots.lock().unwrap().remove(&req.path) {
            entry.cancel.cancel();
        }

        info!(path = %req.path, cleared, "cache cleared");
        Ok(Response::new(ClearCacheResponse {
            success: true,
            entries_cleared: cleared,
        }))
    }

    async fn watch_large_files(
        &self,
        request: Request<WatchLargeFilesRequest>,
    ) -> Result<Response<Self::WatchLargeFilesStream>, Status> {
        let req = request.into_inner();
        let (id, mut sub_rx) = self
            .broadcaster
            .subscribe(req.root, req.min_size, &req.exclude)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let broadcaster = Arc::clone(&self.broadcaster);

        let (tx, rx) = mpsc::channel(128);
        tokio::spawn(async move {
            while let Some(event) = sub_rx.recv().await {
                let proto = ProtoFileEvent {
                    r#type: file_event_type_proto(event.kind) as i32,
                    path: event.path,
                    size: event.size,
                    mtime: event.mtime,
                };
                if tx.send(Ok(proto)).await.is_err() {
                    break;
                }
            }
            broadcaster.unsubscribe(id);
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_tree(
        &self,
        request: Request<GetTreeRequest>,
    ) -> Result<Response<GetTreeResponse>, Status> {
        let req = request.into_inner();

        // Built from LargeFileRecords, not the full `entries` listing: per
        // spec.md 4.F, directories containing no qualifying file never
        // appear, which falls out naturally from only ever materializing
        // ancestors of files that already passed the `min_size` cut.
        let large_files = self
            .store
            .get_large_files(&req.root, req.min_size, usize::MAX)
            .map_err(SweepError::Storage)?;
        let qualifying_entries: Vec<_> = large_files
            .into_iter()
            .map(|(path, record)| crate::model::FileEntry {
                path,
                size: record.size,
                mtime: record.mtime,
                is_dir: false,
                children: Vec::new(),
            })
            .collect();
        let tree = Tree::build(&req.root, qualifying_entries);

        let root = tree
            .render(&req.root, None)
            .map(|node| to_proto_tree_node(&node, req.min_size).0);

        // `total_indexed` reports the root's total indexed entry count
        // (files + dirs from the cached `IndexMeta`), independent of how
        // many of them made the `min_size` cut into the rendered tree.
        let total_indexed = self
            .store
            .get_index_meta(&req.root)
            .map_err(SweepError::Storage)?
            .map(|meta| (meta.files + meta.dirs).max(0) as u64)
            .unwrap_or(0);

        Ok(Response::new(GetTreeResponse {
            root,
            total_indexed,
        }))
    }

    async fn shutdown(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<ShutdownResponse>, Status> {
        info!("shutdown requested over rpc");
        self.shutdown.cancel();
        Ok(Response::new(ShutdownResponse { success: true }))
    }
}

pub fn create_server(service: SweepService) -> SweepServer<SweepService> {
    SweepServer::new(service)
}

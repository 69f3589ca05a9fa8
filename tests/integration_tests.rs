//! End-to-end tests wiring `Store`, `Indexer`, `Watcher`, `Broadcaster` and
//! `SweepService` together the way `src/main.rs` does, exercised through the
//! `Sweep` trait directly rather than a live socket (the RPC handler logic
//! is what these tests care about, not the transport).

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use sweep::broadcaster::Broadcaster;
use sweep::indexer::{Indexer, IndexerConfig};
use sweep::model::FileEntry;
use sweep::service::proto::sweep_server::Sweep;
use sweep::service::proto::{
    FileEventType, GetLargeFilesRequest, GetTreeRequest, IndexStateProto, PathRequest,
    TriggerIndexRequest, WatchLargeFilesRequest,
};
use sweep::service::SweepService;
use sweep::store::Store;
use sweep::watcher::{Watcher, WatcherConfig};
use tempfile::TempDir;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::Request;

const THRESHOLD: i64 = 10_000;

/// Builds a full component stack over a fresh store, the way `main.rs`
/// does, but without binding a socket.
fn build_service(store: Store) -> (Arc<Indexer>, Arc<Broadcaster>, Arc<Watcher>, SweepService) {
    let indexer = Arc::new(Indexer::new(
        store.clone(),
        IndexerConfig {
            large_file_threshold: THRESHOLD,
            ..Default::default()
        },
    ));
    let broadcaster = Arc::new(Broadcaster::new());
    let watcher = Watcher::spawn(
        store.clone(),
        Arc::clone(&broadcaster),
        WatcherConfig {
            large_file_threshold: THRESHOLD,
            ..Default::default()
        },
    )
    .unwrap();
    let service = SweepService::new(
        store,
        Arc::clone(&indexer),
        Arc::clone(&broadcaster),
        Arc::clone(&watcher),
        CancellationToken::new(),
        THRESHOLD,
    );
    (indexer, broadcaster, watcher, service)
}

#[tokio::test]
async fn get_large_files_reflects_indexed_threshold() {
    let data = TempDir::new().unwrap();
    fs::write(data.path().join("small.txt"), vec![0u8; 100]).unwrap();
    fs::write(data.path().join("big.bin"), vec![0u8; 20_000]).unwrap();

    let store_dir = TempDir::new().unwrap();
    let store = Store::open(store_dir.path()).unwrap();
    let (indexer, _broadcaster, _watcher, service) = build_service(store);

    indexer
        .index(data.path(), CancellationToken::new(), |_| {})
        .unwrap();

    let root = data.path().canonicalize().unwrap().to_string_lossy().to_string();
    let response = service
        .get_large_files(Request::new(GetLargeFilesRequest {
            path: root,
            ..Default::default()
        }))
        .await
        .unwrap();

    let mut stream = response.into_inner();
    let mut found = Vec::new();
    while let Some(item) = stream.next().await {
        found.push(item.unwrap());
    }

    assert_eq!(found.len(), 1);
    assert!(found[0].path.ends_with("big.bin"));
    assert_eq!(found[0].size, 20_000);
}

#[tokio::test]
async fn trigger_index_then_status_reaches_ready() {
    let data = TempDir::new().unwrap();
    fs::write(data.path().join("a.txt"), vec![0u8; 10]).unwrap();

    let store_dir = TempDir::new().unwrap();
    let store = Store::open(store_dir.path()).unwrap();
    let (_indexer, _broadcaster, _watcher, service) = build_service(store);

    let root = data.path().to_string_lossy().to_string();
    let trigger = service
        .trigger_index(Request::new(TriggerIndexRequest {
            path: root.clone(),
            force: false,
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(trigger.started);

    let mut reached_ready = false;
    for _ in 0..100 {
        let status = service
            .get_index_status(Request::new(PathRequest { path: root.clone() }))
            .await
            .unwrap()
            .into_inner();
        if status.state == IndexStateProto::Ready as i32 {
            reached_ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(reached_ready, "expected index status to reach READY");
}

#[tokio::test]
async fn indexing_a_parent_root_subsumes_an_already_indexed_child() {
    let data = TempDir::new().unwrap();
    let sub = data.path().join("sub");
    fs::create_dir(&sub).unwrap();
    fs::write(sub.join("b.txt"), vec![0u8; 10]).unwrap();
    fs::write(data.path().join("a.txt"), vec![0u8; 10]).unwrap();

    let store_dir = TempDir::new().unwrap();
    let store = Store::open(store_dir.path()).unwrap();
    let (indexer, _broadcaster, _watcher, _service) = build_service(store.clone());

    indexer
        .index(&sub, CancellationToken::new(), |_| {})
        .unwrap();
    indexer
        .index(data.path(), CancellationToken::new(), |_| {})
        .unwrap();

    let roots = store.get_indexed_roots().unwrap();
    let root = data.path().canonicalize().unwrap().to_string_lossy().to_string();
    assert_eq!(roots, vec![root]);
}

#[tokio::test]
async fn watch_large_files_delivers_events_above_threshold() {
    let watch_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let store = Store::open(store_dir.path()).unwrap();
    let (_indexer, _broadcaster, watcher, service) = build_service(store);

    let root = watch_dir.path().canonicalize().unwrap().to_string_lossy().to_string();
    watcher.watch_root(watch_dir.path());

    let response = service
        .watch_large_files(Request::new(WatchLargeFilesRequest {
            root: root.clone(),
            min_size: THRESHOLD,
            exclude: vec![],
        }))
        .await
        .unwrap();
    let mut stream = response.into_inner();

    fs::write(watch_dir.path().join("small.txt"), vec![0u8; 10]).unwrap();
    fs::write(watch_dir.path().join("big.bin"), vec![0u8; 20_000]).unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for a large-file event")
        .expect("stream ended")
        .unwrap();

    assert!(event.path.ends_with("big.bin"));
    assert_eq!(event.size, 20_000);
    assert_eq!(event.r#type, FileEventType::Created as i32);
}

#[tokio::test]
async fn get_tree_aggregates_directory_sizes() {
    // GetTree is built from LargeFileRecords (spec.md §3/§4.F), so only
    // files at or above the daemon's large-file threshold ever appear in
    // it — small files are dropped before the tree ever sees them, not
    // just filtered out at render time.
    let data = TempDir::new().unwrap();
    let sub = data.path().join("sub");
    fs::create_dir(&sub).unwrap();
    fs::write(sub.join("a.txt"), vec![0u8; 20_000]).unwrap();
    fs::write(data.path().join("b.txt"), vec![0u8; 15_000]).unwrap();
    fs::write(data.path().join("tiny.txt"), vec![0u8; 10]).unwrap();

    let store_dir = TempDir::new().unwrap();
    let store = Store::open(store_dir.path()).unwrap();
    let (indexer, _broadcaster, _watcher, service) = build_service(store);

    indexer
        .index(data.path(), CancellationToken::new(), |_| {})
        .unwrap();

    let root = data.path().canonicalize().unwrap().to_string_lossy().to_string();
    let response = service
        .get_tree(Request::new(GetTreeRequest {
            root: root.clone(),
            min_size: 0,
        }))
        .await
        .unwrap()
        .into_inner();

    let tree_root = response.root.expect("tree root should be present");
    assert_eq!(tree_root.size, 35_000);
    assert!(tree_root
        .children
        .iter()
        .any(|c| c.name == "sub" && c.size == 20_000));
    assert!(!tree_root.children.iter().any(|c| c.name == "tiny.txt"));
}

#[tokio::test]
async fn get_tree_min_size_further_restricts_beyond_the_large_file_threshold() {
    let data = TempDir::new().unwrap();
    fs::write(data.path().join("a.bin"), vec![0u8; 20_000]).unwrap();
    fs::write(data.path().join("b.bin"), vec![0u8; 50_000]).unwrap();

    let store_dir = TempDir::new().unwrap();
    let store = Store::open(store_dir.path()).unwrap();
    let (indexer, _broadcaster, _watcher, service) = build_service(store);

    indexer
        .index(data.path(), CancellationToken::new(), |_| {})
        .unwrap();

    let root = data.path().canonicalize().unwrap().to_string_lossy().to_string();
    let response = service
        .get_tree(Request::new(GetTreeRequest {
            root: root.clone(),
            min_size: 30_000,
        }))
        .await
        .unwrap()
        .into_inner();

    let tree_root = response.root.expect("tree root should be present");
    assert_eq!(tree_root.children.len(), 1);
    assert_eq!(tree_root.children[0].name, "b.bin");
}

#[test]
fn migration_from_v1_makes_entries_queryable_through_get_large_files() {
    let store_dir = TempDir::new().unwrap();
    let store = Store::open(store_dir.path()).unwrap();

    // Simulate a pre-migration (v1) store: entries present, no large-file
    // records, no schema stamp.
    store
        .put_batch(&[
            FileEntry {
                path: "/legacy/root".to_string(),
                size: 0,
                mtime: 1,
                is_dir: true,
                children: vec!["huge.bin".to_string()],
            },
            FileEntry {
                path: "/legacy/root/huge.bin".to_string(),
                size: 50 * 1024 * 1024,
                mtime: 1,
                is_dir: false,
                children: vec![],
            },
        ])
        .unwrap();

    assert!(store.needs_migration().unwrap());
    let cancel = CancellationToken::new();
    store.migrate(THRESHOLD, &cancel, |_| {}).unwrap();
    assert!(!store.needs_migration().unwrap());

    let large = store.get_large_files("/legacy/root", 0, 10).unwrap();
    assert_eq!(large.len(), 1);
    assert_eq!(large[0].0, "/legacy/root/huge.bin");
}

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use sweep::model::{FileEntry, LargeFileRecord};
use sweep::store::Store;
use tempfile::TempDir;

fn seeded_store(n: usize) -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let entries: Vec<FileEntry> = (0..n)
        .map(|i| FileEntry {
            path: format!("/bench/root/file-{i}"),
            size: (i as i64) * 1024,
            mtime: 1_700_000_000,
            is_dir: false,
            children: Vec::new(),
        })
        .collect();
    store.put_batch(&entries).unwrap();
    let large_files: Vec<(String, LargeFileRecord)> = entries
        .iter()
        .filter(|e| e.size >= 10 * 1024 * 1024)
        .map(|e| (e.path.clone(), LargeFileRecord { size: e.size, mtime: e.mtime }))
        .collect();
    store.add_large_file_batch(&large_files).unwrap();
    store.add_indexed_path_with_subsumption("/bench/root").unwrap();
    (dir, store)
}

fn bench_put_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_put_batch");
    for size in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let store = Store::open(dir.path()).unwrap();
            let entries: Vec<FileEntry> = (0..size)
                .map(|i| FileEntry {
                    path: format!("/bench/root/file-{i}"),
                    size: 1024,
                    mtime: 1,
                    is_dir: false,
                    children: Vec::new(),
                })
                .collect();
            b.iter(|| store.put_batch(&entries).unwrap());
        });
    }
    group.finish();
}

fn bench_get_large_files(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_get_large_files");
    for size in [1_000usize, 20_000] {
        let (_dir, store) = seeded_store(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| store.get_large_files("/bench/root", 0, 100).unwrap());
        });
    }
    group.finish();
}

fn bench_is_path_covered(c: &mut Criterion) {
    let (_dir, store) = seeded_store(1_000);
    c.bench_function("store_is_path_covered", |b| {
        b.iter(|| store.is_path_covered("/bench/root/file-500").unwrap());
    });
}

criterion_group!(
    benches,
    bench_put_batch,
    bench_get_large_files,
    bench_is_path_covered
);
criterion_main!(benches);

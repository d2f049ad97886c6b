//! Performance benchmarks for Tessera
//!
//! Covers the hot paths of the content store and the layer machinery:
//! splitting and joining payloads, and hashing directory trees.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::fs;
use std::hint::black_box;
use std::time::Duration;
use tempfile::TempDir;
use tessera::digest::TreeDigest;
use tessera::types::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MAX_FILE_SIZE};
use tessera::ContentStore;

fn payload(len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(42);
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes);
    bytes
}

/// Benchmark splitting a stored payload into chunks
fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("split");
    group.measurement_time(Duration::from_secs(3));
    group.sample_size(20);

    for size_mb in [1usize, 4, 16].iter() {
        let data = payload(size_mb * 1024 * 1024);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(format!("{size_mb}MiB")), &data, |b, data| {
            let temp = TempDir::new().unwrap();
            let store = ContentStore::new(temp.path().join("data"), temp.path().join("temp"), MAX_FILE_SIZE, MAX_CHUNK_SIZE);
            let file = store.store(data).unwrap();
            b.iter(|| {
                let mut file = file.clone();
                black_box(file.split(DEFAULT_CHUNK_SIZE).unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark rebuilding a payload from its chunks
fn bench_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("join");
    group.measurement_time(Duration::from_secs(3));
    group.sample_size(20);

    for size_mb in [1usize, 4, 16].iter() {
        let data = payload(size_mb * 1024 * 1024);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(format!("{size_mb}MiB")), &data, |b, data| {
            let temp = TempDir::new().unwrap();
            let store = ContentStore::new(temp.path().join("data"), temp.path().join("temp"), MAX_FILE_SIZE, MAX_CHUNK_SIZE);
            let mut file = store.store(data).unwrap();
            file.split(DEFAULT_CHUNK_SIZE).unwrap();
            let hashes = file.chunk_hashes().unwrap();
            b.iter(|| {
                file.delete().unwrap();
                let mut joined = store.reference_with_chunks(file.digest(), &hashes).unwrap();
                joined.join().unwrap();
                black_box(joined);
            });
        });
    }
    group.finish();
}

/// Benchmark tree digests with varying file counts
fn bench_tree_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_digest");
    group.measurement_time(Duration::from_secs(2));
    group.sample_size(20);

    for file_count in [10, 100, 1000].iter() {
        let temp = TempDir::new().unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for i in 0..*file_count {
            let dir = temp.path().join(format!("dir_{}", i % 10));
            fs::create_dir_all(&dir).unwrap();
            let size = rng.random_range(100..4000);
            let content: Vec<u8> = (0..size).map(|_| rng.random()).collect();
            fs::write(dir.join(format!("file_{i}.txt")), content).unwrap();
        }

        group.bench_with_input(BenchmarkId::from_parameter(file_count), file_count, |b, _| {
            b.iter(|| black_box(TreeDigest::compute(temp.path()).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_split, bench_join, bench_tree_digest);
criterion_main!(benches);

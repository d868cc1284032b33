//! Performance benchmarks for the file hot paths.
//!
//! These benchmarks measure:
//! - Virtual path resolution (accepted and rejected paths)
//! - Directory listings of growing size
//! - Response line encoding for streamed chunks

use std::fs;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use daemon::files::{DirectoryCatalog, PathResolver, Roots};
use protocol::{encode_line, Response, Root};
use tempfile::TempDir;

fn setup() -> (TempDir, PathResolver) {
    let temp = TempDir::new().expect("temp dir");
    let roots = Roots::prepare(&temp.path().join("raw"), &temp.path().join("extracted"))
        .expect("roots");
    (temp, PathResolver::new(roots))
}

/// Benchmark path resolution.
fn bench_resolve(c: &mut Criterion) {
    let (temp, resolver) = setup();
    fs::create_dir_all(temp.path().join("raw/movies/2024")).expect("dirs");

    let mut group = c.benchmark_group("resolve");

    group.bench_function("root", |b| {
        b.iter(|| resolver.resolve(Root::Raw, black_box("")));
    });

    group.bench_function("nested_existing", |b| {
        b.iter(|| resolver.resolve(Root::Raw, black_box("movies/2024")));
    });

    group.bench_function("nested_missing", |b| {
        b.iter(|| resolver.resolve(Root::Raw, black_box("movies/2024/new/file.mkv")));
    });

    group.bench_function("traversal_rejected", |b| {
        b.iter(|| resolver.resolve(Root::Raw, black_box("movies/../../../etc/passwd")));
    });

    group.finish();
}

/// Benchmark directory listing.
fn bench_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("list");

    for count in [10usize, 100, 1000] {
        let (temp, resolver) = setup();
        let dir = temp.path().join("raw");
        for i in 0..count {
            if i % 10 == 0 {
                fs::create_dir(dir.join(format!("dir-{i}"))).expect("dir");
            } else {
                fs::write(dir.join(format!("file-{i}.mkv")), b"x").expect("file");
            }
        }
        let catalog = DirectoryCatalog::new(resolver);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| catalog.list(Root::Raw, black_box("")));
        });
    }

    group.finish();
}

/// Benchmark encoding a 64KB download chunk.
fn bench_chunk_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_encoding");
    let chunk = Response::FileChunk {
        data: vec![0xAB; 64 * 1024],
    };

    group.throughput(Throughput::Bytes(64 * 1024));
    group.bench_function("file_chunk_64KB", |b| {
        b.iter(|| encode_line(black_box(&chunk)));
    });

    group.finish();
}

criterion_group!(benches, bench_resolve, bench_list, bench_chunk_encoding);
criterion_main!(benches);

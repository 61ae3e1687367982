use apfs::block_device::FileBlockDevice;
use criterion::{criterion_group, criterion_main, Criterion};

/// Benchmarks here need a real disk image, which this pack ships none of.
/// Point `APFS_BENCH_IMAGE` at one (a raw container, not a DMG) to run them.
fn open_image() -> Option<FileBlockDevice> {
    let path = std::env::var("APFS_BENCH_IMAGE").ok()?;
    let path = std::path::Path::new(&path);
    if !path.exists() {
        return None;
    }
    let file = std::fs::File::open(path).ok()?;
    // 4096 is the common case; containers with a different block size need
    // APFS_BENCH_IMAGE pointed at a probe step this harness doesn't run.
    FileBlockDevice::new(file, 4096, true).ok()
}

fn bench_open(c: &mut Criterion) {
    if open_image().is_none() {
        eprintln!("Skipping benchmarks - set APFS_BENCH_IMAGE to a raw container image");
        return;
    }

    c.bench_function("apfs_open", |b| {
        b.iter(|| {
            let dev = open_image().unwrap();
            let _vol = apfs::ApfsVolume::open(dev).unwrap();
        })
    });
}

fn bench_list_root(c: &mut Criterion) {
    let dev = match open_image() {
        Some(d) => d,
        None => return,
    };

    let mut vol = apfs::ApfsVolume::open(dev).unwrap();

    c.bench_function("apfs_list_root", |b| {
        b.iter(|| {
            let _entries = vol.list_directory("/").unwrap();
        })
    });
}

fn bench_walk_all(c: &mut Criterion) {
    if open_image().is_none() {
        return;
    }

    c.bench_function("apfs_walk_all", |b| {
        b.iter(|| {
            let dev = open_image().unwrap();
            let mut vol = apfs::ApfsVolume::open(dev).unwrap();
            let _entries = vol.walk().unwrap();
        })
    });
}

fn bench_stat(c: &mut Criterion) {
    let dev = match open_image() {
        Some(d) => d,
        None => return,
    };

    let mut vol = apfs::ApfsVolume::open(dev).unwrap();

    let walk = vol.walk().unwrap();
    let file_path = walk
        .iter()
        .find(|e| e.entry.kind == apfs::EntryKind::File && e.entry.size > 0)
        .map(|e| e.path.clone());

    if let Some(path) = file_path {
        c.bench_function("apfs_stat", |b| {
            b.iter(|| {
                let _stat = vol.stat(&path).unwrap();
            })
        });
    }
}

fn bench_read_small_file(c: &mut Criterion) {
    let dev = match open_image() {
        Some(d) => d,
        None => return,
    };

    let mut vol = apfs::ApfsVolume::open(dev).unwrap();

    let walk = vol.walk().unwrap();
    let file_path = walk
        .iter()
        .find(|e| e.entry.kind == apfs::EntryKind::File && e.entry.size > 0 && e.entry.size < 100_000)
        .map(|e| e.path.clone());

    if let Some(path) = file_path {
        c.bench_function("apfs_read_small_file", |b| {
            b.iter(|| {
                let _data = vol.read_file(&path).unwrap();
            })
        });
    }
}

criterion_group!(benches, bench_open, bench_list_root, bench_walk_all, bench_stat, bench_read_small_file);
criterion_main!(benches);

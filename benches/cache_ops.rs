use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ipcache_rs::{IpCache, IpEntry};
use std::net::IpAddr;

fn addr(i: u32) -> IpAddr {
    IpAddr::from(i.to_be_bytes())
}

fn filled(capacity: usize) -> IpCache {
    let cache = IpCache::new(capacity).unwrap();
    for i in 0..capacity as u32 {
        cache.add(addr(i), IpEntry::new("CH"));
    }
    cache
}

fn bench_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("add");

    // Full cache: every insert evicts
    group.throughput(Throughput::Elements(1));
    group.bench_function("evicting", |b| {
        let cache = filled(1000);
        let mut next = 1000u32;
        b.iter(|| {
            next = next.wrapping_add(1);
            black_box(cache.add(addr(next), IpEntry::new("DE")));
        });
    });

    group.bench_function("update_in_place", |b| {
        let cache = filled(1000);
        let mut i = 0u32;
        b.iter(|| {
            i = (i + 1) % 1000;
            black_box(cache.add(addr(i), IpEntry::new("FR")));
        });
    });

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    let cache = filled(1000);

    group.bench_function("hit", |b| {
        let mut i = 0u32;
        b.iter(|| {
            i = (i + 1) % 1000;
            black_box(cache.get(&addr(i)));
        });
    });

    group.bench_function("miss", |b| {
        b.iter(|| black_box(cache.get(&addr(u32::MAX))));
    });

    group.finish();
}

fn bench_export(c: &mut Criterion) {
    let mut group = c.benchmark_group("export");

    for size in [100usize, 1_000, 10_000] {
        let cache = filled(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("export_bytes", size), &cache, |b, cache| {
            b.iter(|| black_box(cache.export_bytes().unwrap()));
        });

        let bytes = cache.export_bytes().unwrap();
        let target = IpCache::new(size).unwrap();
        group.bench_with_input(BenchmarkId::new("import_bytes", size), &bytes, |b, bytes| {
            b.iter(|| target.import_bytes(black_box(bytes)).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_add, bench_get, bench_export);
criterion_main!(benches);

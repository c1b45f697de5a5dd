use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lsvbd_map::{MapKind, Mapping, SectorMap};

const KEYS: u64 = 10_000;

fn populated(kind: MapKind) -> SectorMap {
    let map = SectorMap::new(kind);
    for i in 1..=KEYS {
        map.insert(i * 8, Mapping::new(i * 8 + 24, 4096)).unwrap();
    }
    map
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_10k");
    for kind in MapKind::ALL {
        group.bench_function(kind.tag(), |b| {
            b.iter(|| {
                let map = SectorMap::new(kind);
                for i in 1..=KEYS {
                    map.insert(i * 8, Mapping::new(i * 8 + 24, 4096)).unwrap();
                }
                black_box(map)
            })
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_hit");
    for kind in MapKind::ALL {
        let map = populated(kind);
        let mut i = 0u64;
        group.bench_function(kind.tag(), |b| {
            b.iter(|| {
                i = i % KEYS + 1;
                black_box(map.lookup(i * 8))
            })
        });
    }
    group.finish();
}

fn bench_predecessor(c: &mut Criterion) {
    let mut group = c.benchmark_group("predecessor_interior");
    for kind in MapKind::ALL {
        let map = populated(kind);
        let mut i = 0u64;
        group.bench_function(kind.tag(), |b| {
            b.iter(|| {
                i = i % KEYS + 1;
                // Interior probe: lands between two mapped keys.
                black_box(map.predecessor(i * 8 + 3))
            })
        });
    }
    group.finish();
}

fn bench_rewrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("rewrite_same_lba");
    for kind in MapKind::ALL {
        let map = populated(kind);
        let mut pba = 1_000_000u64;
        group.bench_function(kind.tag(), |b| {
            b.iter(|| {
                pba += 8;
                map.remove(4096);
                map.insert(4096, Mapping::new(pba, 4096)).unwrap();
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_insert,
    bench_lookup,
    bench_predecessor,
    bench_rewrite
);
criterion_main!(benches);

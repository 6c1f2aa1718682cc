use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use cascadekv::{Config, Db};

fn bench_config() -> Config {
    Config::builder()
        .max_node_children(16)
        .max_pivot_msg_bytes(64 * 1024)
        .writeback_interval(Duration::from_millis(100))
        .build()
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    for size in [64usize, 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let db = Db::open("bench", bench_config()).unwrap();
            let value = vec![0xabu8; size];
            let mut i = 0u64;
            b.iter(|| {
                let key = i.to_be_bytes();
                db.put(black_box(&key), black_box(&value)).unwrap();
                i += 1;
            });
        });
    }
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    group.bench_function("hot_10k", |b| {
        let db = Db::open("bench", bench_config()).unwrap();
        for i in 0u64..10_000 {
            db.put(&i.to_be_bytes(), b"value").unwrap();
        }
        let mut i = 0u64;
        b.iter(|| {
            let key = (i % 10_000).to_be_bytes();
            black_box(db.get(&key).unwrap());
            i += 1;
        });
    });
    group.finish();
}

fn bench_mixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed");
    group.bench_function("90r_10w", |b| {
        let db = Db::open("bench", bench_config()).unwrap();
        for i in 0u64..10_000 {
            db.put(&i.to_be_bytes(), b"value").unwrap();
        }
        let mut i = 0u64;
        b.iter(|| {
            let key = (i % 10_000).to_be_bytes();
            if i % 10 == 0 {
                db.put(black_box(&key), b"updated").unwrap();
            } else {
                black_box(db.get(&key).unwrap());
            }
            i += 1;
        });
    });
    group.finish();
}

criterion_group!(benches, bench_put, bench_get, bench_mixed);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use flowacct_common::{FlowRecord, Primitives};
use flowacct_worker::{AggregationCache, CacheConfig};

fn records(n: u32) -> Vec<FlowRecord> {
    (0..n)
        .map(|i| {
            let b = i.to_be_bytes();
            FlowRecord {
                primitives: Primitives {
                    src_ip: [10, b[1], b[2], b[3], 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
                    src_port: (i % 1024) as u16,
                    ..Default::default()
                },
                pkt_len: 64,
                pkt_num: 1,
                ..Default::default()
            }
        })
        .collect()
}

fn bench_insert(c: &mut Criterion) {
    let distinct = records(4096);
    let hot = records(16);

    c.bench_function("insert 4096 distinct keys", |b| {
        b.iter_batched(
            || AggregationCache::new(CacheConfig::default()),
            |mut cache| {
                for r in &distinct {
                    cache.insert_or_accumulate(black_box(r), 0);
                }
                cache
            },
            BatchSize::LargeInput,
        )
    });

    c.bench_function("accumulate 16 hot keys", |b| {
        let mut cache = AggregationCache::new(CacheConfig::default());
        b.iter(|| {
            for r in &hot {
                cache.insert_or_accumulate(black_box(r), 0);
            }
        })
    });
}

criterion_group!(benches, bench_insert);
criterion_main!(benches);

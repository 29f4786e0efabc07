use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use tessera_core::{Field, FieldType, MemoryBackend, Schema, Table, TableOptions, Value};

// ════════════════════════════════════════════
// Journal + merge benchmarks
// ════════════════════════════════════════════

fn schema() -> Schema {
    Schema::new(
        "bench",
        vec![
            Field::pk("id"),
            Field::new("v", FieldType::I64),
            Field::new("tag", FieldType::String),
        ],
    )
    .unwrap()
}

fn encode(s: &Schema, pks: impl Iterator<Item = u64>) -> Vec<u8> {
    let rows: Vec<_> = pks
        .map(|pk| {
            vec![
                Value::U64(pk),
                Value::I64(pk as i64),
                Value::String(format!("t{}", pk % 97)),
            ]
        })
        .collect();
    s.encode_rows(&rows).unwrap()
}

fn table(pack: usize, journal: usize) -> Table {
    let opts = TableOptions::new()
        .with_pack_size(pack)
        .with_journal_size(journal);
    Table::create(Arc::new(MemoryBackend::new()), schema(), opts).unwrap()
}

fn bench_append_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_merge");

    for size in [1_000u64, 10_000, 100_000].iter() {
        group.throughput(Throughput::Elements(*size));
        let wire = encode(&schema(), (0..*size).map(|_| 0));

        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| {
                let t = table(4_096, 16_384);
                t.insert(black_box(wire)).unwrap();
                t.flush().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_out_of_order_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("out_of_order_updates");

    for size in [1_000u64, 10_000].iter() {
        group.throughput(Throughput::Elements(*size));
        // even keys first, then odd keys land inside full packs
        let evens = encode(&schema(), (1..=*size).map(|i| i * 2));
        let odds = encode(&schema(), (0..*size).map(|i| i * 2 + 1));

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let t = table(1_024, 8_192);
                t.update(&evens).unwrap();
                t.flush().unwrap();
                t.update(black_box(&odds)).unwrap();
                t.flush().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_delete_merge(c: &mut Criterion) {
    let size = 20_000u64;
    let wire = encode(&schema(), (0..size).map(|_| 0));
    let doomed: Vec<u64> = (1..=size).step_by(3).collect();

    c.bench_function("delete_every_third", |b| {
        b.iter(|| {
            let t = table(4_096, 32_768);
            t.insert(&wire).unwrap();
            t.flush().unwrap();
            t.delete(black_box(&doomed)).unwrap();
            t.flush().unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_append_merge,
    bench_out_of_order_updates,
    bench_delete_merge
);
criterion_main!(benches);

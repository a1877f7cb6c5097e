//! Benchmarks for canonical hashing and checkpoint encoding.

use auditflow::canonical::{decode_tagged_row, encode_tagged_row, stable_hash_row};
use auditflow::values::{RowData, RowValue};
use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn sample_row(width: usize) -> RowData {
    let mut row = RowData::new()
        .with("id", 42)
        .with("name", "Ada Lovelace")
        .with("score", 97.5)
        .with("seen_at", Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
        .with(
            "tags",
            RowValue::Array(vec!["analytical".into(), "engine".into()]),
        );
    for i in 0..width {
        row.insert(format!("field_{i}"), i64::try_from(i).unwrap());
    }
    row
}

fn canonical_benchmark(c: &mut Criterion) {
    let narrow = sample_row(0);
    let wide = sample_row(100);

    c.bench_function("stable_hash_row/narrow", |b| {
        b.iter(|| stable_hash_row(black_box(&narrow)).unwrap())
    });
    c.bench_function("stable_hash_row/wide", |b| {
        b.iter(|| stable_hash_row(black_box(&wide)).unwrap())
    });

    let encoded = encode_tagged_row(&wide).unwrap();
    c.bench_function("encode_tagged_row/wide", |b| {
        b.iter(|| encode_tagged_row(black_box(&wide)).unwrap())
    });
    c.bench_function("decode_tagged_row/wide", |b| {
        b.iter(|| decode_tagged_row(black_box(&encoded)).unwrap())
    });
}

criterion_group!(benches, canonical_benchmark);
criterion_main!(benches);

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tandem_text::{fix_out_of_date, merge, BufferConfig, OtBuffer, Transform};

fn bench_fix_out_of_date(c: &mut Criterion) {
    let pre = Transform::new(2, 5, "replacement", 2);
    let sub = Transform::new(6, 3, "edit", 2);

    c.bench_function("fix_out_of_date", |b| {
        b.iter(|| {
            let mut sub = sub.clone();
            fix_out_of_date(&mut sub, black_box(&pre));
            black_box(sub)
        })
    });
}

fn bench_merge(c: &mut Criterion) {
    let first = Transform::new(5, 0, "hello", 0);
    let second = Transform::new(7, 4, "y world", 0);

    c.bench_function("merge_overlap", |b| {
        b.iter(|| {
            let mut first = first.clone();
            black_box(merge(&mut first, black_box(&second)));
            first
        })
    });
}

fn bench_push_1000_stale(c: &mut Criterion) {
    c.bench_function("push_1000_stale_transforms", |b| {
        b.iter(|| {
            let content = "hello world";
            let mut buffer = OtBuffer::new(content, BufferConfig::default());
            for i in 0..1000 {
                // Every transform lags ten versions behind.
                let version = (buffer.version() + 1 - 10).max(2).min(i + 2);
                let ot = Transform::new(0, 0, "x", version);
                black_box(buffer.push_transform(ot).ok());
            }
            buffer
        })
    });
}

fn bench_flush_1000(c: &mut Criterion) {
    c.bench_function("flush_1000_transforms", |b| {
        b.iter(|| {
            let mut content = String::from("The quick brown fox jumps over the lazy dog.");
            let mut buffer = OtBuffer::new(&content, BufferConfig::default());
            for i in 0..1000 {
                let version = buffer.version() + 1;
                let ot = Transform::new(i % 40, 1, "ab", version);
                black_box(buffer.push_transform(ot).ok());
            }
            buffer.flush_transforms(&mut content, 60).ok();
            content
        })
    });
}

criterion_group!(
    benches,
    bench_fix_out_of_date,
    bench_merge,
    bench_push_1000_stale,
    bench_flush_1000,
);
criterion_main!(benches);

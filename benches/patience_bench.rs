use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use medley::text::{matching_blocks, Annotator, Key, Line, Merge3, MergeOptions, MemoryStore};

fn make_lines(count: usize, salt: usize) -> Vec<Line> {
    (0..count)
        .map(|i| {
            // every 17th line differs between salts
            let tag = if i % 17 == 0 { salt } else { 0 };
            Bytes::from(format!("line {} {}\n", i, tag))
        })
        .collect()
}

fn bench_matching_blocks(c: &mut Criterion) {
    let mut group = c.benchmark_group("matching_blocks");

    for line_count in [100, 1_000, 10_000].iter() {
        let a = make_lines(*line_count, 1);
        let b = make_lines(*line_count, 2);

        group.bench_with_input(
            BenchmarkId::from_parameter(line_count),
            line_count,
            |bench, _| {
                bench.iter(|| matching_blocks(black_box(&a), black_box(&b)));
            },
        );
    }
    group.finish();
}

fn bench_merge3(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge3");

    for line_count in [100, 1_000, 10_000].iter() {
        let base = make_lines(*line_count, 0);
        let a = make_lines(*line_count, 1);
        let b = make_lines(*line_count, 2);
        let opts = MergeOptions::default();

        group.bench_with_input(
            BenchmarkId::from_parameter(line_count),
            line_count,
            |bench, _| {
                bench.iter(|| Merge3::new(black_box(&base), &a, &b).merge_lines(&opts));
            },
        );
    }
    group.finish();
}

fn bench_annotate_linear_history(c: &mut Criterion) {
    let mut group = c.benchmark_group("annotate_linear");

    for revisions in [10, 100].iter() {
        let mut store = MemoryStore::new();
        let mut parents = Vec::new();
        let mut tip = Key::from("rev-0");
        for rev in 0..*revisions {
            tip = Key::from(format!("rev-{}", rev));
            store.add_lines(tip.clone(), parents, make_lines(500, rev));
            parents = vec![tip.clone()];
        }

        group.bench_with_input(
            BenchmarkId::from_parameter(revisions),
            revisions,
            |bench, _| {
                bench.iter(|| {
                    let mut annotator = Annotator::new(&store);
                    annotator.annotate(black_box(&tip)).unwrap()
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_matching_blocks,
    bench_merge3,
    bench_annotate_linear_history
);
criterion_main!(benches);

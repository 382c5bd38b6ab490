use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kolosal_runner::dataset::{Dataset, SubsampleCacheStrategy};
use kolosal_runner::problem_info::Task;
use ndarray::{Array1, Array2};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

fn create_classification_data(n_rows: usize, n_features: usize, strategy: SubsampleCacheStrategy) -> Dataset {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let x = Array2::from_shape_fn((n_rows, n_features), |_| rng.gen::<f64>() * 10.0);
    let y: Array1<f64> = (0..n_rows).map(|i| (i % 3) as f64).collect();
    Dataset::builder(x, y, Task::Classification)
        .with_split_percentages(7, 0.1, 0.2)
        .with_subsample_strategy(strategy)
        .build()
        .unwrap()
}

fn bench_subsample(c: &mut Criterion) {
    let mut group = c.benchmark_group("subsample");

    for n_rows in [1_000, 10_000, 50_000].iter() {
        let classic = create_classification_data(*n_rows, 10, SubsampleCacheStrategy::ClassicNoCache);
        group.bench_with_input(BenchmarkId::new("classic", n_rows), &classic, |b, ds| {
            b.iter(|| ds.subsample(black_box(25.0), 3).unwrap())
        });

        let preshuffled = create_classification_data(*n_rows, 10, SubsampleCacheStrategy::Preshuffle);
        group.bench_with_input(BenchmarkId::new("preshuffle", n_rows), &preshuffled, |b, ds| {
            b.iter(|| ds.subsample(black_box(25.0), 3).unwrap())
        });
    }

    group.finish();
}

fn bench_identifier(c: &mut Criterion) {
    let mut group = c.benchmark_group("identifier");

    for n_rows in [1_000, 10_000].iter() {
        let ds = create_classification_data(*n_rows, 20, SubsampleCacheStrategy::Classic);
        group.bench_with_input(BenchmarkId::new("get_identifier", n_rows), &ds, |b, ds| {
            b.iter(|| black_box(ds.get_identifier().unwrap()))
        });
    }

    group.finish();
}

fn bench_splits(c: &mut Criterion) {
    let ds = create_classification_data(10_000, 10, SubsampleCacheStrategy::Classic);
    c.bench_function("get_train_set", |b| b.iter(|| black_box(ds.get_train_set().unwrap())));
}

criterion_group!(benches, bench_subsample, bench_identifier, bench_splits);
criterion_main!(benches);

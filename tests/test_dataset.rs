//! Integration test: dataset splits, subsampling and caching

use std::collections::HashSet;

use ndarray::{array, Array1, Array2};
use polars::df;

use kolosal_runner::cache::{CacheStoreHandle, FileCacheStore};
use kolosal_runner::constants::cache_keys;
use kolosal_runner::data::{LabeledFrame, INDEX_COLUMN};
use kolosal_runner::dataset::{Dataset, SubsampleCacheStrategy};
use kolosal_runner::logging::ExecutionContext;
use kolosal_runner::metrics::names;
use kolosal_runner::pipeline::registry::ESTIMATORS_MODULE;
use kolosal_runner::pipeline::{ObjectSpec, PipelineSpec, SpecClass};
use kolosal_runner::problem_info::Task;
use kolosal_runner::runner::{ClientRunner, Regime, RunOptions};

fn imbalanced_classification(n: usize, strategy: SubsampleCacheStrategy) -> Dataset {
    let x = Array2::from_shape_fn((n, 3), |(i, j)| (i * 3 + j) as f64 / 10.0);
    // 60 / 40 class split
    let y: Array1<f64> = (0..n).map(|i| if i % 5 < 3 { 0.0 } else { 1.0 }).collect();
    Dataset::builder(x, y, Task::Classification)
        .with_train_valid_indices((0..n).collect(), vec![])
        .with_subsample_strategy(strategy)
        .build()
        .unwrap()
}

fn class_counts(ds: &Dataset) -> (usize, usize) {
    let train = ds.get_train_set().unwrap();
    let ones = train.y.iter().filter(|&&v| v == 1.0).count();
    (train.len() - ones, ones)
}

#[test]
fn test_preshuffle_subsamples_are_nested() {
    let ds = imbalanced_classification(30, SubsampleCacheStrategy::Preshuffle);
    let quarter = ds.subsample(25.0, 11).unwrap().train_indices().unwrap().unwrap();
    let half = ds.subsample(50.0, 11).unwrap().train_indices().unwrap().unwrap();
    let most = ds.subsample(75.0, 11).unwrap().train_indices().unwrap().unwrap();

    // ceil(p * n)
    assert_eq!(quarter.len(), 8);
    assert_eq!(half.len(), 15);
    assert_eq!(most.len(), 23);
    assert_eq!(&half[..quarter.len()], quarter.as_slice(), "25% is not a prefix of 50%");
    assert_eq!(&most[..half.len()], half.as_slice(), "50% is not a prefix of 75%");
}

#[test]
fn test_preshuffle_is_idempotent_on_large_split() {
    let ds = imbalanced_classification(1000, SubsampleCacheStrategy::Preshuffle);
    let first = ds.subsample(10.0, 7).unwrap().train_indices().unwrap().unwrap();
    let second = ds.subsample(10.0, 7).unwrap().train_indices().unwrap().unwrap();
    let wider = ds.subsample(20.0, 7).unwrap().train_indices().unwrap().unwrap();

    assert_eq!(first.len(), 100);
    assert_eq!(first, second);
    assert_eq!(wider.len(), 200);
    assert_eq!(&wider[..100], first.as_slice());
}

#[test]
fn test_classic_subsample_is_stratified_and_seeded() {
    let ds = imbalanced_classification(100, SubsampleCacheStrategy::ClassicNoCache);
    let a = ds.subsample(50.0, 5).unwrap();
    let b = ds.subsample(50.0, 5).unwrap();
    assert_eq!(a.train_indices().unwrap(), b.train_indices().unwrap(), "same seed, different rows");
    assert_eq!(a.get_identifier().unwrap(), b.get_identifier().unwrap());
    assert_ne!(a.get_identifier().unwrap(), ds.get_identifier().unwrap());

    let (zeros, ones) = class_counts(&a);
    assert_eq!(zeros + ones, 50);
    assert!(zeros.abs_diff(30) <= 1 && ones.abs_diff(20) <= 1, "proportions drifted: {} / {}", zeros, ones);

    let unique: HashSet<usize> = a.train_indices().unwrap().unwrap().iter().copied().collect();
    assert_eq!(unique.len(), 50, "subsample drew a row twice");
}

#[test]
fn test_classic_keeps_floor_of_percent() {
    let ds = imbalanced_classification(100, SubsampleCacheStrategy::ClassicNoCache);
    for k in [29.0, 57.0, 58.0] {
        let n = ds.subsample(k, 13).unwrap().train_indices().unwrap().unwrap().len();
        assert_eq!(n, k as usize, "k={} -> {}", k, n);
    }
}

#[test]
fn test_subsample_of_cached_dataset() {
    let mut ds = imbalanced_classification(50, SubsampleCacheStrategy::Classic);
    let full_train = ds.get_train_set().unwrap();
    ds.cache_dataset(false).unwrap();
    assert!(!ds.is_resident(cache_keys::X));

    let sub = ds.subsample(50.0, 1).unwrap();
    let train = sub.get_train_set().unwrap();
    assert_eq!(train.len(), 25);
    assert_eq!(train.x.ncols(), full_train.x.ncols());
    assert!(!ds.is_resident(cache_keys::X), "subsampling reloaded the parent");
}

#[test]
fn test_cached_dataset_still_serves_splits() {
    let dir = tempfile::tempdir().unwrap();
    let mut ds = Dataset::builder(
        Array2::from_shape_fn((12, 2), |(i, j)| (i + j) as f64),
        (0..12).map(|i| i as f64).collect::<Array1<f64>>(),
        Task::Regression,
    )
    .with_split_percentages(3, 0.25, 0.25)
    .with_cache_store(CacheStoreHandle::File(FileCacheStore::new(dir.path().join("store"))))
    .build()
    .unwrap();
    let id_before = ds.get_identifier().unwrap();
    let train_before = ds.get_train_set().unwrap();

    ds.cache_dataset(false).unwrap();
    assert!(!ds.is_resident(cache_keys::X), "X should be evicted after caching");
    assert_eq!(ds.get_identifier().unwrap(), id_before);
    assert_eq!(ds.get_train_set().unwrap(), train_before);

    {
        let open = ds.open_dataset().unwrap();
        assert!(open.is_resident(cache_keys::X));
        assert_eq!(open.get_test_set().unwrap().len(), 3);
    }
    assert!(!ds.is_resident(cache_keys::X), "open scope leaked resident fields");

    let sub = ds.subsample(50.0, 1).unwrap();
    assert_eq!(sub.train_indices().unwrap().unwrap().len(), 3);
    assert!(ds.clear_cache());
}

#[test]
fn test_runner_trains_on_cached_dataset() {
    let x = Array2::from_shape_fn((16, 1), |(i, _)| i as f64);
    let y = x.column(0).mapv(|v| 3.0 * v - 2.0);
    let mut ds = Dataset::builder(x, y, Task::Regression)
        .with_train_valid_indices((0..12).collect(), (12..16).collect())
        .build()
        .unwrap();
    ds.cache_dataset(false).unwrap();

    let spec = PipelineSpec::new(
        "linear-cached",
        vec![ObjectSpec::new(SpecClass::Estimator, ESTIMATORS_MODULE, "LinearRegression")],
    );
    let runner = ClientRunner::new(vec![names::R2.to_string()], Task::Regression, ExecutionContext::default(), false, false);
    let options = RunOptions::default().with_enforce_limits(false);
    let (result, error) = runner.run(&ds, &spec, &ds.get_problem_info(), &[Regime::TrainAndValidation], &options);

    assert!(error.is_none(), "run failed: {:?}", error);
    let r2 = result.unwrap().validation_metrics.unwrap()[names::R2].as_f64().unwrap();
    assert!((r2 - 1.0).abs() < 1e-8, "r2 = {}", r2);
    assert!(!ds.is_resident(cache_keys::X), "caller's dataset was reopened");
}

#[test]
fn test_polars_frame_splits_by_row_label() {
    let df = df!(
        "size" => &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        "rooms" => &[1i32, 1, 2, 2, 3, 3],
        INDEX_COLUMN => &[40u64, 41, 42, 43, 44, 45]
    )
    .unwrap();
    let frame = LabeledFrame::from_polars(df).unwrap();
    let y = array![3.0, 5.0, 8.0, 10.0, 13.0, 15.0];
    let ds = Dataset::builder(frame, y, Task::Regression)
        .with_train_valid_indices(vec![40, 41, 43, 44], vec![42, 45])
        .build()
        .unwrap();

    let valid = ds.get_valid_set().unwrap();
    assert_eq!(valid.y, array![8.0, 15.0]);
    assert_eq!(valid.x.to_dense().unwrap(), array![[3.0, 2.0], [6.0, 3.0]]);
    assert_eq!(ds.meta().raw_column_names.as_deref(), Some(&["size".to_string(), "rooms".to_string()][..]));

    let spec = PipelineSpec::new(
        "linear-frame",
        vec![ObjectSpec::new(SpecClass::Estimator, ESTIMATORS_MODULE, "LinearRegression")],
    );
    let runner = ClientRunner::new(vec![names::R2.to_string()], Task::Regression, ExecutionContext::default(), false, false);
    let options = RunOptions::default().with_enforce_limits(false);
    let (result, error) = runner.run(&ds, &spec, &ds.get_problem_info(), &[Regime::TrainAndValidation], &options);
    assert!(error.is_none(), "run failed: {:?}", error);
    let r2 = result.unwrap().validation_metrics.unwrap()[names::R2].as_f64().unwrap();
    assert!((r2 - 1.0).abs() < 1e-8, "r2 = {}", r2);
}

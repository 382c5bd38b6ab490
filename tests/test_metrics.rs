//! Integration test: scoring façade and fold aggregation

use ndarray::{array, Array2};

use kolosal_runner::constants::timing;
use kolosal_runner::dataset::Dataset;
use kolosal_runner::logging::ExecutionContext;
use kolosal_runner::metrics::{
    names, score_classification, score_regression, ClassificationInput, MetricValue, RegressionInput,
};
use kolosal_runner::pipeline::registry::ESTIMATORS_MODULE;
use kolosal_runner::pipeline::{ObjectSpec, PipelineSpec, SpecClass};
use kolosal_runner::problem_info::Task;
use kolosal_runner::runner::{ClientRunner, Regime, RunOptions};

fn metric_list(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn confusion_total(value: &MetricValue) -> f64 {
    match value {
        MetricValue::Table { values, .. } => values.iter().flatten().sum(),
        other => panic!("confusion matrix is not a table: {:?}", other),
    }
}

#[test]
fn test_regression_scalars() {
    let y_true = array![1.0, 2.0, 3.0, 4.0];
    let y_pred = array![1.5, 2.0, 2.5, 4.0];
    let input = RegressionInput {
        y_min: Some(1.0),
        y_max: Some(4.0),
        ..RegressionInput::new(&y_true, &y_pred)
    };
    let scores = score_regression(&input, &metric_list(&[names::MAE, names::NORMALIZED_MAE, names::MEDIAN_AE]));
    assert!((scores[names::MAE].as_f64().unwrap() - 0.25).abs() < 1e-12);
    assert!((scores[names::NORMALIZED_MAE].as_f64().unwrap() - 0.25 / 3.0).abs() < 1e-12);
    assert!((scores[names::MEDIAN_AE].as_f64().unwrap() - 0.25).abs() < 1e-12);
}

#[test]
fn test_binary_metrics_are_nan_for_multiclass() {
    let y_true = array![0.0, 1.0, 2.0, 1.0];
    let y_pred = array![0.0, 1.0, 2.0, 2.0];
    let labels = [0.0, 1.0, 2.0];
    let input = ClassificationInput {
        y_true: &y_true,
        y_pred: &y_pred,
        y_proba: None,
        train_labels: &labels,
        class_labels: &labels,
        y_transformer: None,
        use_binary: true,
        sample_weight: None,
    };
    let scores = score_classification(&input, &metric_list(&[names::ACCURACY, names::F1_BINARY]));
    assert_eq!(scores[names::ACCURACY].as_f64(), Some(0.75));
    assert!(scores[names::F1_BINARY].as_f64().unwrap().is_nan());
}

#[test]
fn test_cv_aggregation_through_runner() {
    let x = Array2::from_shape_fn((24, 2), |(i, j)| if j == 0 { (i % 12) as f64 } else { (i / 12) as f64 * 10.0 });
    let y = x.column(1).mapv(|v| if v > 5.0 { 1.0 } else { 0.0 });
    let dataset = Dataset::builder(x, y, Task::Classification).with_k_fold(3, 9).build().unwrap();
    let metrics = metric_list(&[names::ACCURACY, names::CONFUSION_MATRIX]);
    let runner = ClientRunner::new(metrics, Task::Classification, ExecutionContext::default(), false, true);
    let spec = PipelineSpec::new(
        "knn",
        vec![ObjectSpec::new(SpecClass::Estimator, ESTIMATORS_MODULE, "KNeighborsClassifier")],
    );
    let options = RunOptions::default().with_enforce_limits(false);

    let (result, error) = runner.run(
        &dataset,
        &spec,
        &dataset.get_problem_info(),
        &[Regime::MeanCrossValidation],
        &options,
    );
    assert!(error.is_none(), "run failed: {:?}", error);
    let result = result.unwrap();
    let folds = result.cv_metrics.as_ref().unwrap();
    let mean = result.cv_mean_metrics.as_ref().unwrap();
    assert_eq!(folds.len(), 3);

    for key in timing::ALL {
        let expected = folds.iter().map(|f| f[key].as_f64().unwrap()).sum::<f64>() / 3.0;
        assert!((mean[key].as_f64().unwrap() - expected).abs() < 1e-12, "{} is not the fold mean", key);
    }
    assert_eq!(mean[names::ACCURACY].as_f64(), Some(1.0));
    assert_eq!(confusion_total(&mean[names::CONFUSION_MATRIX]), 24.0);
    assert!(
        matches!(mean.get(&names::extras_of(names::ACCURACY)), Some(MetricValue::Table { .. })),
        "confidence interval missing from the mean: {:?}",
        mean.keys().collect::<Vec<_>>()
    );
    assert!(!mean.contains_key(&names::extras_of(names::CONFUSION_MATRIX)));
}

//! Integration test: pipeline specs from dict form to fitted chains

use ndarray::{array, Array1, Array2};
use serde_json::json;

use kolosal_runner::estimators::Learner;
use kolosal_runner::dataset::Dataset;
use kolosal_runner::logging::ExecutionContext;
use kolosal_runner::metrics::names;
use kolosal_runner::pipeline::registry::{ENSEMBLE_MODULE, ESTIMATORS_MODULE, PREPROCESSING_MODULE};
use kolosal_runner::pipeline::{ObjectSpec, PipelineSpec, SpecClass};
use kolosal_runner::problem_info::{ProblemInfo, Task};
use kolosal_runner::runner::{ClientRunner, Regime, RunOptions};

const SCALED_RIDGE: &str = r#"{
    "pipeline_id": "scaled-ridge",
    "objects": [
        {"spec_class": "preproc", "module": "kolosal.preprocessing", "class_name": "StandardScaler",
         "param_args": [], "param_kwargs": {"with_mean": true}},
        {"spec_class": "sklearn", "module": "kolosal.estimators", "class_name": "Ridge",
         "param_args": [], "param_kwargs": {"alpha": 0.001}},
        {"spec_class": "y_transformer", "module": "kolosal.y_transformers", "class_name": "TargetStandardizer",
         "param_args": [], "param_kwargs": {}}
    ]
}"#;

fn plane(n: usize) -> (Array2<f64>, Array1<f64>) {
    let x = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { i as f64 } else { (i % 4) as f64 });
    let y: Array1<f64> = x.rows().into_iter().map(|r| 1.5 * r[0] - 2.0 * r[1] + 4.0).collect();
    (x, y)
}

fn regression_runner() -> ClientRunner {
    ClientRunner::new(vec![names::R2.to_string()], Task::Regression, ExecutionContext::default(), false, false)
}

fn member(class_name: &str) -> serde_json::Value {
    PipelineSpec::new(
        format!("member-{}", class_name),
        vec![ObjectSpec::new(SpecClass::Estimator, ESTIMATORS_MODULE, class_name)],
    )
    .to_dict()
    .unwrap()
}

#[test]
fn test_json_round_trip_builds_identical_chains() {
    let spec = PipelineSpec::from_json(SCALED_RIDGE).unwrap();
    let again = PipelineSpec::from_json(&spec.to_json().unwrap()).unwrap();
    assert_eq!(spec, again);
    assert_eq!(spec.terminal_class_name(), Some("Ridge"));

    let (x, y) = plane(24);
    let mut first = spec.instantiate(&mut ProblemInfo::new(Task::Regression), 3, false, None, None).unwrap();
    let mut second = again.instantiate(&mut ProblemInfo::new(Task::Regression), 3, false, None, None).unwrap();
    first.fit(&x, &y, None).unwrap();
    second.fit(&x, &y, None).unwrap();

    let unseen = array![[30.0, 1.0], [31.0, 3.0]];
    let (a, b) = (first.predict(&unseen).unwrap(), second.predict(&unseen).unwrap());
    assert_eq!(a, b);
    assert!((a[0] - 47.0).abs() < 0.1, "extrapolation off: {}", a[0]);
}

#[test]
fn test_categorical_dataset_routes_through_runner() {
    let x = array![
        [0.1, 0.0, 3.0],
        [0.2, 1.0, 2.5],
        [0.3, 0.0, 3.5],
        [0.4, 1.0, 2.0],
        [5.1, 2.0, 9.0],
        [5.2, 2.0, 8.5],
        [5.3, 1.0, 9.5],
        [5.4, 2.0, 8.0]
    ];
    let y = array![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0];
    let dataset = Dataset::builder(x, y, Task::Classification)
        .with_train_valid_indices(vec![0, 1, 2, 4, 5, 6], vec![3, 7])
        .with_categorical(vec![false, true, false])
        .build()
        .unwrap();
    let info = dataset.get_problem_info();
    assert_eq!(info.dataset_categoricals, Some(vec![false, true, false]));

    let spec = PipelineSpec::new(
        "scaled-tree",
        vec![
            ObjectSpec::new(SpecClass::Preprocessor, PREPROCESSING_MODULE, "StandardScaler"),
            ObjectSpec::new(SpecClass::Estimator, ESTIMATORS_MODULE, "DecisionTreeClassifier"),
        ],
    );
    let mut routed = info.clone();
    spec.instantiate(&mut routed, 0, false, None, None).unwrap();
    assert_eq!(routed.pipeline_categoricals, Some(vec![true, false, false]));

    let runner = ClientRunner::new(vec![names::ACCURACY.to_string()], Task::Classification, ExecutionContext::default(), false, false);
    let options = RunOptions::default().with_enforce_limits(false);
    let (result, error) = runner.run(&dataset, &spec, &info, &[Regime::TrainAndValidation], &options);
    assert!(error.is_none(), "run failed: {:?}", error);
    let accuracy = result.unwrap().validation_metrics.unwrap()[names::ACCURACY].as_f64().unwrap();
    assert_eq!(accuracy, 1.0);
}

#[test]
fn test_voting_ensemble_through_runner() {
    let (x, y) = plane(30);
    let dataset = Dataset::builder(x, y, Task::Regression)
        .with_split_percentages(1, 0.0, 0.2)
        .build()
        .unwrap();
    let spec = PipelineSpec::new(
        "vote",
        vec![ObjectSpec::new(SpecClass::Ensemble, ENSEMBLE_MODULE, "VotingEnsemble")
            .with_kwarg("pipelines", json!([member("LinearRegression"), member("Ridge")]))
            .with_kwarg("weights", json!([0.5, 0.5]))],
    );
    let options = RunOptions::default().with_enforce_limits(false).with_ensemble(true);
    let (result, error) = regression_runner().run(
        &dataset,
        &spec,
        &dataset.get_problem_info(),
        &[Regime::TrainAndValidation],
        &options,
    );
    assert!(error.is_none(), "run failed: {:?}", error);
    let r2 = result.unwrap().validation_metrics.unwrap()[names::R2].as_f64().unwrap();
    assert!(r2 > 0.95, "voting r2 = {}", r2);
}

#[test]
fn test_stack_ensemble_scores_with_relearned_meta() {
    let (x, y) = plane(40);
    let dataset = Dataset::builder(x, y, Task::Regression)
        .with_split_percentages(2, 0.0, 0.25)
        .build()
        .unwrap();
    let spec = PipelineSpec::new(
        "stack",
        vec![ObjectSpec::new(SpecClass::SdkEnsemble, ENSEMBLE_MODULE, "StackEnsemble")
            .with_kwarg("pipelines", json!([member("LinearRegression"), member("Ridge")]))],
    );
    assert!(spec.is_ensemble());
    let options = RunOptions::default().with_enforce_limits(false).with_models(true);
    let (result, error) = regression_runner().run(
        &dataset,
        &spec,
        &dataset.get_problem_info(),
        &[Regime::TrainAndValidation, Regime::TrainFull],
        &options,
    );
    assert!(error.is_none(), "run failed: {:?}", error);
    let result = result.unwrap();
    let r2 = result.validation_metrics.as_ref().unwrap()[names::R2].as_f64().unwrap();
    assert!(r2 > 0.5, "stack r2 = {}", r2);
    let models = result.models.as_ref().unwrap();
    assert_eq!(models[Regime::TrainAndValidation.as_str()].len(), 1);
    assert_eq!(models[Regime::TrainFull.as_str()].len(), 1);
}

//! Turning a [`PipelineSpec`] into a runnable [`Chain`]

use serde_json::{json, Value};
use tracing::{debug, info};

use super::chain::{Chain, Container, Pipeline, Step, StepKind};
use super::params::Params;
use super::registry::{Builder, ComponentEntry, ComponentRegistry, EnsembleKind, TIMESERIES_MODULE};
use super::spec::{ObjectSpec, PipelineSpec, SpecClass};
use crate::constants::{model_names, TIMESERIES_PARAM_DICT};
use crate::dataset::DatasetMeta;
use crate::error::{ConfigErrorKind, Result, RunnerError};
use crate::estimators::{
    ColumnIdentity, ColumnUnion, Estimator, MetaLearner, MetaLearnerDescriptor, Preprocessor, StackEnsemble,
    VotingEnsemble, YTransformer,
};
use crate::problem_info::ProblemInfo;

/// Legacy streaming hyperparameter names and their current spelling
const STREAMING_ALIASES: [(&str, &str); 5] = [
    ("learning_rate_init", "eta0"),
    ("l2_regularization", "alpha"),
    ("epochs", "max_iter"),
    ("n_iter", "max_iter"),
    ("loss_function", "loss"),
];

/// Everything instantiation reads besides the spec itself
pub struct InstantiateContext<'a> {
    pub registry: &'a ComponentRegistry,
    pub random_state: u64,
    pub is_sparse: bool,
    pub preprocess_step: Option<(String, Preprocessor)>,
    pub dataset_metadata: Option<&'a DatasetMeta>,
}

impl PipelineSpec {
    /// Build the chain with the built-in registry
    ///
    /// `problem_info.pipeline_categoricals` is updated when categorical
    /// columns are routed around the preprocessors.
    pub fn instantiate(
        &self,
        problem_info: &mut ProblemInfo,
        random_state: u64,
        is_sparse: bool,
        preprocess_step: Option<(String, Preprocessor)>,
        dataset_metadata: Option<&DatasetMeta>,
    ) -> Result<Chain> {
        let registry = ComponentRegistry::builtin();
        let ctx = InstantiateContext {
            registry: &registry,
            random_state,
            is_sparse,
            preprocess_step,
            dataset_metadata,
        };
        self.instantiate_with(&ctx, problem_info)
    }

    pub fn instantiate_with(&self, ctx: &InstantiateContext<'_>, problem_info: &mut ProblemInfo) -> Result<Chain> {
        let (y_objects, objects): (Vec<&ObjectSpec>, Vec<&ObjectSpec>) = self
            .objects
            .iter()
            .partition(|o| o.spec_class == SpecClass::YTransformer);

        let (terminal, preproc_objects) = match objects.split_last() {
            Some((last, rest)) if last.spec_class.is_estimator() => (*last, rest),
            _ => {
                return Err(RunnerError::ConfigError(ConfigErrorKind::Other(format!(
                    "pipeline {} does not end in an estimator",
                    self.pipeline_id
                ))))
            }
        };

        let mut steps = Vec::with_capacity(objects.len() + 1);
        for obj in preproc_objects {
            if obj.spec_class != SpecClass::Preprocessor {
                return Err(RunnerError::ConfigError(ConfigErrorKind::Other(format!(
                    "{} must be the last step of pipeline {}",
                    obj.class_name, self.pipeline_id
                ))));
            }
            steps.push(build_preprocessor(obj, ctx)?);
        }

        let categorical_mask = problem_info
            .dataset_categoricals
            .clone()
            .or_else(|| ctx.dataset_metadata.and_then(|m| m.categorical.clone()));
        if let Some(mask) = categorical_mask.filter(|m| m.iter().any(|&c| c)) {
            if model_names::is_categorical_aware(&terminal.class_name) {
                steps = route_categoricals(steps, &mask);
                let layout = match steps.last().map(|s| &s.kind) {
                    Some(StepKind::Preprocessor(Preprocessor::ColumnIdentity(id))) => id.mask.clone(),
                    _ => mask.clone(),
                };
                debug!(pipeline_id = %self.pipeline_id, n_categorical = layout.iter().filter(|&&c| c).count(), "Routing categorical columns around preprocessors");
                problem_info.pipeline_categoricals = Some(layout);
            }
        }

        steps.push(build_estimator(terminal, ctx, problem_info)?);

        let container = Container::from_class_name(self.class_name.as_deref())?;
        let mut chain = Chain::Steps(Pipeline::new(container, steps)?);

        for obj in y_objects {
            chain = chain.wrap(build_y_transformer(obj, ctx)?);
        }

        if let Some((name, preprocessor)) = ctx.preprocess_step.clone() {
            chain.prepend_step(Step::new(name, StepKind::Preprocessor(preprocessor)));
        }

        info!(pipeline_id = %self.pipeline_id, steps = ?chain.step_names(), "Instantiated pipeline");
        Ok(chain)
    }
}

fn params_for(obj: &ObjectSpec) -> Result<Params> {
    if !obj.param_args.is_empty() {
        return Err(RunnerError::invalid_option(
            "param_args",
            Value::Array(obj.param_args.clone()),
            format!("{} takes keyword arguments only", obj.class_name),
        ));
    }
    Ok(Params::new(obj.param_kwargs.clone()))
}

fn resolve<'r>(registry: &'r ComponentRegistry, obj: &ObjectSpec) -> Result<&'r ComponentEntry> {
    if model_names::is_classical_timeseries(&obj.class_name) {
        registry.resolve(TIMESERIES_MODULE, &obj.class_name)
    } else {
        registry.resolve(&obj.module, &obj.class_name)
    }
}

fn wrong_kind(obj: &ObjectSpec, expected: &str) -> RunnerError {
    RunnerError::ConfigError(ConfigErrorKind::Other(format!(
        "{} is registered but is not a {}",
        obj.class_string(),
        expected
    )))
}

fn finish_step(name: &str, kind: StepKind, params: Params) -> Step {
    let mut step = Step::new(name, kind);
    step.extra_options = params.into_extra_options();
    if !step.extra_options.is_empty() {
        debug!(step = name, options = ?step.extra_options.keys().collect::<Vec<_>>(), "Carrying unread constructor options");
    }
    step
}

fn build_preprocessor(obj: &ObjectSpec, ctx: &InstantiateContext<'_>) -> Result<Step> {
    let entry = resolve(ctx.registry, obj)?;
    let mut params = params_for(obj)?;
    // Centering would densify sparse input
    if ctx.is_sparse && obj.class_name == "StandardScaler" {
        params.set_default("with_mean", json!(false));
    }
    match entry.builder {
        Builder::Preprocessor(ctor) => {
            let p = ctor(&mut params)?;
            Ok(finish_step(&obj.class_name, StepKind::Preprocessor(p), params))
        }
        _ => Err(wrong_kind(obj, "preprocessor")),
    }
}

fn build_y_transformer(obj: &ObjectSpec, ctx: &InstantiateContext<'_>) -> Result<YTransformer> {
    let entry = resolve(ctx.registry, obj)?;
    let mut params = params_for(obj)?;
    match entry.builder {
        Builder::YTransformer(ctor) => ctor(&mut params),
        _ => Err(wrong_kind(obj, "y_transformer")),
    }
}

/// Wrap each preprocessor so categorical columns bypass it, then record the
/// resulting layout with a trailing identity step
fn route_categoricals(steps: Vec<Step>, mask: &[bool]) -> Vec<Step> {
    if steps.is_empty() {
        return steps;
    }
    let mut layout = mask.to_vec();
    let mut routed = Vec::with_capacity(steps.len() + 1);
    for step in steps {
        match step.kind {
            StepKind::Preprocessor(p) => {
                let union = ColumnUnion::from_mask(&layout, p);
                layout = union.output_mask();
                routed.push(Step {
                    name: step.name,
                    kind: StepKind::Preprocessor(Preprocessor::ColumnUnion(union)),
                    extra_options: step.extra_options,
                });
            }
            StepKind::Estimator(_) => routed.push(step),
        }
    }
    routed.push(Step::new(
        "ColumnIdentity",
        StepKind::Preprocessor(Preprocessor::ColumnIdentity(ColumnIdentity { mask: layout })),
    ));
    routed
}

fn prepare_estimator_params(
    params: &mut Params,
    entry: &ComponentEntry,
    obj: &ObjectSpec,
    ctx: &InstantiateContext<'_>,
    info: &ProblemInfo,
) {
    if entry.declares("random_state") {
        params.set("random_state", json!(ctx.random_state));
    }
    if entry.declares("n_jobs") {
        params.set("n_jobs", json!(info.num_threads));
    }
    if entry.declares("problem_info") {
        params.attach_problem_info(info.clone());
    }
    if entry.declares("max_iter") && !entry.declares("n_iter") {
        params.rename("n_iter", "max_iter");
    }

    match obj.spec_class {
        SpecClass::Streaming => {
            for (legacy, current) in STREAMING_ALIASES {
                params.rename(legacy, current);
            }
            params.set("enable_cache", json!(false));
            if info.enable_streaming {
                let names = info.column_names.clone().unwrap_or_default();
                let features = if names.feature.is_empty() {
                    ctx.dataset_metadata
                        .and_then(|m| m.raw_column_names.clone())
                        .unwrap_or_default()
                } else {
                    names.feature
                };
                params.set("feature_column_names", json!(features));
                if let Some(label) = names.label {
                    params.set("label_column_name", json!(label));
                }
                if let Some(weight) = names.weight {
                    params.set("weight_column_name", json!(weight));
                }
            }
        }
        SpecClass::Timeseries => {
            let ts = info
                .timeseries_param_dict
                .clone()
                .or_else(|| ctx.dataset_metadata.and_then(|m| m.timeseries_param_dict.clone()));
            if let Some(ts) = ts {
                params.set(TIMESERIES_PARAM_DICT, json!(ts));
            }
        }
        _ => {}
    }
}

fn build_estimator(obj: &ObjectSpec, ctx: &InstantiateContext<'_>, info: &ProblemInfo) -> Result<Step> {
    let entry = resolve(ctx.registry, obj)?;
    let mut params = params_for(obj)?;
    let estimator = match entry.builder {
        Builder::Estimator(ctor) => {
            prepare_estimator_params(&mut params, entry, obj, ctx, info);
            let estimator = ctor(&mut params)?;
            if obj.spec_class == SpecClass::Streaming && !estimator.is_streaming() {
                return Err(wrong_kind(obj, "streaming estimator"));
            }
            estimator
        }
        Builder::Ensemble(kind) => build_ensemble(kind, &mut params, ctx, info)?,
        _ => return Err(wrong_kind(obj, "estimator")),
    };
    Ok(finish_step(&obj.class_name, StepKind::Estimator(estimator), params))
}

fn build_ensemble(
    kind: EnsembleKind,
    params: &mut Params,
    ctx: &InstantiateContext<'_>,
    info: &ProblemInfo,
) -> Result<Estimator> {
    let inner_specs = match params.take("pipelines") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(text) => PipelineSpec::from_json(text),
                other => PipelineSpec::from_dict(other),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(other) => return Err(RunnerError::invalid_option("pipelines", other, "expected a list of pipeline specs")),
        None => return Err(RunnerError::invalid_option("pipelines", "None", "ensembles need inner pipelines")),
    };

    let inner_ctx = InstantiateContext {
        registry: ctx.registry,
        random_state: ctx.random_state,
        is_sparse: ctx.is_sparse,
        preprocess_step: None,
        dataset_metadata: ctx.dataset_metadata,
    };
    let members = inner_specs
        .iter()
        .map(|spec| spec.instantiate_with(&inner_ctx, &mut info.clone()))
        .collect::<Result<Vec<_>>>()?;

    let weights = params.opt_f64_vec("weights")?;
    let is_classification = !info.task.is_regression_like();

    match kind {
        EnsembleKind::Voting => Ok(Estimator::VotingEnsemble(VotingEnsemble::new(members, weights, is_classification)?)),
        EnsembleKind::Stack => {
            let (meta, trained) = if let Some(path) = params.opt_string("meta_learner_file")? {
                (MetaLearner::load(std::path::Path::new(&path))?, true)
            } else if let Some(value) = params.take("meta_learner") {
                let descriptor: MetaLearnerDescriptor = match value {
                    Value::String(text) => serde_json::from_str(&text)?,
                    other => serde_json::from_value(other)?,
                };
                descriptor.into_meta_learner()?
            } else {
                (MetaLearner::default_for(is_classification), false)
            };
            let mut stack = StackEnsemble::new(members, meta, trained, is_classification, ctx.random_state)?;
            if let Some(folds) = params.opt_usize("n_folds")? {
                stack.n_folds = folds;
            }
            Ok(Estimator::StackEnsemble(stack))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimators::Learner;
    use crate::pipeline::registry::{ENSEMBLE_MODULE, ESTIMATORS_MODULE, PREPROCESSING_MODULE};
    use crate::problem_info::Task;
    use ndarray::array;

    fn obj(class: SpecClass, module: &str, name: &str) -> ObjectSpec {
        ObjectSpec::new(class, module, name)
    }

    #[test]
    fn test_kwargs_injection_and_extras() {
        let spec = PipelineSpec::new(
            "p",
            vec![obj(SpecClass::Estimator, ESTIMATORS_MODULE, "LogisticRegression")
                .with_kwarg("C", json!(0.5))
                .with_kwarg("n_iter", json!(50))
                .with_kwarg("verbose", json!(2))],
        );
        let mut info = ProblemInfo::new(Task::Classification).with_num_threads(3);
        let chain = spec.instantiate(&mut info, 11, false, None, None).unwrap();
        let step = &chain.steps()[0];
        assert_eq!(step.extra_options.get("verbose").map(String::as_str), Some("2"));
        assert!(!step.extra_options.contains_key("n_iter"));
        match chain.terminal_estimator() {
            Some(Estimator::LogisticRegression(lr)) => {
                assert_eq!(lr.c, 0.5);
                assert_eq!(lr.max_iter, 50);
            }
            other => panic!("unexpected estimator {:?}", other.map(Estimator::name)),
        }
    }

    #[test]
    fn test_unknown_class_is_model_not_supported() {
        let spec = PipelineSpec::new("p", vec![obj(SpecClass::Timeseries, "x", "AutoArima")]);
        let err = spec.instantiate(&mut ProblemInfo::new(Task::Forecasting), 0, false, None, None).unwrap_err();
        assert!(matches!(
            err,
            RunnerError::ConfigError(ConfigErrorKind::ModelNotSupported { ref class_name }) if class_name == "AutoArima"
        ));
    }

    #[test]
    fn test_categorical_routing_reorders_layout() {
        let spec = PipelineSpec::new(
            "p",
            vec![
                obj(SpecClass::Preprocessor, PREPROCESSING_MODULE, "StandardScaler"),
                obj(SpecClass::Estimator, ESTIMATORS_MODULE, "DecisionTreeClassifier"),
            ],
        );
        let mut info = ProblemInfo::new(Task::Classification).with_dataset_categoricals(vec![false, true, false]);
        let chain = spec.instantiate(&mut info, 0, false, None, None).unwrap();
        assert_eq!(info.pipeline_categoricals, Some(vec![true, false, false]));
        assert_eq!(chain.step_names(), vec!["StandardScaler", "ColumnIdentity", "DecisionTreeClassifier"]);
        match chain.terminal_estimator() {
            Some(Estimator::DecisionTreeClassifier(_)) => {}
            other => panic!("unexpected estimator {:?}", other.map(Estimator::name)),
        }
    }

    #[test]
    fn test_no_routing_for_unaware_estimator() {
        let spec = PipelineSpec::new(
            "p",
            vec![
                obj(SpecClass::Preprocessor, PREPROCESSING_MODULE, "StandardScaler"),
                obj(SpecClass::Estimator, ESTIMATORS_MODULE, "LogisticRegression"),
            ],
        );
        let mut info = ProblemInfo::new(Task::Classification).with_dataset_categoricals(vec![true, false]);
        let chain = spec.instantiate(&mut info, 0, false, None, None).unwrap();
        assert!(info.pipeline_categoricals.is_none());
        assert_eq!(chain.steps().len(), 2);
    }

    #[test]
    fn test_y_transformer_and_dataset_step() {
        let spec = PipelineSpec::new(
            "p",
            vec![
                obj(SpecClass::Estimator, ESTIMATORS_MODULE, "LinearRegression"),
                obj(SpecClass::YTransformer, "y", "TargetStandardizer"),
            ],
        );
        let mut info = ProblemInfo::new(Task::Regression);
        let mut chain = spec
            .instantiate(&mut info, 0, false, Some(("datatransformer".to_string(), Preprocessor::Identity)), None)
            .unwrap();
        assert_eq!(chain.y_transformers().len(), 1);
        assert_eq!(chain.step_names(), vec!["datatransformer", "LinearRegression"]);
        chain.fit(&array![[0.0], [1.0], [2.0]], &array![1.0, 3.0, 5.0], None).unwrap();
        assert!((chain.predict(&array![[3.0]]).unwrap()[0] - 7.0).abs() < 1e-8);
    }

    #[test]
    fn test_voting_ensemble_recurses() {
        let inner = |name: &str| {
            PipelineSpec::new("inner", vec![obj(SpecClass::Estimator, ESTIMATORS_MODULE, name)])
                .to_dict()
                .unwrap()
        };
        let spec = PipelineSpec::new(
            "ens",
            vec![obj(SpecClass::Ensemble, ENSEMBLE_MODULE, "VotingEnsemble")
                .with_kwarg("pipelines", json!([inner("LinearRegression"), inner("Ridge")]))
                .with_kwarg("weights", json!([1.0, 1.0]))],
        );
        let chain = spec.instantiate(&mut ProblemInfo::new(Task::Regression), 0, false, None, None).unwrap();
        match chain.terminal_estimator() {
            Some(Estimator::VotingEnsemble(v)) => assert_eq!(v.members.len(), 2),
            other => panic!("unexpected estimator {:?}", other.map(Estimator::name)),
        }
    }

    #[test]
    fn test_stack_meta_descriptor_string() {
        let inner = PipelineSpec::new("i", vec![obj(SpecClass::Estimator, ESTIMATORS_MODULE, "Ridge")])
            .to_dict()
            .unwrap();
        let spec = PipelineSpec::new(
            "stack",
            vec![obj(SpecClass::SdkEnsemble, ENSEMBLE_MODULE, "StackEnsemble")
                .with_kwarg("pipelines", json!([inner]))
                .with_kwarg("meta_learner", json!(r#"{"kind":"elastic_net","alpha":0.01}"#))],
        );
        let chain = spec.instantiate(&mut ProblemInfo::new(Task::Regression), 0, false, None, None).unwrap();
        match chain.terminal_estimator() {
            Some(Estimator::StackEnsemble(s)) => assert!(!s.meta_is_pretrained()),
            other => panic!("unexpected estimator {:?}", other.map(Estimator::name)),
        }
    }
}

//! Runnable pipelines: preprocessors followed by one estimator

use std::collections::BTreeMap;

use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigErrorKind, Result, RunnerError};
use crate::estimators::{Estimator, Learner, Preprocessor, Transformer, YTransformer};

/// Rows per `partial_fit` call in a streaming container
pub const STREAMING_BATCH_ROWS: usize = 256;

/// Container named by the spec's chain class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Container {
    Sequential,
    Streaming,
}

impl Container {
    /// Container for a chain class name; `None` means sequential
    pub fn from_class_name(class_name: Option<&str>) -> Result<Self> {
        match class_name {
            None | Some("Pipeline") | Some("SequentialPipeline") => Ok(Container::Sequential),
            Some("StreamingPipeline") | Some("NimbusPipeline") => Ok(Container::Streaming),
            Some(other) => Err(RunnerError::model_not_supported(other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepKind {
    Preprocessor(Preprocessor),
    Estimator(Estimator),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    /// Constructor keys the adapter did not read, as JSON text
    pub extra_options: BTreeMap<String, String>,
}

impl Step {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            extra_options: BTreeMap::new(),
        }
    }
}

/// Preprocessors then exactly one estimator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub container: Container,
    pub steps: Vec<Step>,
}

impl Pipeline {
    pub fn new(container: Container, steps: Vec<Step>) -> Result<Self> {
        let pipeline = Self { container, steps };
        pipeline.validate()?;
        Ok(pipeline)
    }

    fn validate(&self) -> Result<()> {
        let n = self.steps.len();
        let shape_ok = n > 0
            && self.steps[..n - 1]
                .iter()
                .all(|s| matches!(s.kind, StepKind::Preprocessor(_)))
            && matches!(self.steps[n - 1].kind, StepKind::Estimator(_));
        if shape_ok {
            Ok(())
        } else {
            Err(RunnerError::ConfigError(ConfigErrorKind::Other(
                "a pipeline is zero or more preprocessors followed by one estimator".to_string(),
            )))
        }
    }

    pub fn estimator(&self) -> Option<&Estimator> {
        match self.steps.last().map(|s| &s.kind) {
            Some(StepKind::Estimator(e)) => Some(e),
            _ => None,
        }
    }

    fn estimator_mut(&mut self) -> Result<&mut Estimator> {
        match self.steps.last_mut().map(|s| &mut s.kind) {
            Some(StepKind::Estimator(e)) => Ok(e),
            _ => Err(RunnerError::ModelNotFitted),
        }
    }

    fn fit_preprocessors(&mut self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let mut xt = x.clone();
        for step in self.steps.iter_mut() {
            if let StepKind::Preprocessor(p) = &mut step.kind {
                xt = p.fit_transform(&xt)?;
            }
        }
        Ok(xt)
    }

    fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let mut xt = x.clone();
        for step in &self.steps {
            if let StepKind::Preprocessor(p) = &step.kind {
                xt = p.transform(&xt)?;
            }
        }
        Ok(xt)
    }

    fn fit_estimator(&mut self, x: &Array2<f64>, y: &Array1<f64>, w: Option<&Array1<f64>>) -> Result<()> {
        let container = self.container;
        let estimator = self.estimator_mut()?;
        let name = estimator.name();
        let result = match (container, estimator.as_streaming_mut()) {
            (Container::Streaming, Some(streaming)) => {
                let mut start = 0;
                while start < x.nrows() {
                    let end = (start + STREAMING_BATCH_ROWS).min(x.nrows());
                    let xb = x.slice(s![start..end, ..]).to_owned();
                    let yb = y.slice(s![start..end]).to_owned();
                    let wb = w.map(|w| w.slice(s![start..end]).to_owned());
                    streaming.partial_fit(&xb, &yb, wb.as_ref())?;
                    start = end;
                }
                debug!(learner = name, rows = x.nrows(), "Streamed training batches");
                Ok(())
            }
            _ => estimator.fit(x, y, w),
        };
        result.map_err(|e| match e {
            RunnerError::FitError { .. }
            | RunnerError::ConfigError(_)
            | RunnerError::DataError(_)
            | RunnerError::ShapeError { .. } => e,
            other => RunnerError::FitError {
                learner: name.to_string(),
                message: other.to_string(),
            },
        })
    }
}

impl Learner for Pipeline {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        let xt = self.fit_preprocessors(x)?;
        self.fit_estimator(&xt, y, sample_weight)
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let estimator = self.estimator().ok_or(RunnerError::ModelNotFitted)?;
        estimator.predict(&self.transform(x)?)
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Option<Array2<f64>>> {
        let estimator = self.estimator().ok_or(RunnerError::ModelNotFitted)?;
        estimator.predict_proba(&self.transform(x)?)
    }

    fn classes(&self) -> Option<&[f64]> {
        self.estimator().and_then(|e| e.classes())
    }
}

/// A pipeline, possibly wrapped in target transforms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Chain {
    Steps(Pipeline),
    YTransformed { transformer: YTransformer, inner: Box<Chain> },
}

impl Chain {
    fn pipeline(&self) -> &Pipeline {
        match self {
            Chain::Steps(p) => p,
            Chain::YTransformed { inner, .. } => inner.pipeline(),
        }
    }

    fn pipeline_mut(&mut self) -> &mut Pipeline {
        match self {
            Chain::Steps(p) => p,
            Chain::YTransformed { inner, .. } => inner.pipeline_mut(),
        }
    }

    pub fn wrap(self, transformer: YTransformer) -> Self {
        Chain::YTransformed {
            transformer,
            inner: Box::new(self),
        }
    }

    pub fn terminal_estimator(&self) -> Option<&Estimator> {
        self.pipeline().estimator()
    }

    /// Registered class name of the terminal estimator
    pub fn estimator_name(&self) -> &'static str {
        self.terminal_estimator().map_or("<none>", Estimator::name)
    }

    pub fn is_streaming(&self) -> bool {
        self.pipeline().container == Container::Streaming
    }

    pub fn steps(&self) -> &[Step] {
        &self.pipeline().steps
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps().iter().map(|s| s.name.as_str()).collect()
    }

    /// Insert `step` ahead of every other step of the innermost pipeline
    pub fn prepend_step(&mut self, step: Step) {
        self.pipeline_mut().steps.insert(0, step);
    }

    /// Unfitted copy used only for scoring, for chains ending in a stack
    ///
    /// A stack's meta-learner may have been trained on the rows being
    /// scored, so metrics come from a copy that relearns it.
    pub fn scoring_copy(&self) -> Option<Chain> {
        let stack = match self.terminal_estimator() {
            Some(Estimator::StackEnsemble(stack)) => stack.fit_for_scoring(),
            _ => return None,
        };
        let mut copy = self.clone();
        match copy.pipeline_mut().estimator_mut() {
            Ok(estimator) => *estimator = Estimator::StackEnsemble(stack),
            Err(_) => return None,
        }
        Some(copy)
    }

    pub fn y_transformers(&self) -> Vec<&YTransformer> {
        match self {
            Chain::Steps(_) => Vec::new(),
            Chain::YTransformed { transformer, inner } => {
                let mut v = vec![transformer];
                v.extend(inner.y_transformers());
                v
            }
        }
    }
}

impl Learner for Chain {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        match self {
            Chain::Steps(p) => p.fit(x, y, sample_weight),
            Chain::YTransformed { transformer, inner } => {
                transformer.fit(y)?;
                let yt = transformer.transform(y)?;
                inner.fit(x, &yt, sample_weight)
            }
        }
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        match self {
            Chain::Steps(p) => p.predict(x),
            Chain::YTransformed { transformer, inner } => transformer.inverse_transform(&inner.predict(x)?),
        }
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Option<Array2<f64>>> {
        match self {
            Chain::Steps(p) => p.predict_proba(x),
            Chain::YTransformed { inner, .. } => inner.predict_proba(x),
        }
    }

    fn classes(&self) -> Option<&[f64]> {
        match self {
            Chain::Steps(p) => p.classes(),
            Chain::YTransformed { inner, .. } => inner.classes(),
        }
    }
}

//! Regime execution inside the training task

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use ndarray::{Array1, Array2, Axis};
use tracing::{debug, error, info};

use super::{Regime, RunOptions, ScoringSettings, TrainingResult};
use crate::constants::model_names;
use crate::dataset::{Dataset, DatasetTransformers, LabelEncoder, SplitData, TimeseriesTransformer};
use crate::error::{Result, RunnerError};
use crate::estimators::Learner;
use crate::metrics::{
    aggregate_scores, attach_timing, bootstrap_extras, score_classification, score_forecasting, score_regression,
    ClassificationInput, ForecastInput, MetricMap, RegressionInput,
};
use crate::pipeline::{Chain, PipelineSpec};
use crate::problem_info::{ProblemInfo, Task};

/// One candidate against one dataset
pub(crate) struct CandidateRun<'a> {
    dataset: &'a Dataset,
    spec: &'a PipelineSpec,
    problem_info: ProblemInfo,
    options: &'a RunOptions,
    scoring: &'a ScoringSettings,
    transformers: Option<Arc<DatasetTransformers>>,
    class_labels: Option<Arc<Vec<f64>>>,
    is_timeseries: bool,
    ensemble: bool,
}

/// Output of one fitted chain on one split, kept for rescoring resamples
#[derive(Clone)]
struct Predictions {
    y_true: Array1<f64>,
    y_pred: Array1<f64>,
    y_proba: Option<Array2<f64>>,
    train_labels: Vec<f64>,
    sample_weight: Option<Array1<f64>>,
    horizons: Option<Vec<f64>>,
    grain_ids: Option<Vec<f64>>,
    train_y: Option<Array1<f64>>,
    train_grain_ids: Option<Vec<f64>>,
}

impl Predictions {
    fn resample(&self, rows: &[usize]) -> Self {
        let pick = |v: &Vec<f64>| rows.iter().map(|&r| v[r]).collect::<Vec<f64>>();
        Self {
            y_true: self.y_true.select(Axis(0), rows),
            y_pred: self.y_pred.select(Axis(0), rows),
            y_proba: self.y_proba.as_ref().map(|p| p.select(Axis(0), rows)),
            train_labels: self.train_labels.clone(),
            sample_weight: self.sample_weight.as_ref().map(|w| w.select(Axis(0), rows)),
            horizons: self.horizons.as_ref().map(pick),
            grain_ids: self.grain_ids.as_ref().map(pick),
            train_y: self.train_y.clone(),
            train_grain_ids: self.train_grain_ids.clone(),
        }
    }
}

fn all_nan<'v>(mut values: impl Iterator<Item = &'v f64>) -> bool {
    let mut any = false;
    let every = values.all(|v| {
        any = true;
        v.is_nan()
    });
    any && every
}

fn as_predict_error(e: RunnerError) -> RunnerError {
    match e {
        RunnerError::PredictError(_) => e,
        other => RunnerError::PredictError(other.to_string()),
    }
}

impl<'a> CandidateRun<'a> {
    pub(crate) fn new(
        dataset: &'a Dataset,
        spec: &'a PipelineSpec,
        problem_info: ProblemInfo,
        options: &'a RunOptions,
        scoring: &'a ScoringSettings,
    ) -> Result<Self> {
        Ok(Self {
            transformers: dataset.transformers()?,
            class_labels: dataset.class_labels()?,
            is_timeseries: dataset.is_timeseries()?,
            ensemble: options.is_ensemble || spec.is_ensemble(),
            dataset,
            spec,
            problem_info,
            options,
            scoring,
        })
    }

    pub(crate) fn run_regime(&mut self, regime: Regime, result: &mut TrainingResult) -> Result<()> {
        let outcome = match regime {
            Regime::TrainAndValidation | Regime::TrainValidateTest => {
                result.train_validate_status = Some(0);
                self.train_validate(regime, result)
            }
            Regime::TrainFull => {
                result.train_full_status = Some(0);
                self.train_full(result)
            }
            Regime::MeanCrossValidation => {
                result.cv_status = Some(0);
                self.cross_validate(result)
            }
        };
        if let Err(e) = &outcome {
            error!(regime = %regime, pipeline_id = %self.spec.pipeline_id, error = %e, "Regime failed");
        }
        outcome
    }

    fn train_validate(&mut self, regime: Regime, result: &mut TrainingResult) -> Result<()> {
        let dataset = self.dataset;
        let train = self.prepare_train(dataset.get_train_set()?)?;
        let valid = dataset.get_valid_set()?;
        let mut chain = self.new_chain()?;
        let fit_time = self.fit(&mut chain, &train)?;
        {
            let scorer = self.scoring_model(&chain, &train)?;
            let scores = self.score(&scorer, &valid, &train, fit_time)?;
            info!(regime = %regime, rows = train.len(), fit_time, "Scored validation split");
            result.validation_metrics = Some(scores);
            if regime == Regime::TrainValidateTest {
                let test = dataset.get_test_set()?;
                result.test_metrics = Some(self.score(&scorer, &test, &train, fit_time)?);
            }
        }
        if self.options.include_models {
            result.add_models(regime.as_str(), vec![chain]);
        }
        Ok(())
    }

    fn train_full(&mut self, result: &mut TrainingResult) -> Result<()> {
        let dataset = self.dataset;
        let full = if !dataset.has_training_set()? {
            dataset.get_full_set()?
        } else if dataset.has_valid_set()? {
            dataset.get_train_set()?.vstack(&dataset.get_valid_set()?)?
        } else {
            dataset.get_train_set()?
        };
        let full = self.prepare_train(full)?;
        let mut chain = self.new_chain()?;
        let fit_time = self.fit(&mut chain, &full)?;
        {
            let scorer = self.scoring_model(&chain, &full)?;
            if self.options.compute_metrics_for_train_full {
                result.train_metrics = Some(self.score(&scorer, &full, &full, fit_time)?);
            }
            if dataset.has_test_set()? {
                let test = dataset.get_test_set()?;
                result.train_from_full_metrics = Some(self.score(&scorer, &test, &full, fit_time)?);
            }
        }
        info!(rows = full.len(), fit_time, "Trained on the full training data");
        if self.options.include_models {
            result.add_models(Regime::TrainFull.as_str(), vec![chain]);
        }
        Ok(())
    }

    fn cross_validate(&mut self, result: &mut TrainingResult) -> Result<()> {
        let dataset = self.dataset;
        let folds = dataset.get_cv_splits()?;
        let n_folds = folds.n_folds();
        let mut per_fold = Vec::with_capacity(n_folds);
        let mut models = Vec::new();
        for (i, fold) in folds.enumerate() {
            let fold = fold?;
            let train = self.prepare_train(fold.train)?;
            let mut chain = self.new_chain()?;
            let fit_time = self.fit(&mut chain, &train)?;
            {
                let scorer = self.scoring_model(&chain, &train)?;
                per_fold.push(self.score(&scorer, &fold.test, &train, fit_time)?);
            }
            debug!(fold = i, n_folds, fit_time, "Scored CV fold");
            if self.options.include_models {
                models.push(chain);
            }
        }
        result.cv_mean_metrics = Some(aggregate_scores(&per_fold, &self.scoring.metrics));
        result.cv_metrics = Some(per_fold);
        info!(n_folds, "Cross-validation finished");
        if self.options.include_models {
            result.add_models(Regime::MeanCrossValidation.as_str(), models);
        }
        Ok(())
    }

    fn new_chain(&mut self) -> Result<Chain> {
        self.spec.instantiate(
            &mut self.problem_info,
            self.options.random_state,
            self.dataset.is_sparse(),
            self.dataset.get_preprocessor_pipeline_step(),
            Some(self.dataset.meta()),
        )
    }

    fn timeseries_transformer(&self) -> Option<&TimeseriesTransformer> {
        self.transformers.as_ref()?.timeseries_transformer.as_ref()
    }

    fn y_transformer(&self) -> Option<&LabelEncoder> {
        self.transformers.as_ref()?.y_transformer.as_ref()
    }

    /// Classical forecasters and ensembles train on imputed targets too
    fn keeps_imputed_rows(&self) -> bool {
        self.ensemble
            || self
                .spec
                .terminal_class_name()
                .map_or(false, |c| model_names::is_classical_timeseries(c) || model_names::is_ensemble(c))
    }

    fn prepare_train(&self, data: SplitData) -> Result<SplitData> {
        if !self.is_timeseries || self.keeps_imputed_rows() {
            return Ok(data);
        }
        match self.timeseries_transformer() {
            Some(ts) => {
                let before = data.len();
                let filtered = ts.remove_imputed_rows(data)?;
                debug!(removed = before - filtered.len(), "Dropped rows with imputed targets");
                Ok(filtered)
            }
            None => Ok(data),
        }
    }

    fn fit(&self, chain: &mut Chain, train: &SplitData) -> Result<f64> {
        let x = train.x.to_dense()?;
        let start = Instant::now();
        chain.fit(&x, &train.y, train.sample_weight.as_ref())?;
        let fit_time = start.elapsed().as_secs_f64();
        debug!(learner = chain.estimator_name(), rows = train.len(), fit_time, "Fitted chain");
        Ok(fit_time)
    }

    /// Voting ensembles score with the fitted chain; stacks with a copy whose
    /// meta-learner is relearned on `train`
    fn scoring_model<'c>(&self, chain: &'c Chain, train: &SplitData) -> Result<Cow<'c, Chain>> {
        if !self.ensemble {
            return Ok(Cow::Borrowed(chain));
        }
        match chain.scoring_copy() {
            Some(mut copy) => {
                copy.fit(&train.x.to_dense()?, &train.y, train.sample_weight.as_ref())?;
                Ok(Cow::Owned(copy))
            }
            None => Ok(Cow::Borrowed(chain)),
        }
    }

    fn predict(&self, chain: &Chain, data: &SplitData, reference: &SplitData) -> Result<(Predictions, f64)> {
        let x = data.x.to_dense()?;
        let start = Instant::now();
        let y_pred = chain.predict(&x).map_err(as_predict_error)?;
        let y_proba = match self.scoring.task {
            Task::Classification => chain.predict_proba(&x).map_err(as_predict_error)?,
            _ => None,
        };
        let predict_time = start.elapsed().as_secs_f64();

        if all_nan(y_pred.iter()) || y_proba.as_ref().map_or(false, |p| all_nan(p.iter())) {
            return Err(RunnerError::PredictError(format!(
                "{} predicted NaN for all {} rows",
                chain.estimator_name(),
                y_pred.len()
            )));
        }

        let train_labels = match chain.classes() {
            Some(classes) => classes.to_vec(),
            None => self.class_labels.as_deref().cloned().unwrap_or_default(),
        };
        let ts = self.timeseries_transformer();
        let forecasting = self.scoring.task == Task::Forecasting;
        let predictions = Predictions {
            y_true: data.y.clone(),
            y_pred,
            y_proba,
            train_labels,
            sample_weight: data.sample_weight.clone(),
            horizons: ts.and_then(|t| t.horizons(&data.x)),
            grain_ids: ts.and_then(|t| t.grain_ids(&data.x)),
            train_y: forecasting.then(|| reference.y.clone()),
            train_grain_ids: ts.and_then(|t| t.grain_ids(&reference.x)),
        };
        Ok((predictions, predict_time))
    }

    fn regression_input<'p>(&'p self, p: &'p Predictions) -> RegressionInput<'p> {
        let (y_min, y_max) = self.dataset.get_y_range();
        RegressionInput {
            y_min,
            y_max,
            y_std: self.dataset.get_y_std(),
            bin_info: self.dataset.get_bin_info(),
            sample_weight: p.sample_weight.as_ref(),
            ..RegressionInput::new(&p.y_true, &p.y_pred)
        }
    }

    fn score_predictions(&self, p: &Predictions) -> MetricMap {
        let metrics = &self.scoring.metrics;
        match self.scoring.task {
            Task::Classification => {
                let class_labels: &[f64] = self.class_labels.as_deref().map_or(p.train_labels.as_slice(), |c| c.as_slice());
                let input = ClassificationInput {
                    y_true: &p.y_true,
                    y_pred: &p.y_pred,
                    y_proba: p.y_proba.as_ref(),
                    train_labels: &p.train_labels,
                    class_labels,
                    y_transformer: self.y_transformer(),
                    use_binary: self.scoring.use_binary_metrics,
                    sample_weight: p.sample_weight.as_ref(),
                };
                score_classification(&input, metrics)
            }
            Task::Regression => score_regression(&self.regression_input(p), metrics),
            Task::Forecasting => {
                let input = ForecastInput {
                    regression: self.regression_input(p),
                    horizons: p.horizons.as_deref(),
                    grain_ids: p.grain_ids.as_deref(),
                    train_y: p.train_y.as_ref(),
                    train_grain_ids: p.train_grain_ids.as_deref(),
                };
                score_forecasting(&input, metrics)
            }
        }
    }

    fn score(&self, chain: &Chain, data: &SplitData, reference: &SplitData, fit_time: f64) -> Result<MetricMap> {
        let (predictions, predict_time) = self.predict(chain, data, reference)?;
        let mut scores = self.score_predictions(&predictions);
        if self.scoring.enable_metric_confidence {
            let extras = bootstrap_extras(
                predictions.y_true.len(),
                self.options.random_state,
                &self.scoring.metrics,
                |rows| self.score_predictions(&predictions.resample(rows)),
            );
            scores.extend(extras);
        }
        attach_timing(&mut scores, fit_time, predict_time);
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_all_nan_needs_values() {
        assert!(all_nan([f64::NAN, f64::NAN].iter()));
        assert!(!all_nan([f64::NAN, 1.0].iter()));
        assert!(!all_nan(std::iter::empty()));
    }

    #[test]
    fn test_resample_keeps_rows_aligned() {
        let p = Predictions {
            y_true: array![1.0, 2.0, 3.0],
            y_pred: array![1.5, 2.5, 3.5],
            y_proba: None,
            train_labels: Vec::new(),
            sample_weight: Some(array![1.0, 2.0, 3.0]),
            horizons: Some(vec![1.0, 2.0, 3.0]),
            grain_ids: None,
            train_y: None,
            train_grain_ids: None,
        };
        let r = p.resample(&[2, 2, 0]);
        assert_eq!(r.y_true, array![3.0, 3.0, 1.0]);
        assert_eq!(r.y_pred, array![3.5, 3.5, 1.5]);
        assert_eq!(r.sample_weight, Some(array![3.0, 3.0, 1.0]));
        assert_eq!(r.horizons, Some(vec![3.0, 3.0, 1.0]));
    }
}

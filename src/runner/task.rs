//! The candidate-training task executed behind the limiter

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::regimes::CandidateRun;
use super::{Regime, RunOptions, ScoringSettings, TrainingResult};
use crate::dataset::Dataset;
use crate::error::Result;
use crate::limiter::{RemoteTask, TaskReturn};
use crate::pipeline::PipelineSpec;
use crate::problem_info::ProblemInfo;

pub const TRAIN_CANDIDATE_TASK: &str = "train-candidate";

/// Everything the child needs to run one candidate
///
/// The spec and problem description travel as JSON text since both hold
/// free-form values that only a self-describing format can carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainCandidateInput {
    pub dataset: Dataset,
    pub spec_json: String,
    pub problem_info_json: String,
    pub regimes: Vec<Regime>,
    pub options: RunOptions,
    pub scoring: ScoringSettings,
}

impl TrainCandidateInput {
    pub fn new(
        dataset: &Dataset,
        spec: &PipelineSpec,
        problem_info: &ProblemInfo,
        regimes: &[Regime],
        options: &RunOptions,
        scoring: &ScoringSettings,
    ) -> Result<Self> {
        Ok(Self {
            dataset: dataset.clone(),
            spec_json: spec.to_json()?,
            problem_info_json: serde_json::to_string(&problem_info.to_dict()?)?,
            regimes: regimes.to_vec(),
            options: options.clone(),
            scoring: scoring.clone(),
        })
    }
}

/// Subsample, then run every requested regime in order
pub struct TrainCandidateTask;

impl TrainCandidateTask {
    fn train(input: TrainCandidateInput) -> Result<TrainingResult> {
        let spec = PipelineSpec::from_json(&input.spec_json)?;
        let problem_info = ProblemInfo::from_dict(&serde_json::from_str(&input.problem_info_json)?)?;
        let mut dataset = input.dataset;
        let opened = dataset.open_dataset()?;

        let mut result = TrainingResult::default();
        let subsampled = match input.options.subsample_percent {
            Some(percent) if percent < 100.0 => {
                debug!(percent, seed = input.options.subsample_seed, "Subsampling training split");
                result.train_percent = percent;
                Some(opened.subsample(percent, input.options.subsample_seed)?)
            }
            _ => None,
        };
        let data: &Dataset = subsampled.as_deref().unwrap_or(&*opened);

        let mut run = CandidateRun::new(data, &spec, problem_info, &input.options, &input.scoring)?;
        for regime in &input.regimes {
            run.run_regime(*regime, &mut result)?;
        }
        Ok(result)
    }
}

impl RemoteTask for TrainCandidateTask {
    type Input = TrainCandidateInput;
    type Output = TrainingResult;

    fn name(&self) -> &'static str {
        TRAIN_CANDIDATE_TASK
    }

    fn call(&self, input: TrainCandidateInput) -> TaskReturn<TrainingResult> {
        match Self::train(input) {
            Ok(result) => (Some(result), None),
            Err(e) => (None, Some(e)),
        }
    }
}

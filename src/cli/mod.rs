//! Kolosal Runner CLI Module
//!
//! Command-line entry points: run one candidate from JSON files, describe a
//! pipeline spec, and check the limiter against a real spawn server.

use clap::{Parser, Subcommand};
use colored::*;
use ndarray::{Array1, Array2};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::RunnerSettings;
use crate::dataset::{CvSplit, Dataset};
use crate::error::{Result as RunnerResult, RunnerError};
use crate::limiter::diagnostics::RaiseInput;
use crate::limiter::{ExecuteOutcome, RemoteTask, ResourceCaps, ResourceLimiter};
use crate::metrics::MetricValue;
use crate::pipeline::PipelineSpec;
use crate::problem_info::{ProblemInfo, Task};
use crate::runner::{ClientRunner, Regime, RunOptions, TrainingResult};

// ─── Styling helpers ───────────────────────────────────────────────────────────

fn dim(s: &str) -> ColoredString   { s.truecolor(100, 100, 100) }
fn accent(s: &str) -> ColoredString { s.truecolor(120, 170, 255) }
fn muted(s: &str) -> ColoredString  { s.truecolor(140, 140, 140) }
fn ok(s: &str) -> ColoredString     { s.truecolor(100, 210, 120) }

fn kv(key: &str, val: &str) {
    println!("  {:<18} {}", muted(key), val.white());
}

fn step_run(msg: &str) {
    print!("  {} {}... ", accent("›"), msg);
}

fn step_done(detail: &str) {
    println!("{} {}", ok("done"), dim(detail));
}

fn section(title: &str) {
    println!();
    println!("  {}", title.white().bold());
    println!("  {}", dim(&"─".repeat(56)));
}

// ─── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "kolosal-runner")]
#[command(author = "KolosalAI")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run AutoML candidate pipelines under resource limits")]
#[command(long_about = None)]
pub struct Cli {
    /// JSON file with runner settings; environment variables take precedence
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train and score one pipeline spec on a dataset
    Run {
        /// Dataset JSON file
        #[arg(short, long)]
        dataset: PathBuf,

        /// Pipeline spec JSON file
        #[arg(short, long)]
        spec: PathBuf,

        /// Problem info JSON file; derived from the dataset when omitted
        #[arg(long)]
        problem_info: Option<PathBuf>,

        /// Metric names, comma separated
        #[arg(short, long, value_delimiter = ',', default_value = "accuracy")]
        metrics: Vec<String>,

        /// Regimes in execution order (train-validate, train-validate-test, train-full, cv)
        #[arg(short, long, value_delimiter = ',', default_value = "train-validate")]
        regimes: Vec<String>,

        /// Train on this percentage of the training split
        #[arg(long)]
        subsample: Option<f64>,

        #[arg(long, default_value = "0")]
        seed: u64,

        /// Wall-time cap per candidate, in seconds
        #[arg(long)]
        wall_time: Option<f64>,

        /// Memory cap per candidate, in megabytes
        #[arg(long)]
        memory_mb: Option<u64>,

        /// Run in-process without resource limits
        #[arg(long)]
        no_limits: bool,

        /// Score binary metrics on the positive class
        #[arg(long)]
        binary_metrics: bool,

        /// Add bootstrap confidence intervals
        #[arg(long)]
        confidence: bool,

        /// Write the result JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Describe a pipeline spec
    SpecSummary {
        /// Pipeline spec JSON file
        #[arg(short, long)]
        spec: PathBuf,
    },

    /// Check the limiter against a real spawn server
    Selftest {
        /// Spawn server binary; located automatically when omitted
        #[arg(long)]
        server: Option<PathBuf>,
    },
}

// ─── Data loading ──────────────────────────────────────────────────────────────

/// Dense dataset description read by `run`
#[derive(Debug, Deserialize)]
pub struct DatasetFile {
    pub task: Task,
    pub x: Vec<Vec<f64>>,
    pub y: Vec<f64>,
    #[serde(default)]
    pub column_names: Option<Vec<String>>,
    #[serde(default)]
    pub categorical: Option<Vec<bool>>,
    #[serde(default)]
    pub train_indices: Option<Vec<usize>>,
    #[serde(default)]
    pub valid_indices: Vec<usize>,
    #[serde(default)]
    pub test_indices: Option<Vec<usize>>,
    #[serde(default)]
    pub cv_splits: Option<Vec<CvSplit>>,
    #[serde(default)]
    pub n_folds: Option<usize>,
    /// `(test_fraction, valid_fraction)` carved out of `x`
    #[serde(default)]
    pub split_fractions: Option<(f64, f64)>,
    #[serde(default)]
    pub seed: u64,
}

impl DatasetFile {
    pub fn load(path: &Path) -> RunnerResult<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    pub fn into_dataset(self) -> RunnerResult<Dataset> {
        let n_cols = self.x.first().map_or(0, Vec::len);
        if let Some(bad) = self.x.iter().position(|row| row.len() != n_cols) {
            return Err(RunnerError::DataError(format!(
                "row {} has {} values, expected {}",
                bad,
                self.x[bad].len(),
                n_cols
            )));
        }
        let n_rows = self.x.len();
        let x = Array2::from_shape_vec((n_rows, n_cols), self.x.into_iter().flatten().collect())?;
        let mut builder = Dataset::builder(x, Array1::from(self.y), self.task);
        if let Some(train) = self.train_indices {
            builder = builder.with_train_valid_indices(train, self.valid_indices);
        }
        if let Some(test) = self.test_indices {
            builder = builder.with_test_indices(test);
        }
        if let Some((test_fraction, valid_fraction)) = self.split_fractions {
            builder = builder.with_split_percentages(self.seed, test_fraction, valid_fraction);
        }
        if let Some(splits) = self.cv_splits {
            builder = builder.with_cv_indices(splits);
        } else if let Some(n_folds) = self.n_folds {
            builder = builder.with_k_fold(n_folds, self.seed);
        }
        if let Some(mask) = self.categorical {
            builder = builder.with_categorical(mask);
        }
        if let Some(names) = self.column_names {
            builder = builder.with_raw_column_names(names);
        }
        builder.build()
    }
}

/// Environment settings over the optional settings file
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<RunnerSettings> {
    let env = RunnerSettings::from_env()?;
    Ok(match path {
        Some(path) => env.or(RunnerSettings::from_file(path)?),
        None => env,
    })
}

// ─── Commands ──────────────────────────────────────────────────────────────────

pub struct RunArgs {
    pub dataset: PathBuf,
    pub spec: PathBuf,
    pub problem_info: Option<PathBuf>,
    pub metrics: Vec<String>,
    pub regimes: Vec<String>,
    pub subsample: Option<f64>,
    pub seed: u64,
    pub wall_time: Option<f64>,
    pub memory_mb: Option<u64>,
    pub no_limits: bool,
    pub binary_metrics: bool,
    pub confidence: bool,
    pub output: Option<PathBuf>,
}

pub fn cmd_run(args: RunArgs, settings: &RunnerSettings) -> anyhow::Result<()> {
    section("Run");

    step_run("Loading dataset");
    let start = Instant::now();
    let mut dataset = DatasetFile::load(&args.dataset)?.into_dataset()?;
    settings.apply_to_dataset(&mut dataset);
    step_done(&format!(
        "{} rows × {} cols in {:?}",
        dataset.num_samples(),
        dataset.num_features(),
        start.elapsed()
    ));

    let spec = PipelineSpec::from_json(&std::fs::read_to_string(&args.spec)?)?;
    let mut problem_info = match &args.problem_info {
        Some(path) => ProblemInfo::from_dict(&serde_json::from_str(&std::fs::read_to_string(path)?)?)?,
        None => dataset.get_problem_info(),
    };
    let mut caps = ResourceCaps::default();
    caps.mem_in_mb = args.memory_mb;
    caps.wall_time_in_s = args.wall_time;
    problem_info.set_runtime_constraint(&caps);

    let regimes = args
        .regimes
        .iter()
        .map(|r| r.parse::<Regime>())
        .collect::<RunnerResult<Vec<_>>>()?;
    let mut options = RunOptions::default()
        .with_random_state(args.seed)
        .with_enforce_limits(!args.no_limits);
    if let Some(percent) = args.subsample {
        options = options.with_subsample(percent, args.seed);
    }
    let options = settings.apply_to_options(options);

    let runner = ClientRunner::new(
        args.metrics,
        dataset.task(),
        settings.execution_context(),
        args.binary_metrics,
        args.confidence,
    )
    .with_limiter_settings(settings.limiter_settings());

    kv("Pipeline", &spec.summary());
    kv("Regimes", &regimes.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(", "));
    kv("Isolated", if options.enforce_limits && !spec.supports_constrained_fit() { "yes" } else { "no" });

    step_run("Training");
    let (result, error) = runner.run(&dataset, &spec, &problem_info, &regimes, &options);
    if let Some(e) = error {
        println!("{}", "failed".red());
        println!("  {} {}", "error".red().bold(), e.generic_message());
        anyhow::bail!(e);
    }
    let result = result.ok_or_else(|| anyhow::anyhow!("runner returned neither a result nor an error"))?;
    step_done(&format!("{:.3}s", result.wall_time.unwrap_or_default()));
    print_scores(&result);

    let json = serde_json::to_string_pretty(&result.to_dict()?)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json)?;
            println!();
            println!("  {} {}", ok("✓"), format!("Result written to {}", path.display()));
        }
        None => println!("{}", json),
    }
    println!();
    Ok(())
}

fn print_scores(result: &TrainingResult) {
    let sections = [
        ("validation", &result.validation_metrics),
        ("test", &result.test_metrics),
        ("train", &result.train_metrics),
        ("train-from-full", &result.train_from_full_metrics),
        ("cv-mean", &result.cv_mean_metrics),
    ];
    for (title, scores) in sections {
        let Some(scores) = scores else { continue };
        println!();
        println!("  {}", title.white().bold());
        for (name, value) in scores {
            let text = match value {
                MetricValue::Scalar(v) => format!("{:.4}", v),
                MetricValue::Table { labels, .. } => format!("table ({} rows)", labels.len()),
                MetricValue::Error { message, .. } => message.red().to_string(),
            };
            println!("  {:<40} {}", muted(name), text);
        }
    }
}

pub fn cmd_spec_summary(path: &Path) -> anyhow::Result<()> {
    section("Pipeline spec");
    let spec = PipelineSpec::from_json(&std::fs::read_to_string(path)?)?;
    kv("Id", &spec.pipeline_id);
    kv("Summary", &spec.summary());
    kv("Ensemble", if spec.is_ensemble() { "yes" } else { "no" });
    kv("Constrained fit", if spec.supports_constrained_fit() { "yes" } else { "no" });
    println!();
    for class in spec.class_strings() {
        println!("  {} {}", dim("·"), class);
    }
    println!();
    Ok(())
}

fn check<T>(name: &str, outcome: &ExecuteOutcome<T>, passed: bool) -> bool {
    let detail = match &outcome.error {
        Some(e) => format!("{:.2}s, {}", outcome.wall_time_s, e),
        None => format!("{:.2}s", outcome.wall_time_s),
    };
    let mark = if passed { ok("✓") } else { "✗".red() };
    println!("  {} {:<28} {}", mark, name, dim(&detail));
    passed
}

fn run_diag<T: RemoteTask>(limiter: &ResourceLimiter, dir: &Path, task: T, input: T::Input) -> ExecuteOutcome<T::Output> {
    limiter.execute(dir, &task, input)
}

pub fn cmd_selftest(server: Option<&Path>, settings: &RunnerSettings) -> anyhow::Result<()> {
    use crate::limiter::diagnostics::{BurnCpuTask, EchoTask, PanicTask, RaiseTask, SleepTask};

    section("Limiter self-test");
    let mut limiter_settings = settings.limiter_settings();
    limiter_settings.enabled = true;
    if let Some(path) = server {
        limiter_settings = limiter_settings.with_server_path(path);
    }
    let server_path = limiter_settings.resolve_server_path()?;
    kv("Spawn server", &server_path.display().to_string());
    println!();

    let dir = std::env::temp_dir();
    let plain = ResourceLimiter::new(ResourceCaps::default(), limiter_settings.clone());
    let mut passed = 0;
    let mut total = 0;
    let mut tally = |ok: bool| {
        total += 1;
        passed += usize::from(ok);
    };

    let out = run_diag(&plain, &dir, EchoTask, "ping".to_string());
    tally(check("result passthrough", &out, out.value.as_deref() == Some("ping")));

    let timed = ResourceLimiter::new(
        ResourceCaps::default().with_wall_time(1.0).with_grace_period(0.0),
        limiter_settings.clone(),
    );
    let out = run_diag(&timed, &dir, SleepTask, 5.0);
    tally(check("wall-time kill", &out, matches!(out.error, Some(RunnerError::IterationTimeout { .. }))));

    let out = run_diag(
        &plain,
        &dir,
        RaiseTask,
        RaiseInput {
            classified: true,
            message: "selftest".to_string(),
        },
    );
    tally(check("classified error", &out, matches!(out.error, Some(RunnerError::FitError { .. }))));

    let out = run_diag(&plain, &dir, PanicTask, "selftest".to_string());
    tally(check(
        "panic with traceback",
        &out,
        matches!(&out.error, Some(RunnerError::PipelineError { traceback: Some(_), .. })),
    ));

    if cfg!(unix) {
        let cpu = ResourceLimiter::new(ResourceCaps::default().with_cpu_time(1.0), limiter_settings);
        let out = run_diag(&cpu, &dir, BurnCpuTask, 10.0);
        tally(check("cpu-time cap", &out, matches!(out.error, Some(RunnerError::CpuTimeout { .. }))));
    }

    println!();
    if passed == total {
        println!("  {} {}", ok("all checks passed"), dim(&format!("{}/{}", passed, total)));
        println!();
        Ok(())
    } else {
        anyhow::bail!("{} of {} limiter checks failed", total - passed, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_file_builds_splits() {
        let text = r#"{
            "task": "regression",
            "x": [[0.0], [1.0], [2.0], [3.0]],
            "y": [1.0, 3.0, 5.0, 7.0],
            "train_indices": [0, 1, 2],
            "valid_indices": [3]
        }"#;
        let file: DatasetFile = serde_json::from_str(text).unwrap();
        let dataset = file.into_dataset().unwrap();
        assert_eq!(dataset.get_train_set().unwrap().len(), 3);
        assert_eq!(dataset.get_valid_set().unwrap().y[0], 7.0);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let text = r#"{"task": "regression", "x": [[0.0, 1.0], [1.0]], "y": [1.0, 2.0]}"#;
        let file: DatasetFile = serde_json::from_str(text).unwrap();
        assert!(matches!(file.into_dataset(), Err(RunnerError::DataError(_))));
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "kolosal-runner",
            "run",
            "--dataset",
            "d.json",
            "--spec",
            "s.json",
            "--metrics",
            "accuracy,f1_score_macro",
            "--regimes",
            "train-validate,cv",
            "--no-limits",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { metrics, regimes, no_limits, .. } => {
                assert_eq!(metrics, vec!["accuracy", "f1_score_macro"]);
                assert_eq!(regimes.len(), 2);
                assert!(no_limits);
            }
            _ => panic!("expected run"),
        }
    }
}

//! Kolosal Runner - Main Entry Point
//!
//! Runs candidate pipelines, describes specs and self-tests the limiter.

use clap::Parser;
use kolosal_runner::cli::{cmd_run, cmd_selftest, cmd_spec_summary, load_settings, Cli, Commands, RunArgs};
use kolosal_runner::logging::init_cli_logging;

fn main() -> anyhow::Result<()> {
    init_cli_logging();

    let cli = Cli::parse();
    let settings = load_settings(cli.settings.as_deref())?;

    match cli.command {
        Commands::Run {
            dataset,
            spec,
            problem_info,
            metrics,
            regimes,
            subsample,
            seed,
            wall_time,
            memory_mb,
            no_limits,
            binary_metrics,
            confidence,
            output,
        } => {
            let args = RunArgs {
                dataset,
                spec,
                problem_info,
                metrics,
                regimes,
                subsample,
                seed,
                wall_time,
                memory_mb,
                no_limits,
                binary_metrics,
                confidence,
                output,
            };
            cmd_run(args, &settings)?;
        }
        Commands::SpecSummary { spec } => {
            cmd_spec_summary(&spec)?;
        }
        Commands::Selftest { server } => {
            cmd_selftest(server.as_deref(), &settings)?;
        }
    }

    Ok(())
}

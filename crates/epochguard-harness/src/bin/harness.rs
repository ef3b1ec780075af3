//! CLI entrypoint for the EpochGuard scenario harness.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use epochguard_harness::scenarios::{self, Scenario};
use epochguard_harness::{HarnessError, LogEmitter, validate_log_file};
use tracing_subscriber::EnvFilter;

/// Detection scenarios and log tooling for EpochGuard.
#[derive(Debug, Parser)]
#[command(name = "epochguard-harness")]
#[command(about = "Scenario runner for EpochGuard")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a detection scenario and print its JSONL log.
    Scenario {
        /// Scenario to run; every scenario when omitted.
        #[arg(value_enum)]
        name: Option<Scenario>,
        /// Write the log here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Run id used as the trace id prefix.
        #[arg(long, default_value = "epochguard")]
        run_id: String,
    },
    /// Validate a JSONL structured log.
    ValidateLog {
        /// Path to the JSONL file.
        #[arg(long)]
        path: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("epochguard-harness: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), HarnessError> {
    match cli.command {
        Command::Scenario {
            name,
            output,
            run_id,
        } => {
            let mut log = match &output {
                Some(path) => LogEmitter::to_file(path, &run_id)?,
                None => LogEmitter::to_stdout(&run_id),
            };
            let selected: Vec<Scenario> = name.map_or_else(|| Scenario::ALL.to_vec(), |s| vec![s]);
            let mut failed = Vec::new();
            for scenario in selected {
                let summary = scenarios::run_scenario(scenario, &mut log)?;
                eprintln!(
                    "{:<16} {} ({} runs): {}",
                    scenario.name(),
                    if summary.passed { "PASS" } else { "FAIL" },
                    summary.runs,
                    summary.detail
                );
                if !summary.passed {
                    failed.push(summary);
                }
            }
            if let Some(first) = failed.into_iter().next() {
                return Err(HarnessError::Unexpected {
                    scenario: first.scenario.name(),
                    detail: first.detail,
                });
            }
        }
        Command::ValidateLog { path } => {
            let (lines, errors) = validate_log_file(&path)?;
            for e in &errors {
                eprintln!("{e}");
            }
            if !errors.is_empty() {
                return Err(HarnessError::InvalidLog {
                    path: path.display().to_string(),
                    errors: errors.len(),
                });
            }
            eprintln!("{}: {lines} valid line(s)", path.display());
        }
    }
    Ok(())
}

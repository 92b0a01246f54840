//! dwload drives DevWorkspace resources through their lifecycle to load test
//! the DevWorkspace operator and its admission webhook.
#![deny(warnings)]
#![deny(missing_docs)]

mod cleanup;
mod cluster;
mod labels;
mod lifecycle;
mod metrics;
mod run;
mod sampler;
mod schedule;
mod target;
mod thresholds;
mod watch;
mod workload;

use anyhow::Result;
use clap::{Parser, Subcommand};
use opentelemetry::{global, KeyValue};
use tracing::{error, info};

use crate::{cleanup::cleanup, run::run};

/// Exit code of a run that completed but failed its thresholds.
const THRESHOLDS_FAILED_EXIT_CODE: i32 = 99;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// OTLP collector receiving traces and metrics. Nothing is exported when unset.
    #[arg(long, env = "DWLOAD_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

/// Available Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a load test
    Run(run::Opts),
    /// Delete every resource left behind by earlier runs
    Cleanup(cleanup::Opts),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Run(_) => "run",
            Command::Cleanup(_) => "cleanup",
        }
    }
}

/// Result of a command that ran to completion.
#[derive(Debug)]
pub enum CommandResult {
    /// The command did what it was asked to
    Success,
    /// The command completed but its verdict is negative
    Failure(anyhow::Error),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let telemetry = dwload_common::telemetry::init("dwload-runner", args.otlp_endpoint.clone()).await?;

    let meter = global::meter("dwload");
    let runs = meter
        .u64_counter("dwload_runner_runs")
        .with_description("Number of runs of the runner")
        .init();
    runs.add(1, &[KeyValue::new("command", args.command.name())]);

    info!(?args.command, exporting = telemetry.exporting(), "starting runner");
    let result = match args.command {
        Command::Run(opts) => run(opts).await,
        Command::Cleanup(opts) => cleanup(opts).await,
    };
    // Flush traces and metrics before exiting
    telemetry.shutdown()?;

    match result? {
        CommandResult::Success => Ok(()),
        CommandResult::Failure(err) => {
            error!(%err, "command failed");
            std::process::exit(THRESHOLDS_FAILED_EXIT_CODE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_log_redacts_token() {
        let args = Cli::parse_from([
            "dwload-runner",
            "run",
            "--api-url",
            "https://api:6443",
            "--token",
            "sha256~SECRET",
        ]);
        let logged = format!("{:?}", args.command);
        assert!(logged.contains("https://api:6443"), "{logged}");
        assert!(logged.contains("<redacted>"), "{logged}");
        assert!(!logged.contains("SECRET"), "{logged}");
    }
}

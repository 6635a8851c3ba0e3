//! hopbench
//!
//! Runs the emulation sweep, the real-host transfer campaign or the
//! time-to-shell campaign described by a TOML configuration file.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hopbench::campaign::{run_time_to_shell, run_transfers};
use hopbench::record::ResultLog;
use hopbench::sweep::{NetnsEmulator, NetnsInvoker};
use hopbench::{HarnessConfig, ProcessRunner, SweepController, SweepPlan};

#[derive(Parser, Debug)]
#[command(name = "hopbench", about = "Hop vs SSH benchmark harness")]
struct Cli {
    /// Log filter used when RUST_LOG is unset (e.g. "debug").
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sweep impairment profiles on an emulated router topology (needs root).
    Simulate(RunArgs),
    /// Measure transfer throughput against real hosts.
    Transfer(RunArgs),
    /// Measure how long a remote shell takes to come up.
    TimeToShell {
        #[command(flatten)]
        run: RunArgs,

        /// Label stored with every row.
        #[arg(long, default_value = "local")]
        run_label: String,
    },
    /// List the impairment profiles a sweep would run.
    Profiles {
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Harness configuration file.
    #[arg(long, short)]
    config: PathBuf,

    /// Overrides `repetitions` from the configuration.
    #[arg(long)]
    repetitions: Option<u32>,

    /// Overrides the result file of the selected mode.
    #[arg(long)]
    results: Option<PathBuf>,
}

impl RunArgs {
    fn load(&self) -> anyhow::Result<HarnessConfig> {
        let mut config = HarnessConfig::load(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        if let Some(repetitions) = self.repetitions {
            anyhow::ensure!(repetitions > 0, "--repetitions must be at least 1");
            config.repetitions = repetitions;
        }
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let fallback = cli.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .init();

    match cli.command {
        Command::Simulate(args) => {
            let config = args.load()?;
            let results = args
                .results
                .unwrap_or_else(|| config.emulation.results.clone());
            let runner = ProcessRunner::new().context("starting process runtime")?;

            let plan = SweepPlan::from_config(&config.emulation, config.repetitions);
            let emulator = NetnsEmulator::new(config.emulation.topology.clone());
            let invoker = NetnsInvoker::new(
                &runner,
                config.emulation.source_dir.clone(),
                config.timeouts.clone(),
            );
            let mut controller = SweepController::new(
                plan,
                emulator,
                invoker,
                ResultLog::new(results),
                config.timeouts.settle,
            );
            let summary = controller.run()?;
            if !summary.skipped_profiles.is_empty() {
                tracing::warn!(profiles = ?summary.skipped_profiles, "profiles skipped");
            }
        }
        Command::Transfer(args) => {
            let config = args.load()?;
            let results = args
                .results
                .unwrap_or_else(|| config.transfer.results.clone());
            let runner = ProcessRunner::new().context("starting process runtime")?;
            let summary = run_transfers(&config, &runner, &ResultLog::new(results))?;
            tracing::info!(
                rows = summary.rows,
                timeouts = summary.timeouts,
                "transfer campaign finished"
            );
        }
        Command::TimeToShell { run, run_label } => {
            let config = run.load()?;
            let results = run.results.unwrap_or_else(|| config.shell.results.clone());
            let runner = ProcessRunner::new().context("starting process runtime")?;
            let summary =
                run_time_to_shell(&config, &runner, &ResultLog::new(results), &run_label)?;
            tracing::info!(
                rows = summary.rows,
                timeouts = summary.timeouts,
                "time-to-shell campaign finished"
            );
        }
        Command::Profiles { config } => {
            let config = match config {
                Some(path) => HarnessConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => HarnessConfig::from_toml_str("")?,
            };
            for p in config.emulation.catalog.iter() {
                println!(
                    "{:<16} {:>7} Mbit/s  delay {:>5} ms  jitter {:>4} ms  loss {}%",
                    p.name,
                    p.bandwidth_mbps,
                    p.delay.as_millis(),
                    p.jitter.as_millis(),
                    p.loss_pct
                );
            }
        }
    }
    Ok(())
}

//! The emulation sweep: every profile × file size × protocol × repetition,
//! each trial on a freshly shaped topology.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use hopbench_netsim::namespace;
use hopbench_netsim::{ImpairmentProfile, Node, ProfileCatalog, Topology, TopologyConfig};

use crate::config::{EmulationConfig, Timeouts};
use crate::exec::{CommandRunner, RunOutput};
use crate::parse::{parse_speed, Reading};
use crate::protocol::{Destination, FileSize, Protocol};
use crate::record::{ResultLog, SweepRecord};
use crate::util;

/// Where the controller is within the current trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    BuildingTopology,
    Running,
    Recording,
    TearingDown,
    Done,
}

#[derive(Debug, Clone, Copy)]
pub struct TrialSpec<'a> {
    pub profile: &'a ImpairmentProfile,
    pub file_size: &'a FileSize,
    pub protocol: &'a Protocol,
    pub repetition: u32,
}

/// Builds and tears down the emulated network.
pub trait Emulator {
    type Handle;

    /// Removes leftovers of a previous, crashed run.
    fn purge_stale(&mut self) -> Result<()>;
    fn build(&mut self, profile: &ImpairmentProfile) -> Result<Self::Handle>;
    fn teardown(&mut self, handle: Self::Handle) -> Result<()>;
}

/// Runs transfers on a built network.
pub trait Invoker<H> {
    fn transfer(&mut self, network: &H, trial: &TrialSpec<'_>) -> io::Result<RunOutput>;
    /// Deletes the transferred file on the receiving side.
    fn cleanup(&mut self, network: &H, trial: &TrialSpec<'_>) -> io::Result<()>;
}

/// What to run, in order.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub catalog: ProfileCatalog,
    pub file_sizes: Vec<FileSize>,
    pub protocols: Vec<Protocol>,
    pub repetitions: u32,
}

impl SweepPlan {
    pub fn from_config(emulation: &EmulationConfig, repetitions: u32) -> Self {
        Self {
            catalog: emulation.catalog.clone(),
            file_sizes: emulation.file_sizes.clone(),
            protocols: emulation.protocols.clone(),
            repetitions,
        }
    }

    /// Trials of one profile: file sizes, then protocols, then repetitions.
    pub fn trials_for<'a>(
        &'a self,
        profile: &'a ImpairmentProfile,
    ) -> impl Iterator<Item = TrialSpec<'a>> + 'a {
        self.file_sizes.iter().flat_map(move |file_size| {
            self.protocols.iter().flat_map(move |protocol| {
                (1..=self.repetitions).map(move |repetition| TrialSpec {
                    profile,
                    file_size,
                    protocol,
                    repetition,
                })
            })
        })
    }

    pub fn trial_count(&self) -> usize {
        self.catalog.len()
            * self.file_sizes.len()
            * self.protocols.len()
            * self.repetitions as usize
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub rows: usize,
    pub timeouts: usize,
    /// Transfers that could not be started at all.
    pub failures: usize,
    pub skipped_profiles: Vec<String>,
}

pub struct SweepController<E, I> {
    plan: SweepPlan,
    emulator: E,
    invoker: I,
    log: ResultLog<SweepRecord>,
    settle: Duration,
    phase: Phase,
}

impl<E, I> SweepController<E, I>
where
    E: Emulator,
    I: Invoker<E::Handle>,
{
    pub fn new(
        plan: SweepPlan,
        emulator: E,
        invoker: I,
        log: ResultLog<SweepRecord>,
        settle: Duration,
    ) -> Self {
        Self {
            plan,
            emulator,
            invoker,
            log,
            settle,
            phase: Phase::NotStarted,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn emulator(&self) -> &E {
        &self.emulator
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// Runs the whole plan. Returns an error only when a topology cannot be
    /// torn down or a row cannot be written.
    pub fn run(&mut self) -> Result<SweepSummary> {
        let Self {
            plan,
            emulator,
            invoker,
            log,
            settle,
            phase,
        } = self;
        let mut summary = SweepSummary::default();

        tracing::info!(
            profiles = plan.catalog.len(),
            trials = plan.trial_count(),
            results = %log.path().display(),
            "starting sweep"
        );

        for profile in plan.catalog.iter() {
            enter(phase, Phase::BuildingTopology, &profile.name);
            if let Err(err) = emulator.purge_stale() {
                tracing::warn!(error = %err, "failed to purge stale artifacts");
            }
            let network = match emulator.build(profile) {
                Ok(network) => network,
                Err(err) => {
                    tracing::error!(profile = %profile.name, error = %err, "skipping profile");
                    summary.skipped_profiles.push(profile.name.clone());
                    if let Err(err) = emulator.purge_stale() {
                        tracing::warn!(error = %err, "cleanup after failed build failed");
                    }
                    continue;
                }
            };

            for trial in plan.trials_for(profile) {
                enter(phase, Phase::Running, &profile.name);
                let reading = match invoker.transfer(&network, &trial) {
                    Ok(out) if out.timed_out => {
                        summary.timeouts += 1;
                        Reading::TimedOut
                    }
                    Ok(out) => parse_speed(&out.output, Some(profile.bandwidth_mbps)),
                    Err(err) => {
                        tracing::warn!(
                            protocol = %trial.protocol,
                            error = %err,
                            "transfer could not be started"
                        );
                        summary.failures += 1;
                        Reading::Missing
                    }
                };
                if let Err(err) = invoker.cleanup(&network, &trial) {
                    tracing::warn!(error = %err, "remote cleanup failed");
                }

                enter(phase, Phase::Recording, &profile.name);
                let record = SweepRecord {
                    time: util::now(),
                    file_size_mb: trial.file_size.megabytes(),
                    protocol: trial.protocol.label().to_string(),
                    bandwidth_mbps: profile.bandwidth_mbps,
                    delay: profile.delay,
                    jitter: profile.jitter,
                    loss_pct: profile.loss_pct,
                    value: reading.value(),
                };
                if let Err(err) = log.append(&record) {
                    if let Err(teardown) = emulator.teardown(network) {
                        tracing::error!(error = %teardown, "teardown after write failure failed");
                    }
                    return Err(err)
                        .with_context(|| format!("writing {}", log.path().display()));
                }
                summary.rows += 1;
                tracing::info!(
                    profile = %profile.name,
                    file_size = %trial.file_size,
                    protocol = %trial.protocol,
                    repetition = trial.repetition,
                    reading = %reading,
                    "trial recorded"
                );
                std::thread::sleep(*settle);
            }

            enter(phase, Phase::TearingDown, &profile.name);
            emulator
                .teardown(network)
                .with_context(|| format!("tearing down topology for profile {}", profile.name))?;
        }

        enter(phase, Phase::Done, "");
        tracing::info!(
            rows = summary.rows,
            timeouts = summary.timeouts,
            skipped = summary.skipped_profiles.len(),
            "sweep finished"
        );
        Ok(summary)
    }
}

fn enter(phase: &mut Phase, next: Phase, profile: &str) {
    tracing::debug!(profile, from = ?phase, to = ?next, "phase");
    *phase = next;
}

/// [`Emulator`] on real network namespaces.
#[derive(Debug, Clone)]
pub struct NetnsEmulator {
    config: TopologyConfig,
}

impl NetnsEmulator {
    pub fn new(config: TopologyConfig) -> Self {
        Self { config }
    }
}

impl Emulator for NetnsEmulator {
    type Handle = Topology;

    fn purge_stale(&mut self) -> Result<()> {
        let prefix = format!("{}-", self.config.prefix);
        let purged = namespace::purge_prefixed(&prefix)
            .with_context(|| format!("purging namespaces starting with {prefix}"))?;
        if !purged.is_empty() {
            tracing::info!(namespaces = ?purged, "removed stale namespaces");
        }
        util::purge_temp_files(util::STALE_TEMP_PATTERN)?;
        Ok(())
    }

    fn build(&mut self, profile: &ImpairmentProfile) -> Result<Topology> {
        Topology::build(&self.config, profile)
            .with_context(|| format!("building topology for profile {}", profile.name))
    }

    fn teardown(&mut self, topology: Topology) -> Result<()> {
        Ok(topology.teardown()?)
    }
}

/// [`Invoker`] running rsync in the client namespace against the target.
pub struct NetnsInvoker<'r, R> {
    runner: &'r R,
    source_dir: PathBuf,
    timeouts: Timeouts,
}

impl<'r, R: CommandRunner> NetnsInvoker<'r, R> {
    pub fn new(runner: &'r R, source_dir: PathBuf, timeouts: Timeouts) -> Self {
        Self {
            runner,
            source_dir,
            timeouts,
        }
    }
}

impl<R: CommandRunner> Invoker<Topology> for NetnsInvoker<'_, R> {
    fn transfer(&mut self, topology: &Topology, trial: &TrialSpec<'_>) -> io::Result<RunOutput> {
        let source = self.source_dir.join(trial.file_size.file_name());
        let target = topology.target_addr();
        let dest = Destination {
            host: &target,
            dir: &topology.config().dest_dir,
            client_config: None,
        };
        let argv = topology
            .node(Node::Client)
            .wrap_argv(&trial.protocol.transfer_argv(&source, &dest));
        tracing::debug!(command = %argv.join(" "), "running transfer");
        self.runner.run(&argv, self.timeouts.transfer)
    }

    fn cleanup(&mut self, topology: &Topology, trial: &TrialSpec<'_>) -> io::Result<()> {
        let path = format!(
            "{}/{}",
            topology.config().dest_dir.trim_end_matches('/'),
            trial.file_size.file_name()
        );
        let argv = topology
            .node(Node::Target)
            .wrap_argv(&["rm".into(), "-f".into(), path]);
        let out = self.runner.run(&argv, self.timeouts.cleanup)?;
        if out.timed_out {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "cleanup timed out"));
        }
        if !out.success() {
            return Err(io::Error::other(format!("cleanup failed: {}", out.output.trim())));
        }
        Ok(())
    }
}

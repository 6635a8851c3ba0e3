//! Measurements against real hosts: file transfer throughput and
//! time-to-shell.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::HarnessConfig;
use crate::exec::CommandRunner;
use crate::parse::{parse_speed, Reading};
use crate::protocol::{BaselineClient, Destination, Protocol};
use crate::record::{ResultLog, ShellRecord, TransferRecord};
use crate::util;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignSummary {
    pub rows: usize,
    /// Attempts cut off at their deadline.
    pub timeouts: usize,
    /// Attempts whose command could not be started.
    pub failures: usize,
}

/// Copies every configured file size to every host with both protocols.
pub fn run_transfers<R: CommandRunner>(
    config: &HarnessConfig,
    runner: &R,
    log: &ResultLog<TransferRecord>,
) -> Result<CampaignSummary> {
    let transfer = &config.transfer;
    anyhow::ensure!(!transfer.hosts.is_empty(), "no [[transfer.hosts]] configured");

    if let Err(err) = util::purge_temp_files(util::STALE_TEMP_PATTERN) {
        tracing::warn!(error = %err, "failed to purge stale temporary files");
    }

    let protocols = [
        Protocol::Candidate(config.candidate.clone()),
        Protocol::Baseline(config.baseline.clone()),
    ];
    let mut summary = CampaignSummary::default();

    for repetition in 1..=config.repetitions {
        for host in &transfer.hosts {
            for size in &transfer.file_sizes {
                let file_name = size.file_name();
                remove_remote(
                    runner,
                    &config.baseline,
                    &host.host,
                    &file_name,
                    config.timeouts.cleanup,
                );

                for protocol in &protocols {
                    let source = transfer.source_dir.join(&file_name);
                    let dest = Destination {
                        host: &host.host,
                        dir: "",
                        client_config: host.client_config.as_deref(),
                    };
                    let argv = protocol.transfer_argv(&source, &dest);
                    tracing::debug!(command = %argv.join(" "), "running transfer");

                    let reading = match runner.run(&argv, config.timeouts.transfer) {
                        Ok(out) if out.timed_out => {
                            summary.timeouts += 1;
                            Reading::TimedOut
                        }
                        Ok(out) => parse_speed(&out.output, transfer.max_speed),
                        Err(err) => {
                            tracing::warn!(
                                protocol = %protocol,
                                error = %err,
                                "transfer could not be started"
                            );
                            summary.failures += 1;
                            Reading::Missing
                        }
                    };

                    log.append(&TransferRecord {
                        time: util::now(),
                        host: host.host.clone(),
                        file_size: size.label().to_string(),
                        protocol: protocol.label().to_string(),
                        speed_mbps: reading.value(),
                    })
                    .with_context(|| format!("writing {}", log.path().display()))?;
                    summary.rows += 1;
                    tracing::info!(
                        repetition,
                        host = %host.host,
                        file_size = %size,
                        protocol = %protocol,
                        reading = %reading,
                        "transfer recorded"
                    );

                    remove_remote(
                        runner,
                        &config.baseline,
                        &host.host,
                        &file_name,
                        config.timeouts.cleanup,
                    );
                    pause(config.timeouts.settle);
                }
            }
        }
    }
    Ok(summary)
}

/// Measures how long each protocol takes to run a command in a fresh remote
/// shell.
pub fn run_time_to_shell<R: CommandRunner>(
    config: &HarnessConfig,
    runner: &R,
    log: &ResultLog<ShellRecord>,
    run_label: &str,
) -> Result<CampaignSummary> {
    let shell = &config.shell;
    anyhow::ensure!(!shell.hosts.is_empty(), "no [[shell.hosts]] configured");
    let mut summary = CampaignSummary::default();

    for repetition in 1..=config.repetitions {
        for host in &shell.hosts {
            for protocol in &host.protocols {
                let argv = protocol.shell_argv(&host.host, &shell.remote_command);
                let duration = match runner.first_line_containing(
                    &argv,
                    &shell.marker,
                    config.timeouts.shell,
                ) {
                    Ok(Some(elapsed)) => elapsed,
                    Ok(None) => {
                        tracing::warn!(
                            protocol = %protocol,
                            host = %host.host,
                            marker = %shell.marker,
                            "marker not seen before deadline"
                        );
                        summary.timeouts += 1;
                        Duration::ZERO
                    }
                    Err(err) => {
                        tracing::warn!(
                            protocol = %protocol,
                            error = %err,
                            "shell could not be started"
                        );
                        summary.failures += 1;
                        Duration::ZERO
                    }
                };

                log.append(&ShellRecord {
                    time: util::now(),
                    protocol: protocol.label().to_string(),
                    duration,
                    host: host.host.clone(),
                    run_label: run_label.to_string(),
                })
                .with_context(|| format!("writing {}", log.path().display()))?;
                summary.rows += 1;
                tracing::info!(
                    repetition,
                    host = %host.host,
                    protocol = %protocol,
                    seconds = duration.as_secs_f64(),
                    "time to shell recorded"
                );
                pause(config.timeouts.settle);
            }
        }
    }
    Ok(summary)
}

/// Deletes `file_name` from the login directory on `host` over plain ssh.
/// Failures are logged only.
fn remove_remote<R: CommandRunner>(
    runner: &R,
    baseline: &BaselineClient,
    host: &str,
    file_name: &str,
    limit: Duration,
) {
    let argv = baseline.remote_argv(host, &format!("rm -f {file_name}"));
    match runner.run(&argv, limit) {
        Ok(out) if out.success() => {}
        Ok(out) if out.timed_out => {
            tracing::warn!(host, file = file_name, "remote cleanup timed out")
        }
        Ok(out) => {
            tracing::warn!(
                host,
                file = file_name,
                output = %out.output.trim(),
                "remote cleanup failed"
            )
        }
        Err(err) => tracing::warn!(host, error = %err, "remote cleanup could not be started"),
    }
}

fn pause(settle: Duration) {
    if !settle.is_zero() {
        std::thread::sleep(settle);
    }
}

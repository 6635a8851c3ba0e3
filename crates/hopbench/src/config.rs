use std::path::{Path, PathBuf};
use std::time::Duration;

use hopbench_netsim::{CatalogError, ImpairmentProfile, ProfileCatalog, TopologyConfig};
use serde::Deserialize;
use thiserror::Error;

use crate::protocol::{BaselineClient, CandidateClient, FileSize, Protocol, ProtocolKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid duration {value:?} for {field}: {reason}")]
    InvalidDuration {
        field: String,
        value: String,
        reason: String,
    },
    #[error("invalid file size {0:?}, expected e.g. \"100MB\" or \"1GB\"")]
    InvalidFileSize(String),
    #[error("unknown profile catalog {0:?}, expected \"builtin\" or \"composite\"")]
    UnknownCatalog(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("namespace prefix {0:?} must be 1-8 ASCII alphanumeric characters")]
    InvalidPrefix(String),
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("repetitions must be at least 1")]
    ZeroRepetitions,
}

// ── Raw input ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HarnessConfigInput {
    pub repetitions: Option<u32>,
    pub candidate: CandidateInput,
    pub baseline: BaselineInput,
    pub timeouts: TimeoutsInput,
    pub emulation: EmulationInput,
    pub transfer: TransferInput,
    pub shell: ShellInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CandidateInput {
    pub label: Option<String>,
    pub command: Option<Vec<String>>,
    pub config: Option<PathBuf>,
    pub args: Vec<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BaselineInput {
    pub label: Option<String>,
    pub command: Option<Vec<String>>,
    pub cipher: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutsInput {
    pub transfer: Option<String>,
    pub cleanup: Option<String>,
    pub settle: Option<String>,
    pub shell: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmulationInput {
    pub results: Option<PathBuf>,
    pub file_sizes: Vec<String>,
    pub protocols: Vec<ProtocolKind>,
    pub catalog: Option<String>,
    pub profiles: Vec<ProfileInput>,
    pub prefix: Option<String>,
    pub queue_limit: Option<u32>,
    pub source_dir: Option<PathBuf>,
    pub dest_dir: Option<String>,
    pub target_server: Option<Vec<String>>,
    pub sshd: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileInput {
    pub name: String,
    pub bandwidth_mbps: f64,
    pub delay: String,
    pub jitter: Option<String>,
    #[serde(default)]
    pub loss_pct: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransferInput {
    pub results: Option<PathBuf>,
    pub file_sizes: Vec<String>,
    pub hosts: Vec<TransferHostInput>,
    pub max_speed: Option<f64>,
    pub source_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferHostInput {
    pub host: String,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShellInput {
    pub results: Option<PathBuf>,
    pub marker: Option<String>,
    pub remote_command: Option<String>,
    pub hosts: Vec<ShellHostInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShellHostInput {
    pub host: String,
    #[serde(default)]
    pub protocols: Vec<ShellProtocolInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShellProtocolInput {
    pub kind: ProtocolKind,
    pub label: Option<String>,
    pub user: Option<String>,
    pub config: Option<PathBuf>,
}

// ── Resolved configuration ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Timeouts {
    /// Ceiling for one transfer.
    pub transfer: Duration,
    /// Ceiling for remote cleanup after a transfer.
    pub cleanup: Duration,
    /// Pause after every trial.
    pub settle: Duration,
    /// Deadline for the time-to-shell marker.
    pub shell: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            transfer: Duration::from_secs(1000),
            cleanup: Duration::from_secs(60),
            settle: Duration::from_secs(1),
            shell: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmulationConfig {
    pub results: PathBuf,
    pub file_sizes: Vec<FileSize>,
    pub protocols: Vec<Protocol>,
    pub catalog: ProfileCatalog,
    pub topology: TopologyConfig,
    /// Directory holding the `<size>_file` sources.
    pub source_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TransferHost {
    pub host: String,
    pub client_config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub results: PathBuf,
    pub file_sizes: Vec<FileSize>,
    pub hosts: Vec<TransferHost>,
    /// Rates above this many MB/s are discarded as artifacts.
    pub max_speed: Option<f64>,
    pub source_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ShellHost {
    pub host: String,
    pub protocols: Vec<Protocol>,
}

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub results: PathBuf,
    pub marker: String,
    pub remote_command: String,
    pub hosts: Vec<ShellHost>,
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub repetitions: u32,
    pub candidate: CandidateClient,
    pub baseline: BaselineClient,
    pub timeouts: Timeouts,
    pub emulation: EmulationConfig,
    pub transfer: TransferConfig,
    pub shell: ShellConfig,
}

impl HarnessConfigInput {
    pub fn resolve(self) -> Result<HarnessConfig, ConfigError> {
        let repetitions = self.repetitions.unwrap_or(1);
        if repetitions == 0 {
            return Err(ConfigError::ZeroRepetitions);
        }

        let candidate = CandidateClient {
            label: self.candidate.label.unwrap_or_else(|| "Hop".into()),
            command: non_empty_command(self.candidate.command, "hop", "candidate.command")?,
            config: self
                .candidate
                .config
                .unwrap_or_else(|| PathBuf::from("client_config.toml")),
            args: self.candidate.args,
            user: self.candidate.user.unwrap_or_else(|| "root".into()),
        };
        let baseline = BaselineClient {
            label: self.baseline.label.unwrap_or_else(|| "SSH".into()),
            command: non_empty_command(self.baseline.command, "ssh", "baseline.command")?,
            cipher: self
                .baseline
                .cipher
                .unwrap_or_else(|| "chacha20-poly1305@openssh.com".into()),
            user: self.baseline.user.unwrap_or_else(|| "root".into()),
        };

        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            transfer: duration_or("timeouts.transfer", self.timeouts.transfer, defaults.transfer)?,
            cleanup: duration_or("timeouts.cleanup", self.timeouts.cleanup, defaults.cleanup)?,
            settle: duration_or("timeouts.settle", self.timeouts.settle, defaults.settle)?,
            shell: duration_or("timeouts.shell", self.timeouts.shell, defaults.shell)?,
        };

        let emulation = resolve_emulation(self.emulation, &candidate, &baseline)?;

        let transfer = TransferConfig {
            results: self
                .transfer
                .results
                .unwrap_or_else(|| PathBuf::from("transfer_data.csv")),
            file_sizes: file_sizes_or(self.transfer.file_sizes, &["100MB", "10MB", "1GB"])?,
            hosts: self
                .transfer
                .hosts
                .into_iter()
                .map(|h| TransferHost {
                    host: h.host,
                    client_config: h.config,
                })
                .collect(),
            max_speed: Some(self.transfer.max_speed.unwrap_or(300.0)),
            source_dir: self.transfer.source_dir.unwrap_or_else(|| PathBuf::from(".")),
        };

        let shell = ShellConfig {
            results: self
                .shell
                .results
                .unwrap_or_else(|| PathBuf::from("tts_data_local.csv")),
            marker: self.shell.marker.unwrap_or_else(|| "Connected".into()),
            remote_command: self
                .shell
                .remote_command
                .unwrap_or_else(|| "echo Connected && exit".into()),
            hosts: self
                .shell
                .hosts
                .into_iter()
                .map(|h| ShellHost {
                    protocols: if h.protocols.is_empty() {
                        vec![Protocol::Candidate(candidate.clone())]
                    } else {
                        h.protocols
                            .into_iter()
                            .map(|p| shell_protocol(p, &candidate, &baseline))
                            .collect()
                    },
                    host: h.host,
                })
                .collect(),
        };

        Ok(HarnessConfig {
            repetitions,
            candidate,
            baseline,
            timeouts,
            emulation,
            transfer,
            shell,
        })
    }
}

fn resolve_emulation(
    input: EmulationInput,
    candidate: &CandidateClient,
    baseline: &BaselineClient,
) -> Result<EmulationConfig, ConfigError> {
    let kinds = if input.protocols.is_empty() {
        vec![ProtocolKind::Candidate]
    } else {
        input.protocols
    };
    let protocols: Vec<Protocol> = kinds
        .iter()
        .map(|kind| match kind {
            ProtocolKind::Candidate => Protocol::Candidate(candidate.clone()),
            ProtocolKind::Baseline => Protocol::Baseline(baseline.clone()),
        })
        .collect();

    let catalog = if input.profiles.is_empty() {
        match input.catalog.as_deref().unwrap_or("builtin") {
            "builtin" => ProfileCatalog::builtin(),
            "composite" => ProfileCatalog::composite(),
            other => return Err(ConfigError::UnknownCatalog(other.to_string())),
        }
    } else {
        let profiles = input
            .profiles
            .into_iter()
            .map(resolve_profile)
            .collect::<Result<Vec<_>, _>>()?;
        ProfileCatalog::new(profiles)?
    };

    let mut topology = TopologyConfig::default();
    if let Some(prefix) = input.prefix {
        if prefix.is_empty()
            || prefix.len() > 8
            || !prefix.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(ConfigError::InvalidPrefix(prefix));
        }
        topology.prefix = prefix;
    }
    if let Some(limit) = input.queue_limit {
        topology.queue_limit = limit.max(1);
    }
    if let Some(dir) = input.dest_dir {
        topology.dest_dir = dir;
    }
    if let Some(server) = input.target_server {
        if server.is_empty() {
            return Err(ConfigError::Empty("emulation.target_server"));
        }
        topology.target_server = Some(server);
    }
    topology.sshd = input.sshd.or_else(|| {
        kinds
            .contains(&ProtocolKind::Baseline)
            .then(|| "/usr/sbin/sshd".to_string())
    });

    Ok(EmulationConfig {
        results: input
            .results
            .unwrap_or_else(|| PathBuf::from("results_hop_local.csv")),
        file_sizes: file_sizes_or(input.file_sizes, &["100MB"])?,
        protocols,
        catalog,
        topology,
        source_dir: input.source_dir.unwrap_or_else(|| PathBuf::from(".")),
    })
}

fn resolve_profile(input: ProfileInput) -> Result<ImpairmentProfile, ConfigError> {
    let field = format!("emulation.profiles.{}", input.name);
    let delay = parse_duration(&format!("{field}.delay"), &input.delay)?;
    let jitter = match &input.jitter {
        Some(j) => parse_duration(&format!("{field}.jitter"), j)?,
        None => Duration::ZERO,
    };
    Ok(ImpairmentProfile {
        name: input.name,
        bandwidth_mbps: input.bandwidth_mbps,
        delay,
        jitter,
        loss_pct: input.loss_pct,
    })
}

fn shell_protocol(
    input: ShellProtocolInput,
    candidate: &CandidateClient,
    baseline: &BaselineClient,
) -> Protocol {
    match input.kind {
        ProtocolKind::Candidate => {
            let mut c = candidate.clone();
            if let Some(label) = input.label {
                c.label = label;
            }
            if let Some(user) = input.user {
                c.user = user;
            }
            if let Some(config) = input.config {
                c.config = config;
            }
            Protocol::Candidate(c)
        }
        ProtocolKind::Baseline => {
            let mut b = baseline.clone();
            if let Some(label) = input.label {
                b.label = label;
            }
            if let Some(user) = input.user {
                b.user = user;
            }
            Protocol::Baseline(b)
        }
    }
}

fn non_empty_command(
    command: Option<Vec<String>>,
    default: &str,
    field: &'static str,
) -> Result<Vec<String>, ConfigError> {
    match command {
        None => Ok(vec![default.to_string()]),
        Some(c) if c.is_empty() => Err(ConfigError::Empty(field)),
        Some(c) => Ok(c),
    }
}

fn file_sizes_or(labels: Vec<String>, default: &[&str]) -> Result<Vec<FileSize>, ConfigError> {
    if labels.is_empty() {
        default.iter().map(|l| FileSize::parse(l)).collect()
    } else {
        labels.iter().map(|l| FileSize::parse(l)).collect()
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|e| ConfigError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn duration_or(
    field: &str,
    value: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(v) => parse_duration(field, &v),
        None => Ok(default),
    }
}

impl HarnessConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return HarnessConfigInput::default().resolve();
        }
        let parsed: HarnessConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

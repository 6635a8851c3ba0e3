//! Protocols under test and the commands they run.
//!
//! Both protocols move files with `rsync`; they differ only in the remote
//! shell rsync tunnels through. The candidate is the hop client, the
//! baseline is OpenSSH pinned to one cipher suite.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::ConfigError;

/// Which side of the comparison a protocol sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Candidate,
    Baseline,
}

/// The hop client.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateClient {
    pub label: String,
    /// Client invocation, e.g. `["hop"]` or `["go", "run", "./cmd/hop"]`.
    pub command: Vec<String>,
    /// Client configuration passed with `-C`.
    pub config: PathBuf,
    /// Extra flags placed before the destination, e.g. `--datatimeout 10s`.
    pub args: Vec<String>,
    pub user: String,
}

/// OpenSSH with a fixed cipher.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineClient {
    pub label: String,
    pub command: Vec<String>,
    pub cipher: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Protocol {
    Candidate(CandidateClient),
    Baseline(BaselineClient),
}

/// Where a transfer goes.
#[derive(Debug, Clone)]
pub struct Destination<'a> {
    pub host: &'a str,
    /// Remote directory; empty means the login directory.
    pub dir: &'a str,
    /// Per-host client configuration overriding the candidate default.
    pub client_config: Option<&'a Path>,
}

impl Protocol {
    pub fn label(&self) -> &str {
        match self {
            Protocol::Candidate(c) => &c.label,
            Protocol::Baseline(b) => &b.label,
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        match self {
            Protocol::Candidate(_) => ProtocolKind::Candidate,
            Protocol::Baseline(_) => ProtocolKind::Baseline,
        }
    }

    /// `rsync` invocation copying `source` to `dest`, asking for whole-run
    /// progress output so the rate can be parsed afterwards.
    pub fn transfer_argv(&self, source: &Path, dest: &Destination<'_>) -> Vec<String> {
        let mut argv = vec![
            "rsync".to_string(),
            "--no-compress".to_string(),
            "--info=progress2".to_string(),
        ];
        match self {
            Protocol::Candidate(c) => {
                let config = dest.client_config.unwrap_or(c.config.as_path());
                let mut rsh = c.command.clone();
                rsh.push("-C".into());
                rsh.push(config.display().to_string());
                rsh.extend(c.args.iter().cloned());
                rsh.push(format!("{}@{}", c.user, dest.host));
                argv.push(format!("--rsh={}", rsh.join(" ")));
                argv.push(source.display().to_string());
                // the hop client already names the host
                argv.push(format!(":{}", dest.dir));
            }
            Protocol::Baseline(b) => {
                let mut rsh = b.command.clone();
                rsh.push("-c".into());
                rsh.push(b.cipher.clone());
                argv.push("-e".into());
                argv.push(rsh.join(" "));
                argv.push(source.display().to_string());
                argv.push(format!("{}@{}:{}", b.user, dest.host, dest.dir));
            }
        }
        argv
    }

    /// Opens a remote shell on `host` and runs `remote` there.
    pub fn shell_argv(&self, host: &str, remote: &str) -> Vec<String> {
        match self {
            Protocol::Candidate(c) => {
                let mut argv = c.command.clone();
                argv.push("-C".into());
                argv.push(c.config.display().to_string());
                argv.push("-c".into());
                argv.push(remote.to_string());
                argv.push(format!("{}@{}", c.user, host));
                argv
            }
            Protocol::Baseline(b) => {
                let mut argv = b.command.clone();
                argv.push("-c".into());
                argv.push(b.cipher.clone());
                argv.push(format!("{}@{}", b.user, host));
                argv.push(remote.to_string());
                argv
            }
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl BaselineClient {
    /// Plain `ssh user@host <remote>` used for remote housekeeping.
    pub fn remote_argv(&self, host: &str, remote: &str) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.push(format!("{}@{}", self.user, host));
        argv.push(remote.to_string());
        argv
    }
}

/// A test file size such as `100MB` or `1GB`.
///
/// Files are expected on disk as `<label>_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSize {
    label: String,
    megabytes: u64,
}

impl FileSize {
    pub fn small() -> Self {
        Self::preset("10MB", 10)
    }

    pub fn medium() -> Self {
        Self::preset("100MB", 100)
    }

    pub fn large() -> Self {
        Self::preset("1GB", 1024)
    }

    fn preset(label: &str, megabytes: u64) -> Self {
        Self {
            label: label.to_string(),
            megabytes,
        }
    }

    /// Accepts `<N>MB`, `<N>GB` (1 GB = 1024 MB) and the aliases `small`,
    /// `medium`, `large`.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let trimmed = input.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "small" => return Ok(Self::small()),
            "medium" => return Ok(Self::medium()),
            "large" => return Ok(Self::large()),
            _ => {}
        }
        let invalid = || ConfigError::InvalidFileSize(input.to_string());
        let (digits, scale) = if let Some(n) = trimmed.strip_suffix("GB") {
            (n, 1024)
        } else if let Some(n) = trimmed.strip_suffix("MB") {
            (n, 1)
        } else {
            return Err(invalid());
        };
        let n: u64 = digits.parse().map_err(|_| invalid())?;
        if n == 0 {
            return Err(invalid());
        }
        let megabytes = n.checked_mul(scale).ok_or_else(invalid)?;
        Ok(Self {
            label: trimmed.to_string(),
            megabytes,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn megabytes(&self) -> u64 {
        self.megabytes
    }

    pub fn file_name(&self) -> String {
        format!("{}_file", self.label)
    }
}

impl fmt::Display for FileSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

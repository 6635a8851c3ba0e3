//! Benchmark harness comparing the hop remote-shell protocol against an
//! OpenSSH baseline.
//!
//! - [`sweep`] runs rsync transfers across emulated links, one impairment
//!   profile at a time
//! - [`campaign`] measures transfer rate and time-to-shell on real hosts
//! - results are appended to flat files through [`record::ResultLog`]

pub mod campaign;
pub mod config;
pub mod exec;
pub mod parse;
pub mod protocol;
pub mod record;
pub mod sweep;
pub mod util;

pub use config::{ConfigError, HarnessConfig};
pub use exec::{CommandRunner, ProcessRunner, RunOutput};
pub use parse::{parse_speed, Reading, FAILURE_SENTINEL};
pub use protocol::{FileSize, Protocol, ProtocolKind};
pub use sweep::{SweepController, SweepPlan, SweepSummary};

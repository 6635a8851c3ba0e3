//! Append-only result logs.
//!
//! Every row is written with its own open/append/flush/sync so that a crash
//! mid-run loses at most the trial in flight.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;

/// One row schema.
pub trait Record {
    /// Header line written when the log file is created, if any.
    const HEADER: Option<&'static str>;

    /// The row without its line terminator.
    fn to_row(&self) -> String;
}

/// A result file holding rows of one schema.
#[derive(Debug, Clone)]
pub struct ResultLog<R> {
    path: PathBuf,
    _schema: PhantomData<fn(&R)>,
}

impl<R: Record> ResultLog<R> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _schema: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one row, preceded by the header if the file is new, and
    /// syncs it to disk before returning.
    pub fn append(&self, record: &R) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let existed = self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if !existed {
            if let Some(header) = R::HEADER {
                writeln!(file, "{header}")?;
            }
        }
        writeln!(file, "{}", record.to_row())?;
        file.flush()?;
        file.sync_data()
    }
}

/// Real-network transfer measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub time: NaiveDateTime,
    pub host: String,
    pub file_size: String,
    pub protocol: String,
    pub speed_mbps: f64,
}

impl Record for TransferRecord {
    const HEADER: Option<&'static str> = Some("Time,Host,File Size,Protocol,Speed (MB/s)");

    fn to_row(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.time.format("%Y-%m-%d %H:%M:%S"),
            csv_field(&self.host),
            csv_field(&self.file_size),
            csv_field(&self.protocol),
            self.speed_mbps
        )
    }
}

/// Time-to-shell measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct ShellRecord {
    pub time: NaiveDateTime,
    pub protocol: String,
    /// Zero when the marker never arrived.
    pub duration: Duration,
    pub host: String,
    pub run_label: String,
}

impl Record for ShellRecord {
    const HEADER: Option<&'static str> = None;

    fn to_row(&self) -> String {
        format!(
            "{};{};{};{};{}",
            self.time.format("%Y-%m-%d %H:%M:%S"),
            self.protocol,
            self.duration.as_secs_f64(),
            self.host,
            self.run_label
        )
    }
}

/// One trial of the emulation sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepRecord {
    pub time: NaiveDateTime,
    pub file_size_mb: u64,
    pub protocol: String,
    pub bandwidth_mbps: f64,
    pub delay: Duration,
    pub jitter: Duration,
    pub loss_pct: f64,
    pub value: f64,
}

impl Record for SweepRecord {
    const HEADER: Option<&'static str> = None;

    fn to_row(&self) -> String {
        // trailing separator kept for existing plot readers
        format!(
            "{};{};{};{};{}ms;{}ms;{};{};",
            self.time.format("%Y-%m-%d %H:%M:%S%.6f"),
            self.file_size_mb,
            self.protocol,
            self.bandwidth_mbps,
            millis(self.delay),
            millis(self.jitter),
            self.loss_pct,
            self.value
        )
    }
}

/// Milliseconds, fractional below 1 ms resolution.
fn millis(d: Duration) -> f64 {
    d.as_micros() as f64 / 1000.0
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32, micro: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_micro_opt(h, m, s, micro)
            .unwrap()
    }

    fn transfer(speed: f64) -> TransferRecord {
        TransferRecord {
            time: at(14, 5, 9, 0),
            host: "ny.example".into(),
            file_size: "100MB".into(),
            protocol: "rsync_hop".into(),
            speed_mbps: speed,
        }
    }

    #[test]
    fn header_written_once_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/transfer_data.csv");

        ResultLog::new(&path).append(&transfer(11.5)).unwrap();
        let second = ResultLog::new(&path);
        second.append(&transfer(0.0001)).unwrap();
        second.append(&transfer(0.0)).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "Time,Host,File Size,Protocol,Speed (MB/s)",
                "2024-03-09 14:05:09,ny.example,100MB,rsync_hop,11.5",
                "2024-03-09 14:05:09,ny.example,100MB,rsync_hop,0.0001",
                "2024-03-09 14:05:09,ny.example,100MB,rsync_hop,0",
            ]
        );
    }

    #[test]
    fn existing_file_gets_no_header() {
        let file = tempfile::NamedTempFile::new().unwrap();
        ResultLog::new(file.path()).append(&transfer(1.25)).unwrap();
        let text = fs::read_to_string(file.path()).unwrap();
        assert_eq!(text, "2024-03-09 14:05:09,ny.example,100MB,rsync_hop,1.25\n");
    }

    #[test]
    fn sweep_row_layout() {
        let record = SweepRecord {
            time: at(9, 0, 1, 250),
            file_size_mb: 100,
            protocol: "Hop".into(),
            bandwidth_mbps: 100.0,
            delay: Duration::from_millis(10),
            jitter: Duration::from_millis(5),
            loss_pct: 0.25,
            value: 11.02,
        };
        assert_eq!(
            record.to_row(),
            "2024-03-09 09:00:01.000250;100;Hop;100;10ms;5ms;0.25;11.02;"
        );
    }

    #[test]
    fn sweep_row_keeps_sub_millisecond_times() {
        let record = SweepRecord {
            time: at(9, 0, 1, 0),
            file_size_mb: 10,
            protocol: "SSH".into(),
            bandwidth_mbps: 10.0,
            delay: Duration::from_micros(1500),
            jitter: Duration::from_micros(500),
            loss_pct: 0.0,
            value: 0.0001,
        };
        assert_eq!(
            record.to_row(),
            "2024-03-09 09:00:01.000000;10;SSH;10;1.5ms;0.5ms;0;0.0001;"
        );
    }

    #[test]
    fn shell_rows_have_no_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tts.csv");
        let log = ResultLog::new(&path);
        log.append(&ShellRecord {
            time: at(12, 0, 0, 123_456),
            protocol: "Hop Hidden".into(),
            duration: Duration::from_millis(1500),
            host: "127.0.0.1".into(),
            run_label: "local".into(),
        })
        .unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "2024-03-09 12:00:00;Hop Hidden;1.5;127.0.0.1;local\n"
        );
    }

    #[test]
    fn fields_with_commas_are_quoted() {
        let mut record = transfer(2.0);
        record.protocol = "hop, hidden".into();
        assert!(record.to_row().contains(",\"hop, hidden\","));
    }
}

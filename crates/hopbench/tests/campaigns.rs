use std::cell::RefCell;
use std::fs;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use hopbench::campaign::{run_time_to_shell, run_transfers};
use hopbench::record::ResultLog;
use hopbench::{CommandRunner, HarnessConfig, RunOutput};

/// Scripted runner: the hop client is fast, OpenSSH always stalls.
#[derive(Default)]
struct FakeRunner {
    runs: RefCell<Vec<Vec<String>>>,
    shells: RefCell<Vec<Vec<String>>>,
}

impl CommandRunner for FakeRunner {
    fn run(&self, argv: &[String], limit: Duration) -> io::Result<RunOutput> {
        self.runs.borrow_mut().push(argv.to_vec());
        let ok = Some(ExitStatus::from_raw(0));
        match argv[0].as_str() {
            "rsync" if argv.iter().any(|a| a == "-e") => {
                assert_eq!(limit, Duration::from_secs(150));
                Ok(RunOutput {
                    timed_out: true,
                    ..Default::default()
                })
            }
            "rsync" => Ok(RunOutput {
                output: "  10,485,760 100%    7.50MB/s    0:00:01 (xfr#1, to-chk=0/1)\n".into(),
                status: ok,
                timed_out: false,
            }),
            "ssh" => Ok(RunOutput {
                status: ok,
                ..Default::default()
            }),
            other => Err(io::Error::new(io::ErrorKind::NotFound, other.to_string())),
        }
    }

    fn first_line_containing(
        &self,
        argv: &[String],
        marker: &str,
        deadline: Duration,
    ) -> io::Result<Option<Duration>> {
        assert_eq!(marker, "Connected");
        assert_eq!(deadline, Duration::from_secs(20));
        self.shells.borrow_mut().push(argv.to_vec());
        match argv[0].as_str() {
            "hop" => Ok(Some(Duration::from_millis(1500))),
            "ssh" => Ok(None),
            other => Err(io::Error::new(io::ErrorKind::NotFound, other.to_string())),
        }
    }
}

const CONFIG: &str = r#"
    repetitions = 2

    [timeouts]
    transfer = "150s"
    settle = "0s"

    [transfer]
    file_sizes = ["10MB"]

    [[transfer.hosts]]
    host = "ny.example"
    config = "./ny/config.toml"

    [[shell.hosts]]
    host = "127.0.0.1"

    [[shell.hosts.protocols]]
    kind = "candidate"

    [[shell.hosts.protocols]]
    kind = "candidate"
    label = "Hop Hidden"
    config = "hidden.toml"

    [[shell.hosts.protocols]]
    kind = "baseline"
    label = "SSH"

    [[shell.hosts.protocols]]
    kind = "candidate"
    label = "Broken"
    config = "broken.toml"
"#;

#[test]
fn transfer_campaign_logs_every_attempt() {
    let mut config = HarnessConfig::from_toml_str(CONFIG).unwrap();
    config.transfer.source_dir = "/data".into();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transfer_data.csv");
    let runner = FakeRunner::default();

    let summary = run_transfers(&config, &runner, &ResultLog::new(&path)).unwrap();
    assert_eq!(summary.rows, 4);
    assert_eq!(summary.timeouts, 2);

    let text = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "Time,Host,File Size,Protocol,Speed (MB/s)");
    assert_eq!(lines.len(), 5);
    assert!(lines[1].ends_with(",ny.example,10MB,Hop,7.5"));
    assert!(lines[2].ends_with(",ny.example,10MB,SSH,0.0001"));

    let runs = runner.runs.borrow();
    // per repetition: clear, hop, clear, ssh, clear
    assert_eq!(runs.len(), 10);
    assert_eq!(runs[0], ["ssh", "root@ny.example", "rm -f 10MB_file"]);
    assert_eq!(
        runs[1][3],
        "--rsh=hop -C ./ny/config.toml root@ny.example"
    );
    assert_eq!(runs[1][4], "/data/10MB_file");
    assert_eq!(runs[1][5], ":");
}

#[test]
fn transfer_campaign_needs_hosts() {
    let config = HarnessConfig::from_toml_str("").unwrap();
    let dir = tempfile::tempdir().unwrap();
    let log = ResultLog::new(dir.path().join("t.csv"));
    assert!(run_transfers(&config, &FakeRunner::default(), &log).is_err());
}

#[test]
fn time_to_shell_records_zero_for_missed_markers() {
    let config = HarnessConfig::from_toml_str(CONFIG).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tts.csv");
    let runner = FakeRunner::default();

    let summary = run_time_to_shell(&config, &runner, &ResultLog::new(&path), "lan").unwrap();
    assert_eq!(summary.rows, 8);
    assert_eq!(summary.timeouts, 2);
    assert_eq!(summary.failures, 0);

    let text = fs::read_to_string(&path).unwrap();
    let fields: Vec<Vec<&str>> = text.lines().map(|l| l.split(';').collect()).collect();
    assert_eq!(fields.len(), 8);
    assert_eq!(fields[0][1..], ["Hop", "1.5", "127.0.0.1", "lan"]);
    assert_eq!(fields[1][1..], ["Hop Hidden", "1.5", "127.0.0.1", "lan"]);
    assert_eq!(fields[2][1..], ["SSH", "0", "127.0.0.1", "lan"]);
    assert_eq!(fields[3][1], "Broken");

    let shells = runner.shells.borrow();
    assert_eq!(shells[1][..3], ["hop", "-C", "hidden.toml"]);
    assert_eq!(shells[2].last().unwrap(), "echo Connected && exit");
}

//! Child process execution with wall-clock deadlines.
//!
//! The harness is sequential; the runner owns a current-thread tokio
//! runtime and blocks on each invocation. Children are started in their own
//! process group so that a timeout also takes down helpers they spawned
//! (rsync forks its remote shell).

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How long captured output may keep draining once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Result of one bounded invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    /// Stdout followed by stderr.
    pub output: String,
    /// `None` when the exit status could not be collected.
    pub status: Option<ExitStatus>,
    pub timed_out: bool,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }
}

pub trait CommandRunner {
    /// Runs `argv` to completion or until `limit` elapses, in which case the
    /// child is killed and reaped and `timed_out` is set.
    fn run(&self, argv: &[String], limit: Duration) -> io::Result<RunOutput>;

    /// Starts `argv` and reads its stdout line by line until one contains
    /// `marker`. Returns the elapsed time since spawn, or `None` when the
    /// deadline passes or output ends first. The child is killed either way.
    fn first_line_containing(
        &self,
        argv: &[String],
        marker: &str,
        deadline: Duration,
    ) -> io::Result<Option<Duration>>;
}

/// [`CommandRunner`] backed by real OS processes.
#[derive(Debug)]
pub struct ProcessRunner {
    runtime: Runtime,
}

impl ProcessRunner {
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, argv: &[String], limit: Duration) -> io::Result<RunOutput> {
        self.runtime.block_on(run_bounded(argv, limit))
    }

    fn first_line_containing(
        &self,
        argv: &[String],
        marker: &str,
        deadline: Duration,
    ) -> io::Result<Option<Duration>> {
        self.runtime.block_on(wait_for_marker(argv, marker, deadline))
    }
}

fn command(argv: &[String]) -> io::Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .process_group(0);
    Ok(cmd)
}

async fn run_bounded(argv: &[String], limit: Duration) -> io::Result<RunOutput> {
    let mut child = command(argv)?
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let pid = child.id();

    let mut stdout_task = tokio::spawn(drain(child.stdout.take()));
    let mut stderr_task = tokio::spawn(drain(child.stderr.take()));

    let (status, timed_out) = match timeout(limit, child.wait()).await {
        Ok(status) => (Some(status?), false),
        Err(_) => {
            tracing::warn!(
                command = %argv.join(" "),
                timeout = %humantime::format_duration(limit),
                "command exceeded timeout; terminating"
            );
            (terminate(&mut child, pid).await, true)
        }
    };

    let mut output = collect(&mut stdout_task).await;
    output.push_str(&collect(&mut stderr_task).await);
    Ok(RunOutput {
        output,
        status,
        timed_out,
    })
}

async fn wait_for_marker(
    argv: &[String],
    marker: &str,
    deadline: Duration,
) -> io::Result<Option<Duration>> {
    let start = Instant::now();
    let mut child = command(argv)?
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    let pid = child.id();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("child stdout not captured"))?;

    let mut lines = BufReader::new(stdout).lines();
    let scan = async {
        while let Some(line) = lines.next_line().await? {
            if line.contains(marker) {
                return Ok::<_, io::Error>(Some(start.elapsed()));
            }
        }
        Ok(None)
    };

    let found = match timeout(deadline, scan).await {
        Ok(result) => result?,
        Err(_) => {
            tracing::debug!(marker, command = %argv.join(" "), "marker deadline passed");
            None
        }
    };
    terminate(&mut child, pid).await;
    Ok(found)
}

/// Kills the child's process group, then the child itself, and reaps it.
async fn terminate(child: &mut Child, pid: Option<u32>) -> Option<ExitStatus> {
    if let Some(pid) = pid {
        // SAFETY: killpg only sends a signal. The group id is the pid of a
        // child we spawned as group leader and have not reaped yet.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            tracing::debug!(pid, error = %io::Error::last_os_error(), "killpg failed");
        }
    }
    if let Err(err) = child.start_kill() {
        tracing::debug!(error = %err, "start_kill failed");
    }
    match child.wait().await {
        Ok(status) => Some(status),
        Err(err) => {
            tracing::warn!(error = %err, "failed to reap child");
            None
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    // keep what was read even if the pipe errors
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(task: &mut JoinHandle<String>) -> String {
    match timeout(DRAIN_GRACE, &mut *task).await {
        Ok(Ok(text)) => text,
        Ok(Err(err)) => {
            tracing::debug!(error = %err, "output reader task failed");
            String::new()
        }
        Err(_) => {
            // a surviving grandchild still holds the pipe open
            task.abort();
            String::new()
        }
    }
}

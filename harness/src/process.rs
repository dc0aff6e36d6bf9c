//! Helpers for running child processes with timeouts and bounded output.
//!
//! On unix every child leads its own process group. The whole group is killed
//! once the child exits or times out, so a forked descendant can neither keep
//! running nor hold the output pipes open past the deadline.

use std::io::{Read, Write};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Did the child exit on its own with a zero status?
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status.success()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// `output_limit_bytes` bounds the amount of stdout/stderr stored in memory (bytes beyond
/// this are discarded while still draining the pipe). A child killed on timeout reports
/// `timed_out` instead of an error.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let mut running = spawn_captured(cmd, stdin, output_limit_bytes)?;
    running.wait_with_timeout(timeout)
}

/// How long output readers may lag behind an exited child.
const READER_GRACE: Duration = Duration::from_millis(500);

type OutputHandle = mpsc::Receiver<Result<(Vec<u8>, usize)>>;

/// A spawned child whose pipes are serviced by background threads.
///
/// Stdin is fed from its own thread and output is read concurrently while the child runs,
/// so neither side can block on a full pipe.
#[derive(Debug)]
pub struct RunningCommand {
    child: Child,
    stdin_handle: Option<thread::JoinHandle<()>>,
    stdout_handle: Option<OutputHandle>,
    stderr_handle: Option<OutputHandle>,
}

/// Spawn `cmd` with piped stdout/stderr and, when `stdin` is given, piped stdin.
pub fn spawn_captured(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    output_limit_bytes: usize,
) -> Result<RunningCommand> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            Some(thread::spawn(move || {
                // A child that exits without reading closes the pipe; that is not our failure.
                if let Err(e) = child_stdin.write_all(&input) {
                    debug!(err = %e, "child stopped reading stdin");
                }
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = spawn_reader(stdout, output_limit_bytes);
    let stderr_handle = spawn_reader(stderr, output_limit_bytes);

    Ok(RunningCommand {
        child,
        stdin_handle,
        stdout_handle: Some(stdout_handle),
        stderr_handle: Some(stderr_handle),
    })
}

impl RunningCommand {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Block until the child exits or `timeout` elapses, killing it in the latter case.
    ///
    /// Returns within `timeout` plus a short grace period even when a descendant keeps the
    /// output pipes open; output still pending at that point is dropped.
    /// Can be called once; the captured output moves into the returned value.
    pub fn wait_with_timeout(&mut self, timeout: Duration) -> Result<CommandOutput> {
        let started = Instant::now();
        let mut timed_out = false;
        let status = match self.child.wait_timeout(timeout).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "command timed out, killing"
                );
                timed_out = true;
                self.kill_group();
                self.child.kill().context("kill command")?;
                self.child.wait().context("wait command after kill")?
            }
        };
        // Descendants left behind in the group would keep the pipes open.
        self.kill_group();

        let stdout_handle = self
            .stdout_handle
            .take()
            .ok_or_else(|| anyhow!("command output already collected"))?;
        let stderr_handle = self
            .stderr_handle
            .take()
            .ok_or_else(|| anyhow!("command output already collected"))?;
        let deadline = Instant::now() + timeout.saturating_sub(started.elapsed()).max(READER_GRACE);
        let (stdout, stdout_truncated) =
            collect_output(&stdout_handle, deadline).context("collect stdout")?;
        let (stderr, stderr_truncated) =
            collect_output(&stderr_handle, deadline).context("collect stderr")?;

        if let Some(handle) = self.stdin_handle.take() {
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("stdin writer thread panicked");
                }
            } else {
                debug!("stdin writer still blocked, detaching it");
            }
        }

        if stdout_truncated > 0 || stderr_truncated > 0 {
            warn!(stdout_truncated, stderr_truncated, "output truncated");
        }

        debug!(exit_code = ?status.code(), timed_out, "command finished");
        Ok(CommandOutput {
            status,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            timed_out,
        })
    }

    /// Make sure the child and its process group are gone and the child is reaped.
    /// Safe to call after `wait_with_timeout`.
    pub fn terminate(&mut self) -> Result<()> {
        // A reaped child's group id may be reused; only signal a live group.
        if self.child.try_wait().context("poll command")?.is_none() {
            self.kill_group();
            self.child.kill().context("kill command")?;
            self.child.wait().context("wait command after kill")?;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn kill_group(&self) {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let Ok(pgid) = i32::try_from(self.child.id()) else {
            return;
        };
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(pgid, err = %err, "failed to kill process group"),
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&self) {}
}

fn spawn_reader<R: Read + Send + 'static>(stream: R, limit: usize) -> OutputHandle {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver is gone once the deadline passed; nothing left to report to.
        let _ = tx.send(read_stream_limited(stream, limit));
    });
    rx
}

fn collect_output(handle: &OutputHandle, deadline: Instant) -> Result<(Vec<u8>, usize)> {
    match handle.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            warn!("output pipe still held open after the child exited, giving up on it");
            Ok((Vec::new(), 0))
        }
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn stdin_is_forwarded() {
        let output = run_command_with_timeout(
            sh("read line; echo \"got $line\""),
            Some(b"hello\n".to_vec()),
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        assert!(output.succeeded());
        assert_eq!(output.stdout_lossy(), "got hello\n");
    }

    #[test]
    fn output_beyond_limit_is_counted() {
        let output = run_command_with_timeout(
            sh("printf '0123456789'"),
            None,
            Duration::from_secs(5),
            4,
        )
        .expect("run");
        assert_eq!(output.stdout, b"0123");
        assert_eq!(output.stdout_truncated, 6);
    }

    #[test]
    fn timeout_kills_forked_descendants() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("echo started; sleep 30; echo never"),
            None,
            Duration::from_millis(300),
            64,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "returned after {:?}",
            started.elapsed()
        );
        assert_eq!(output.stdout_lossy(), "started\n");
    }

    #[test]
    fn background_child_does_not_hold_output_open() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 30 & echo quick"),
            None,
            Duration::from_secs(10),
            64,
        )
        .expect("run");
        assert!(output.succeeded());
        assert_eq!(output.stdout_lossy(), "quick\n");
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "returned after {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn slow_child_is_killed() {
        let output = run_command_with_timeout(sh("exec sleep 30"), None, Duration::from_millis(200), 64)
            .expect("run");
        assert!(output.timed_out);
        assert!(!output.succeeded());
    }

    #[test]
    fn spawned_command_can_be_waited_then_terminated() {
        let mut running = spawn_captured(sh("echo ready"), None, 64).expect("spawn");
        let output = running
            .wait_with_timeout(Duration::from_secs(5))
            .expect("wait");
        assert_eq!(output.stdout_lossy(), "ready\n");
        running.terminate().expect("terminate");
    }

    #[test]
    fn read_stream_limited_keeps_prefix() {
        let (kept, truncated) = read_stream_limited(&b"abcdef"[..], 2).expect("read");
        assert_eq!(kept, b"ab");
        assert_eq!(truncated, 4);
    }
}

//! Runs a registered program in a separate worker process.
//!
//! Lifecycle: `Created → Setup → Running → {TimedOut, Crashed, Finished} → CleanedUp`.
//!
//! Resources of a failed run (the worker process handle, its result channel and
//! request file) are not released during teardown. They move into a bounded
//! [`LeakLedger`] and are reclaimed once a later run succeeds, on an explicit
//! [`IsolatedWorker::release`], or when the ledger overflows (oldest first).
//! A new `setup()` never touches them, so it cannot fail because of an earlier
//! failed run.
//!
//! A worker that cannot be spawned at all is recorded as a `Runtime` fault and
//! the run proceeds straight to `CleanedUp`, so callers still get results.

use std::collections::VecDeque;
use std::io::Write;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, anyhow};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use super::{ExecutionStrategy, sandbox_changes};
use crate::channel::ResultChannel;
use crate::config::HarnessConfig;
use crate::environment::{ExecutionEnvironment, Results};
use crate::error::{Fault, FaultKind, HarnessError};
use crate::process::{CommandOutput, RunningCommand, spawn_captured};
use crate::unit::Invocation;
use crate::worker::{WorkerReport, WorkerRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Setup,
    Running,
    TimedOut,
    Crashed,
    Finished,
    CleanedUp,
}

/// Everything one worker run holds on to.
#[derive(Debug)]
struct RunResources {
    worker: RunningCommand,
    channel: ResultChannel,
    request: NamedTempFile,
}

impl RunResources {
    fn release(mut self) -> anyhow::Result<()> {
        self.worker.terminate().context("terminate worker")?;
        drop(self.channel);
        self.request.close().context("remove request file")?;
        Ok(())
    }
}

#[derive(Debug)]
struct RetainedRun {
    reason: String,
    resources: RunResources,
}

/// Bounded holding area for resources of failed runs.
#[derive(Debug)]
pub struct LeakLedger {
    retained: VecDeque<RetainedRun>,
    limit: usize,
    total_retained: u64,
    total_reclaimed: u64,
}

impl LeakLedger {
    pub fn new(limit: usize) -> Self {
        Self {
            retained: VecDeque::new(),
            limit,
            total_retained: 0,
            total_reclaimed: 0,
        }
    }

    fn retain(&mut self, reason: impl Into<String>, resources: RunResources) {
        let reason = reason.into();
        debug!(%reason, pid = resources.worker.id(), "retaining resources of failed run");
        self.retained.push_back(RetainedRun { reason, resources });
        self.total_retained += 1;
        while self.retained.len() > self.limit {
            if let Some(oldest) = self.retained.pop_front() {
                self.reclaim(oldest);
            }
        }
    }

    /// Release everything held. Returns how many runs were reclaimed.
    pub fn reclaim_all(&mut self) -> usize {
        let count = self.retained.len();
        while let Some(run) = self.retained.pop_front() {
            self.reclaim(run);
        }
        if count > 0 {
            info!(count, "reclaimed resources of failed runs");
        }
        count
    }

    fn reclaim(&mut self, run: RetainedRun) {
        self.total_reclaimed += 1;
        if let Err(err) = run.resources.release() {
            warn!(reason = %run.reason, err = %format!("{err:#}"), "failed to release retained run");
        }
    }

    /// Runs currently held.
    pub fn retained(&self) -> usize {
        self.retained.len()
    }

    pub fn total_retained(&self) -> u64 {
        self.total_retained
    }

    pub fn total_reclaimed(&self) -> u64 {
        self.total_reclaimed
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Supervisor side of the process-isolated strategy.
#[derive(Debug)]
pub struct IsolatedWorker {
    command: Vec<String>,
    channel_capacity: usize,
    state: WorkerState,
    timeout: Duration,
    current: Option<RunResources>,
    output: Option<CommandOutput>,
    report: Option<WorkerReport>,
    fault: Option<Fault>,
    ledger: LeakLedger,
}

impl IsolatedWorker {
    pub fn new(command: Vec<String>, channel_capacity: usize, max_retained_runs: usize) -> Self {
        Self {
            command,
            channel_capacity,
            state: WorkerState::Created,
            timeout: Duration::ZERO,
            current: None,
            output: None,
            report: None,
            fault: None,
            ledger: LeakLedger::new(max_retained_runs),
        }
    }

    pub fn from_config(cfg: &HarnessConfig) -> Self {
        Self::new(
            cfg.worker.command.clone(),
            cfg.channel_capacity_bytes,
            cfg.max_retained_runs,
        )
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn ledger(&self) -> &LeakLedger {
        &self.ledger
    }

    /// Worker stderr of the last run, for diagnostics.
    pub fn worker_stderr(&self) -> Option<String> {
        self.output.as_ref().map(CommandOutput::stderr_lossy)
    }

    /// Release the current run and everything the ledger holds.
    pub fn release(&mut self) {
        if let Some(resources) = self.current.take()
            && let Err(err) = resources.release()
        {
            warn!(err = %format!("{err:#}"), "failed to release current run");
        }
        self.ledger.reclaim_all();
    }

    fn prepare(&self, env: &ExecutionEnvironment, request: &WorkerRequest) -> anyhow::Result<RunResources> {
        let channel =
            ResultChannel::allocate(self.channel_capacity).context("allocate result channel")?;

        let mut request_file = tempfile::Builder::new()
            .prefix("harness-request-")
            .suffix(".json")
            .tempfile()
            .context("create request file")?;
        serde_json::to_writer(request_file.as_file_mut(), request).context("serialize request")?;
        request_file.flush().context("flush request file")?;

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("worker command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--request")
            .arg(request_file.path())
            .arg("--channel")
            .arg(channel.path())
            .current_dir(env.sandbox());

        let worker = spawn_captured(cmd, Some(env.stdin_bytes()), self.channel_capacity)
            .with_context(|| format!("spawn worker {program}"))?;
        Ok(RunResources {
            worker,
            channel,
            request: request_file,
        })
    }

    fn failure_reason(&self) -> Option<String> {
        match self.state {
            WorkerState::TimedOut => Some("timed out".to_string()),
            WorkerState::Crashed => Some(match &self.output {
                Some(output) => format!("worker exited with {:?}", output.status.code()),
                None => "worker could not be waited on".to_string(),
            }),
            _ if self.report.is_none() => Some("no report".to_string()),
            _ => None,
        }
    }
}

impl ExecutionStrategy for IsolatedWorker {
    #[instrument(skip_all, fields(sandbox = %env.sandbox().display()))]
    fn setup(
        &mut self,
        env: &ExecutionEnvironment,
        invocation: &Invocation,
    ) -> Result<(), HarnessError> {
        if let Some(stale) = self.current.take() {
            self.ledger.retain("never cleaned up", stale);
        }
        self.output = None;
        self.report = None;
        self.fault = None;
        self.timeout = env.timeout();

        let request = WorkerRequest::from_invocation(invocation)?;
        match self.prepare(env, &request) {
            Ok(resources) => {
                debug!(pid = resources.worker.id(), "worker spawned");
                self.current = Some(resources);
                self.state = WorkerState::Setup;
            }
            Err(err) => {
                // Reported through the results like any other failed run.
                warn!(err = %format!("{err:#}"), "worker did not start");
                self.fault = Some(Fault::runtime(format!("{err:#}")));
                self.state = WorkerState::Crashed;
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs()))]
    fn run(&mut self) -> Result<(), HarnessError> {
        if self.state == WorkerState::Crashed && self.current.is_none() {
            debug!("worker never started, nothing to run");
            return Ok(());
        }
        if self.state != WorkerState::Setup {
            return Err(HarnessError::Other(anyhow!(
                "worker cannot run in state {:?}",
                self.state
            )));
        }
        let Some(resources) = self.current.as_mut() else {
            return Err(HarnessError::Other(anyhow!("worker has no resources")));
        };
        self.state = WorkerState::Running;

        match resources.worker.wait_with_timeout(self.timeout) {
            Ok(output) => {
                self.state = if output.timed_out {
                    WorkerState::TimedOut
                } else if output.status.success() {
                    WorkerState::Finished
                } else {
                    WorkerState::Crashed
                };
                if self.state == WorkerState::Crashed {
                    warn!(exit_code = ?output.status.code(), stderr = %output.stderr_lossy(), "worker crashed");
                }
                self.output = Some(output);
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to wait for worker");
                self.state = WorkerState::Crashed;
                self.fault = Some(Fault::runtime(format!("{err:#}")));
            }
        }
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), HarnessError> {
        match self.state {
            WorkerState::CleanedUp => return Ok(()),
            WorkerState::Created => {
                self.state = WorkerState::CleanedUp;
                return Ok(());
            }
            WorkerState::TimedOut => {
                // The channel is unreliable after a kill; never read it.
                self.fault = Some(Fault::timeout(self.timeout.as_secs()));
            }
            _ => {
                if let Some(resources) = self.current.as_mut() {
                    match resources.channel.drain::<WorkerReport>() {
                        Ok(report) => self.report = Some(report),
                        Err(err) => {
                            debug!(err = %err, "no report drained");
                            if self.fault.is_none() {
                                self.fault = Some(Fault::missing_output(err));
                            }
                        }
                    }
                }
            }
        }

        let failure = self.failure_reason();
        if let Some(resources) = self.current.take() {
            match failure {
                Some(reason) => self.ledger.retain(reason, resources),
                None => {
                    if let Err(err) = resources.release() {
                        warn!(err = %format!("{err:#}"), "failed to release worker resources");
                    }
                    self.ledger.reclaim_all();
                }
            }
        }
        self.state = WorkerState::CleanedUp;
        Ok(())
    }

    fn populate_results(&mut self, env: &mut ExecutionEnvironment) -> Result<(), HarnessError> {
        let mut results = Results {
            timed_out: self.fault.as_ref().is_some_and(|f| f.kind == FaultKind::Timeout),
            exit_code: self.output.as_ref().and_then(|o| o.status.code()),
            file_out: sandbox_changes(env, &[]),
            exception: self.fault.clone(),
            ..Results::default()
        };
        if let Some(report) = self.report.take() {
            results.stdout = Some(env.filter_stdout(report.stdout)?);
            results.return_value = report.return_value;
            results.parameters = Some(report.parameters);
            results.mocks = Some(report.mocks);
            if results.exception.is_none() {
                results.exception = report.exception;
            }
        }
        env.set_results(results);
        Ok(())
    }

    fn retained_runs(&self) -> usize {
        self.ledger.retained()
    }
}

impl Drop for IsolatedWorker {
    fn drop(&mut self) {
        self.release();
    }
}

//! Runs a compiled executable directly inside the sandbox.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, anyhow};
use tracing::{debug, instrument, warn};

use super::{ExecutionStrategy, sandbox_changes};
use crate::environment::{ExecutionEnvironment, Results};
use crate::error::{Fault, HarnessError};
use crate::process::{CommandOutput, run_command_with_timeout};
use crate::unit::{ExecutableUnit, Invocation};

#[derive(Debug)]
struct PreparedRun {
    /// Copy of the binary inside the sandbox.
    binary: PathBuf,
    /// Sandbox-relative name of the copy.
    artifact: PathBuf,
    sandbox: PathBuf,
    stdin: Vec<u8>,
    timeout: Duration,
}

/// Strategy for [`ExecutableUnit::Binary`] units. The binary's stdout is the
/// whole observation: there is no return value and nothing to intercept.
#[derive(Debug)]
pub struct SubprocessStrategy {
    output_limit: usize,
    prepared: Option<PreparedRun>,
    outcome: Option<anyhow::Result<CommandOutput>>,
}

impl SubprocessStrategy {
    pub fn new(output_limit: usize) -> Self {
        Self {
            output_limit,
            prepared: None,
            outcome: None,
        }
    }

    fn results_from(&self, env: &ExecutionEnvironment, output: &CommandOutput) -> Result<Results, HarnessError> {
        let mut results = Results {
            exit_code: output.status.code(),
            mocks: Some(Default::default()),
            ..Results::default()
        };
        if output.timed_out {
            results.timed_out = true;
            results.exception = Some(Fault::timeout(env.timeout_secs()));
            return Ok(results);
        }
        if output.stdout_truncated > 0 {
            results.exception = Some(Fault::missing_output(format!(
                "Output exceeded {} bytes by {} bytes.",
                self.output_limit, output.stdout_truncated
            )));
            return Ok(results);
        }

        let lines = output.stdout_lossy().lines().map(str::to_string).collect();
        results.stdout = Some(env.filter_stdout(lines)?);
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            results.exception = Some(Fault::raised(format!(
                "Submission exited with status {:?}.\n{}",
                output.status.code(),
                stderr.trim_end()
            )));
        }
        Ok(results)
    }
}

impl ExecutionStrategy for SubprocessStrategy {
    #[instrument(skip_all, fields(sandbox = %env.sandbox().display()))]
    fn setup(
        &mut self,
        env: &ExecutionEnvironment,
        invocation: &Invocation,
    ) -> Result<(), HarnessError> {
        self.prepared = None;
        self.outcome = None;
        let ExecutableUnit::Binary { path } = &invocation.unit else {
            return Err(HarnessError::InvalidInvocation(
                "the subprocess strategy only runs binaries".to_string(),
            ));
        };
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("binary path {} has no file name", path.display()))?;
        let binary = env.sandbox().join(file_name);
        fs::copy(path, &binary).map_err(|err| HarnessError::FileStaging {
            source_path: path.clone(),
            destination: binary.clone(),
            reason: err.to_string(),
        })?;
        debug!(binary = %binary.display(), "binary staged");

        self.prepared = Some(PreparedRun {
            binary,
            artifact: PathBuf::from(file_name),
            sandbox: env.sandbox().to_path_buf(),
            stdin: env.stdin().join("\n").into_bytes(),
            timeout: env.timeout(),
        });
        Ok(())
    }

    fn run(&mut self) -> Result<(), HarnessError> {
        let prepared = self
            .prepared
            .as_ref()
            .ok_or_else(|| anyhow!("subprocess strategy was not set up"))?;
        let mut cmd = Command::new(&prepared.binary);
        cmd.current_dir(&prepared.sandbox);
        let outcome = run_command_with_timeout(
            cmd,
            Some(prepared.stdin.clone()),
            prepared.timeout,
            self.output_limit,
        )
        .with_context(|| format!("run {}", prepared.binary.display()));
        if let Err(err) = &outcome {
            warn!(err = %format!("{err:#}"), "binary did not run");
        }
        self.outcome = Some(outcome);
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), HarnessError> {
        Ok(())
    }

    fn populate_results(&mut self, env: &mut ExecutionEnvironment) -> Result<(), HarnessError> {
        let mut results = match &self.outcome {
            Some(Ok(output)) => self.results_from(env, output)?,
            Some(Err(err)) => Results {
                exception: Some(Fault::runtime(format!("{err:#}"))),
                ..Results::default()
            },
            None => Results {
                exception: Some(Fault::runtime("binary was never run")),
                ..Results::default()
            },
        };
        let artifacts: Vec<PathBuf> = self
            .prepared
            .iter()
            .map(|prepared| prepared.artifact.clone())
            .collect();
        results.file_out = sandbox_changes(env, &artifacts);
        env.set_results(results);
        Ok(())
    }
}

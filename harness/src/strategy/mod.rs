//! Pluggable execution strategies.
//!
//! The [`ExecutionStrategy`] trait decouples sandbox orchestration from how a
//! unit is actually run. [`DefaultStrategies`] maps each [`UnitKind`] to its
//! strategy; tests use scripted strategies that never spawn processes.

mod isolated;
mod subprocess;

pub use isolated::{IsolatedWorker, LeakLedger, WorkerState};
pub use subprocess::SubprocessStrategy;

use std::path::PathBuf;

use tracing::warn;

use crate::config::HarnessConfig;
use crate::environment::{ExecutionEnvironment, detect_file_system_changes};
use crate::error::HarnessError;
use crate::unit::{Invocation, UnitKind};

/// One way of running a unit. Driven by [`crate::executor::Executor`] in this order:
/// `setup` → `run` → `cleanup` → `populate_results` → `process_and_raise_exceptions`.
pub trait ExecutionStrategy {
    /// Prepare the run. The sandbox exists and declared files are staged.
    fn setup(
        &mut self,
        env: &ExecutionEnvironment,
        invocation: &Invocation,
    ) -> Result<(), HarnessError>;

    /// Run the unit to completion or until the environment's timeout.
    fn run(&mut self) -> Result<(), HarnessError>;

    /// Collect what the run left behind and settle per-run resources.
    fn cleanup(&mut self) -> Result<(), HarnessError>;

    /// Store the observations of the last run in `env`.
    fn populate_results(&mut self, env: &mut ExecutionEnvironment) -> Result<(), HarnessError>;

    /// Surface a captured fault as an error.
    fn process_and_raise_exceptions(&self, env: &ExecutionEnvironment) -> Result<(), HarnessError> {
        match env.results().and_then(|results| results.exception()) {
            Some(fault) => Err(HarnessError::from_fault(fault)),
            None => Ok(()),
        }
    }

    /// Failed runs whose resources are still held.
    fn retained_runs(&self) -> usize {
        0
    }
}

/// Creates the strategy for a kind of unit.
pub trait StrategyFactory {
    fn create(&mut self, kind: UnitKind) -> Result<Box<dyn ExecutionStrategy>, HarnessError>;
}

/// Isolated worker for registered programs, direct subprocess for binaries.
#[derive(Debug, Clone)]
pub struct DefaultStrategies {
    config: HarnessConfig,
}

impl DefaultStrategies {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }
}

impl StrategyFactory for DefaultStrategies {
    fn create(&mut self, kind: UnitKind) -> Result<Box<dyn ExecutionStrategy>, HarnessError> {
        match kind {
            UnitKind::Program => Ok(Box::new(IsolatedWorker::from_config(&self.config))),
            UnitKind::Binary => Ok(Box::new(SubprocessStrategy::new(
                self.config.channel_capacity_bytes,
            ))),
        }
    }
}

/// New sandbox files, or `None` (logged) when the sandbox cannot be walked.
fn sandbox_changes(
    env: &ExecutionEnvironment,
    artifacts: &[PathBuf],
) -> Option<std::collections::BTreeMap<String, PathBuf>> {
    match detect_file_system_changes(env.sandbox(), env.files(), artifacts) {
        Ok(changes) => Some(changes),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "failed to detect sandbox changes");
            None
        }
    }
}

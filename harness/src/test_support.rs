//! Test-only helpers for driving a worker host end to end.

use std::path::Path;

use crate::config::{HarnessConfig, WorkerConfig};
use crate::environment::ExecutionEnvironmentBuilder;
use crate::executor::Executor;
use crate::unit::{ExecutableUnit, InvocationBuilder};

/// Config running `worker_bin` with a sandbox under `root`.
pub fn worker_config(worker_bin: &Path, root: &Path) -> HarnessConfig {
    HarnessConfig {
        sandbox_dir: root.join("sandbox"),
        worker: WorkerConfig {
            command: vec![worker_bin.display().to_string()],
        },
        ..HarnessConfig::default()
    }
}

/// Executor with the default strategies for `cfg`.
pub fn executor(cfg: &HarnessConfig) -> Executor {
    Executor::from_config(cfg)
}

/// Environment builder seeded from `cfg`.
pub fn environment(cfg: &HarnessConfig) -> ExecutionEnvironmentBuilder {
    ExecutionEnvironmentBuilder::from_config(cfg)
}

/// Invocation of the registered program `name`.
pub fn program(name: &str) -> InvocationBuilder {
    InvocationBuilder::new(ExecutableUnit::Program {
        name: name.to_string(),
    })
}

//! Sandbox lifecycle and strategy orchestration.
//!
//! [`Executor`] owns one strategy per [`UnitKind`], created on first use by its
//! [`StrategyFactory`] and reused for later runs so that per-strategy state
//! (notably the isolated worker's leak ledger) survives across runs.

use std::collections::HashMap;
use std::fs;

use tracing::{debug, info, instrument, warn};

use crate::config::HarnessConfig;
use crate::environment::ExecutionEnvironment;
use crate::error::HarnessError;
use crate::strategy::{DefaultStrategies, ExecutionStrategy, StrategyFactory};
use crate::unit::{Invocation, UnitKind};

pub struct Executor<F = DefaultStrategies> {
    factory: F,
    strategies: HashMap<UnitKind, Box<dyn ExecutionStrategy>>,
    active: Option<UnitKind>,
}

impl Executor<DefaultStrategies> {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(DefaultStrategies::new(config.clone()))
    }
}

impl<F: StrategyFactory> Executor<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            strategies: HashMap::new(),
            active: None,
        }
    }

    /// Recreate the sandbox, stage declared files and prepare the strategy.
    #[instrument(skip_all, fields(sandbox = %env.sandbox().display(), kind = ?invocation.kind()))]
    pub fn setup(
        &mut self,
        env: &mut ExecutionEnvironment,
        invocation: &Invocation,
    ) -> Result<(), HarnessError> {
        env.clear_results();
        self.active = None;
        recreate_sandbox(env)?;

        let kind = invocation.kind();
        if !self.strategies.contains_key(&kind) {
            let strategy = self.factory.create(kind)?;
            self.strategies.insert(kind, strategy);
        }

        stage_files(env)?;

        let strategy = self.strategy_mut(kind)?;
        strategy.setup(env, invocation)?;
        self.active = Some(kind);
        debug!("executor setup complete");
        Ok(())
    }

    /// Set up, run and tear down one invocation.
    ///
    /// With `raise_exceptions` a captured fault is returned as an error after
    /// the results are stored; without it the caller inspects the results.
    #[instrument(skip_all, fields(raise_exceptions))]
    pub fn execute(
        &mut self,
        env: &mut ExecutionEnvironment,
        invocation: &Invocation,
        raise_exceptions: bool,
    ) -> Result<(), HarnessError> {
        self.setup(env, invocation)?;
        let ran = self.run();
        let post = self.post_run(env, raise_exceptions);
        ran?;
        post?;
        info!(
            faulted = env.results().and_then(|r| r.exception()).is_some(),
            "execution finished"
        );
        Ok(())
    }

    /// Run the strategy prepared by the last `setup`.
    pub fn run(&mut self) -> Result<(), HarnessError> {
        self.active_strategy()?.run()
    }

    pub fn post_run(
        &mut self,
        env: &mut ExecutionEnvironment,
        raise_exceptions: bool,
    ) -> Result<(), HarnessError> {
        let strategy = self.active_strategy()?;
        strategy.cleanup()?;
        strategy.populate_results(env)?;
        if raise_exceptions {
            strategy.process_and_raise_exceptions(env)?;
        }
        Ok(())
    }

    /// Remove the sandbox tree. Safe to call repeatedly.
    pub fn cleanup(&self, env: &ExecutionEnvironment) -> Result<(), HarnessError> {
        let sandbox = env.sandbox();
        if !sandbox.exists() {
            return Ok(());
        }
        fs::remove_dir_all(sandbox).map_err(|err| HarnessError::Cleanup {
            path: sandbox.to_path_buf(),
            reason: err.to_string(),
        })?;
        debug!(sandbox = %sandbox.display(), "sandbox removed");
        Ok(())
    }

    /// Failed runs still held by the strategy for `kind`.
    pub fn retained_runs(&self, kind: UnitKind) -> usize {
        self.strategies
            .get(&kind)
            .map_or(0, |strategy| strategy.retained_runs())
    }

    fn active_strategy(&mut self) -> Result<&mut Box<dyn ExecutionStrategy>, HarnessError> {
        let kind = self.active.ok_or_else(|| {
            HarnessError::Other(anyhow::anyhow!("no strategy prepared, call setup first"))
        })?;
        self.strategy_mut(kind)
    }

    fn strategy_mut(&mut self, kind: UnitKind) -> Result<&mut Box<dyn ExecutionStrategy>, HarnessError> {
        self.strategies.get_mut(&kind).ok_or_else(|| {
            HarnessError::Other(anyhow::anyhow!("no strategy prepared for {kind:?} units"))
        })
    }
}

fn recreate_sandbox(env: &ExecutionEnvironment) -> Result<(), HarnessError> {
    let sandbox = env.sandbox();
    if sandbox.exists() {
        fs::remove_dir_all(sandbox).map_err(|err| HarnessError::Setup {
            path: sandbox.to_path_buf(),
            reason: err.to_string(),
        })?;
    }
    fs::create_dir_all(sandbox).map_err(|err| HarnessError::Setup {
        path: sandbox.to_path_buf(),
        reason: err.to_string(),
    })
}

fn stage_files(env: &ExecutionEnvironment) -> Result<(), HarnessError> {
    for file in env.files() {
        let destination = env.sandbox().join(&file.destination);
        let staged = match destination.parent() {
            Some(parent) => fs::create_dir_all(parent),
            None => Ok(()),
        }
        .and_then(|()| fs::copy(&file.source, &destination));
        if let Err(err) = staged {
            warn!(source = %file.source.display(), err = %err, "failed to stage file");
            return Err(HarnessError::FileStaging {
                source_path: file.source.clone(),
                destination,
                reason: err.to_string(),
            });
        }
    }
    Ok(())
}

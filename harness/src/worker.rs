//! Worker side of the isolated strategy.
//!
//! A worker host is a small binary that registers the programs it can run and
//! hands control to [`serve`]:
//!
//! ```no_run
//! use harness::unit::{Program, UnitRegistry};
//!
//! fn main() -> std::process::ExitCode {
//!     let mut registry = UnitRegistry::new();
//!     registry
//!         .register("hello", Program::new().main(|ctx, _| {
//!             ctx.print("hello");
//!             Ok(serde_json::Value::Null)
//!         }))
//!         .expect("register");
//!     harness::worker::serve(&registry)
//! }
//! ```
//!
//! The supervisor starts the host with `--request <path> --channel <path>`. The
//! worker runs exactly one unit, then writes exactly one [`WorkerReport`] to the
//! channel. Failures of the unit are data in the report; only a failure to talk
//! to the supervisor makes the host exit non-zero.

use std::any::Any;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use crate::channel::ResultChannel;
use crate::error::{Fault, FaultKind, HarnessError};
use crate::mock::{CallRecorder, MockSpec, MockTable};
use crate::unit::{
    Entrypoint, ExecutableUnit, Invocation, MAIN, Parameter, UnitContext, UnitRegistry,
    function_ref,
};

/// Command line every worker host accepts.
#[derive(Debug, Parser)]
#[command(about = "Runs one registered program and reports back to the harness")]
pub struct WorkerArgs {
    /// JSON file describing the run.
    #[arg(long)]
    pub request: PathBuf,
    /// Result channel allocated by the supervisor.
    #[arg(long)]
    pub channel: PathBuf,
}

/// What the supervisor asks the worker to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub program: String,
    pub entrypoint: Entrypoint,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub mocks: Vec<MockSpec>,
    #[serde(default)]
    pub setup_methods: Vec<String>,
}

impl WorkerRequest {
    pub fn from_invocation(invocation: &Invocation) -> Result<Self, HarnessError> {
        let ExecutableUnit::Program { name } = &invocation.unit else {
            return Err(HarnessError::InvalidInvocation(
                "only registered programs can run in a worker".to_string(),
            ));
        };
        Ok(Self {
            program: name.clone(),
            entrypoint: invocation.entrypoint.clone(),
            parameters: invocation.parameters.clone(),
            mocks: invocation.mocks.clone(),
            setup_methods: invocation.setup_methods.clone(),
        })
    }
}

/// Everything the worker observed, written once at teardown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub stdout: Vec<String>,
    pub return_value: Option<Value>,
    /// Parameter values after the call.
    pub parameters: Vec<Value>,
    pub exception: Option<Fault>,
    pub mocks: BTreeMap<String, CallRecorder>,
}

/// Entry point for worker host binaries.
pub fn serve(registry: &UnitRegistry) -> ExitCode {
    crate::logging::init();
    let args = WorkerArgs::parse();
    let stdin = BufReader::new(io::stdin());
    match run_worker(&args, registry, Box::new(stdin)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(err = %format!("{err:#}"), "worker failed to report");
            ExitCode::FAILURE
        }
    }
}

/// Read the request, run the unit, commit the report.
#[instrument(skip_all, fields(request = %args.request.display()))]
pub fn run_worker(
    args: &WorkerArgs,
    registry: &UnitRegistry,
    input: Box<dyn BufRead + Send>,
) -> Result<()> {
    let contents = fs::read_to_string(&args.request)
        .with_context(|| format!("read request {}", args.request.display()))?;
    let request: WorkerRequest = serde_json::from_str(&contents)
        .with_context(|| format!("parse request {}", args.request.display()))?;
    let mut channel = ResultChannel::open(&args.channel).context("open result channel")?;

    let report = execute(&request, registry, input);
    channel.write(&report).context("write report")?;
    info!(program = %request.program, faulted = report.exception.is_some(), "report committed");
    Ok(())
}

/// Run one unit in-process and collect what it did. Never panics on behalf of the unit.
pub fn execute(
    request: &WorkerRequest,
    registry: &UnitRegistry,
    input: Box<dyn BufRead + Send>,
) -> WorkerReport {
    let Some(program) = registry.get(&request.program) else {
        return WorkerReport {
            exception: Some(Fault::runtime(format!(
                "program '{}' is not registered with this worker",
                request.program
            ))),
            ..WorkerReport::default()
        };
    };

    let mocks = MockTable::bind(&request.mocks, program);
    let mut ctx = UnitContext::new(program.clone(), mocks, input);
    let mut parameters = Vec::new();
    let mut return_value = None;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        invoke(&mut ctx, request, &mut parameters)
    }));
    let exception = match outcome {
        Ok(Ok(value)) => {
            return_value = value;
            None
        }
        Ok(Err(fault)) => Some(fault),
        Err(payload) => Some(Fault::new(FaultKind::Panic, panic_message(payload.as_ref()))),
    };
    if let Some(fault) = &exception {
        debug!(kind = %fault.kind, "unit failed");
    }

    let (stdout, mocks) = ctx.into_parts();
    WorkerReport {
        stdout,
        return_value,
        parameters,
        exception,
        mocks: mocks.into_records(),
    }
}

fn invoke(
    ctx: &mut UnitContext,
    request: &WorkerRequest,
    parameters: &mut Vec<Value>,
) -> Result<Option<Value>, Fault> {
    for method in &request.setup_methods {
        if !ctx.has_function(method) {
            return Err(Fault::missing_function(method));
        }
        ctx.call(method, &mut [])?;
    }

    for parameter in &request.parameters {
        let value = match parameter {
            Parameter::Value(value) => value.clone(),
            Parameter::Autowired(name) if ctx.has_function(name) => function_ref(name),
            Parameter::Autowired(name) => {
                return Err(Fault::runtime(format!("Failed to map '{name}'")));
            }
        };
        parameters.push(value);
    }

    match &request.entrypoint {
        Entrypoint::Main => {
            ctx.call(MAIN, parameters)?;
            Ok(None)
        }
        Entrypoint::Function(name) => ctx.call(name, parameters).map(Some),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unit panicked".to_string()
    }
}

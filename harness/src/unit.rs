//! Executable units and the context they run in.
//!
//! The supervisor only ever handles an [`ExecutableUnit`] as an opaque value and
//! dispatches on its [`UnitKind`]. The types below the fold ([`Program`],
//! [`UnitRegistry`], [`UnitContext`]) live on the worker side: a worker host
//! binary registers the programs it can run and the worker executes one of them
//! per run.

use std::collections::BTreeMap;
use std::fmt;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::error::{Fault, HarnessError};
use crate::mock::{Interception, MockSpec, MockTable};

/// Key of the implicit entry point of a program.
pub const MAIN: &str = "main";

const FUNCTION_REF_KEY: &str = "$function";

/// The opaque thing under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutableUnit {
    /// A program registered in the worker host's [`UnitRegistry`].
    Program { name: String },
    /// A compiled executable run directly.
    Binary { path: PathBuf },
}

/// Execution strategies are selected by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Program,
    Binary,
}

impl ExecutableUnit {
    pub fn kind(&self) -> UnitKind {
        match self {
            ExecutableUnit::Program { .. } => UnitKind::Program,
            ExecutableUnit::Binary { .. } => UnitKind::Binary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entrypoint {
    /// Run the program's `main`.
    Main,
    /// Call a named function with the invocation's parameters.
    Function(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    Value(Value),
    /// Reference to one of the unit's own functions, resolved inside the worker.
    Autowired(String),
}

/// Everything a strategy needs to know about how to run a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub unit: ExecutableUnit,
    pub entrypoint: Entrypoint,
    pub parameters: Vec<Parameter>,
    pub mocks: Vec<MockSpec>,
    /// Functions invoked, in order, before the entry point.
    pub setup_methods: Vec<String>,
}

impl Invocation {
    pub fn kind(&self) -> UnitKind {
        self.unit.kind()
    }
}

pub struct InvocationBuilder {
    invocation: Invocation,
}

impl InvocationBuilder {
    pub fn new(unit: ExecutableUnit) -> Self {
        Self {
            invocation: Invocation {
                unit,
                entrypoint: Entrypoint::Main,
                parameters: Vec::new(),
                mocks: Vec::new(),
                setup_methods: Vec::new(),
            },
        }
    }

    pub fn function(mut self, name: impl Into<String>) -> Self {
        self.invocation.entrypoint = Entrypoint::Function(name.into());
        self
    }

    pub fn main(mut self) -> Self {
        self.invocation.entrypoint = Entrypoint::Main;
        self
    }

    pub fn parameter(mut self, value: Value) -> Self {
        self.invocation.parameters.push(Parameter::Value(value));
        self
    }

    pub fn autowired(mut self, name: impl Into<String>) -> Self {
        self.invocation
            .parameters
            .push(Parameter::Autowired(name.into()));
        self
    }

    /// Add a mock. A later mock with the same name replaces the earlier one.
    pub fn mock(mut self, spec: MockSpec) -> Self {
        self.invocation.mocks.retain(|mock| mock.name != spec.name);
        self.invocation.mocks.push(spec);
        self
    }

    pub fn setup_method(mut self, name: impl Into<String>) -> Self {
        self.invocation.setup_methods.push(name.into());
        self
    }

    pub fn build(self) -> Result<Invocation, HarnessError> {
        let invocation = self.invocation;
        if invocation.kind() == UnitKind::Binary {
            let unsupported = invocation.entrypoint != Entrypoint::Main
                || !invocation.parameters.is_empty()
                || !invocation.mocks.is_empty()
                || !invocation.setup_methods.is_empty();
            if unsupported {
                return Err(HarnessError::InvalidInvocation(
                    "binary units only support the main entry point without parameters, mocks or setup methods"
                        .to_string(),
                ));
            }
        }
        if let Entrypoint::Function(name) = &invocation.entrypoint
            && name.trim().is_empty()
        {
            return Err(HarnessError::InvalidInvocation(
                "function entry point must be named".to_string(),
            ));
        }
        Ok(invocation)
    }
}

/// A function of a program as seen by the worker.
pub type Callable = Arc<dyn Fn(&mut UnitContext, &mut [Value]) -> Result<Value, Fault> + Send + Sync>;

/// A named set of functions. `main` is the implicit entry point.
#[derive(Clone, Default)]
pub struct Program {
    functions: BTreeMap<String, Callable>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&mut UnitContext, &mut [Value]) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn main<F>(self, function: F) -> Self
    where
        F: Fn(&mut UnitContext, &mut [Value]) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        self.function(MAIN, function)
    }

    pub fn lookup(&self, name: &str) -> Option<Callable> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("program `{0}` already registered")]
    Duplicate(String),
}

/// Programs a worker host can run, by name.
#[derive(Debug, Clone, Default)]
pub struct UnitRegistry {
    programs: BTreeMap<String, Program>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, program: Program) -> Result<(), RegistryError> {
        let name = name.into();
        if self.programs.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.programs.insert(name, program);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Program> {
        self.programs.get(name)
    }
}

/// Value a unit receives for an autowired parameter.
pub fn function_ref(name: &str) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(FUNCTION_REF_KEY.to_string(), Value::String(name.to_string()));
    Value::Object(map)
}

/// Everything a running unit can touch: its input, its output, and calls to
/// named functions routed through the mock table.
pub struct UnitContext {
    program: Program,
    mocks: MockTable,
    input: Box<dyn BufRead + Send>,
    stdout: Vec<String>,
}

impl UnitContext {
    pub fn new(program: Program, mocks: MockTable, input: Box<dyn BufRead + Send>) -> Self {
        Self {
            program,
            mocks,
            input,
            stdout: Vec::new(),
        }
    }

    /// Read the next input line without its terminator.
    pub fn input(&mut self) -> Result<String, Fault> {
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .map_err(|e| Fault::runtime(format!("failed to read input: {e}")))?;
        if read == 0 {
            return Err(Fault::end_of_input());
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    /// Write one line of output. Embedded line breaks produce several lines.
    pub fn print(&mut self, line: impl AsRef<str>) {
        let line = line.as_ref();
        if line.is_empty() {
            self.stdout.push(String::new());
            return;
        }
        self.stdout.extend(line.lines().map(str::to_string));
    }

    pub fn stdout(&self) -> &[String] {
        &self.stdout
    }

    /// Call a named function, consulting the mock table first.
    pub fn call(&mut self, name: &str, args: &mut [Value]) -> Result<Value, Fault> {
        let callable = match self.mocks.get_mut(name) {
            Some(mock) => match mock.intercept(args) {
                Interception::Canned(value) => return Ok(value),
                Interception::PassThrough(original) => original,
            },
            None => self.program.lookup(name),
        };
        trace!(function = name, "calling unit function");
        let callable = callable.ok_or_else(|| Fault::missing_function(name))?;
        callable(self, args)
    }

    /// Call a function received as an autowired parameter.
    pub fn call_ref(&mut self, reference: &Value, args: &mut [Value]) -> Result<Value, Fault> {
        let name = reference
            .get(FUNCTION_REF_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| Fault::runtime(format!("{reference} is not a function reference")))?
            .to_string();
        self.call(&name, args)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.program.contains(name) || self.mocks.get(name).is_some()
    }

    pub fn into_parts(self) -> (Vec<String>, MockTable) {
        (self.stdout, self.mocks)
    }
}

//! Call interception: recording mocks and pass-through spies.
//!
//! The unit never calls a dependency directly. Calls go through the
//! [`crate::unit::UnitContext`], which first consults a [`MockTable`]: an
//! explicit name → [`CallRecorder`] indirection table built before execution.
//! A recorder only records and answers; routing is the context's job.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::HarnessError;
use crate::unit::{Callable, Program};

/// Mock requested by the supervisor for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockSpec {
    /// Symbol the unit resolves at call time.
    pub name: String,
    /// Pass through to the real function after recording.
    #[serde(default)]
    pub spy: bool,
    /// Canned return value for non-spy mocks. `None` answers `null`.
    #[serde(default)]
    pub returns: Option<Value>,
}

impl MockSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spy: false,
            returns: None,
        }
    }

    pub fn spy(name: impl Into<String>) -> Self {
        Self {
            spy: true,
            ..Self::new(name)
        }
    }

    pub fn returning(mut self, value: Value) -> Self {
        self.returns = Some(value);
        self
    }
}

/// What the caller should do after a call was recorded.
pub enum Interception {
    /// Spy mode: invoke the bound original. `None` when nothing was bound.
    PassThrough(Option<Callable>),
    /// Mock mode: answer with this value.
    Canned(Value),
}

/// Records calls routed to a substituted symbol.
///
/// Only the name, spy flag, canned value and call history cross the process
/// boundary; the bound original stays inside the worker.
#[derive(Clone, Serialize, Deserialize)]
pub struct CallRecorder {
    name: String,
    #[serde(default)]
    calls: Vec<Vec<Value>>,
    #[serde(default)]
    spy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    returns: Option<Value>,
    #[serde(skip)]
    original: Option<Callable>,
}

impl CallRecorder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Vec::new(),
            spy: false,
            returns: None,
            original: None,
        }
    }

    pub fn from_spec(spec: &MockSpec) -> Self {
        Self {
            spy: spec.spy,
            returns: spec.returns.clone(),
            ..Self::new(spec.name.clone())
        }
    }

    /// Bind the real implementation a spy passes through to.
    pub fn bind_original(&mut self, original: Callable) {
        self.original = Some(original);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_spy(&self) -> bool {
        self.spy
    }

    pub fn calls(&self) -> &[Vec<Value>] {
        &self.calls
    }

    /// Append one call to the history. Independent of mode.
    pub fn record_call(&mut self, args: &[Value]) {
        self.calls.push(args.to_vec());
    }

    /// Record the call and tell the caller how to answer it.
    pub fn intercept(&mut self, args: &[Value]) -> Interception {
        self.record_call(args);
        debug!(mock = %self.name, calls = self.calls.len(), spy = self.spy, "call intercepted");
        if self.spy {
            Interception::PassThrough(self.original.clone())
        } else {
            Interception::Canned(self.returns.clone().unwrap_or(Value::Null))
        }
    }

    pub fn assert_called_with(&self, args: &[Value]) -> Result<(), HarnessError> {
        if self.calls.iter().any(|call| call.as_slice() == args) {
            return Ok(());
        }
        Err(HarnessError::AssertionFailed(format!(
            "expected '{}' to be called with {}; actual calls: {}",
            self.name,
            render_args(args),
            self.render_calls()
        )))
    }

    pub fn assert_called_times(&self, times: usize) -> Result<(), HarnessError> {
        if self.calls.len() == times {
            return Ok(());
        }
        Err(HarnessError::AssertionFailed(format!(
            "expected '{}' to be called {} times; called {} times",
            self.name,
            times,
            self.calls.len()
        )))
    }

    fn render_calls(&self) -> String {
        if self.calls.is_empty() {
            return "none".to_string();
        }
        self.calls
            .iter()
            .map(|call| render_args(call))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn render_args(args: &[Value]) -> String {
    let parts: Vec<String> = args.iter().map(Value::to_string).collect();
    format!("({})", parts.join(", "))
}

impl fmt::Debug for CallRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRecorder")
            .field("name", &self.name)
            .field("calls", &self.calls)
            .field("spy", &self.spy)
            .field("returns", &self.returns)
            .field("original", &self.original.is_some())
            .finish()
    }
}

impl PartialEq for CallRecorder {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.calls == other.calls
            && self.spy == other.spy
            && self.returns == other.returns
    }
}

/// Name → recorder indirection table consulted before the unit's own symbols.
#[derive(Debug, Clone, Default)]
pub struct MockTable {
    recorders: BTreeMap<String, CallRecorder>,
}

impl MockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build recorders for `specs`, binding spies to the program's originals.
    pub fn bind(specs: &[MockSpec], program: &Program) -> Self {
        let mut table = Self::new();
        for spec in specs {
            let mut recorder = CallRecorder::from_spec(spec);
            if spec.spy {
                match program.lookup(&spec.name) {
                    Some(original) => recorder.bind_original(original),
                    None => debug!(mock = %spec.name, "spy has no original to bind"),
                }
            }
            table.insert(recorder);
        }
        table
    }

    pub fn insert(&mut self, recorder: CallRecorder) {
        self.recorders.insert(recorder.name().to_string(), recorder);
    }

    pub fn get(&self, name: &str) -> Option<&CallRecorder> {
        self.recorders.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut CallRecorder> {
        self.recorders.get_mut(name)
    }

    pub fn is_empty(&self) -> bool {
        self.recorders.is_empty()
    }

    /// Snapshot of every recorder, ready to be serialized once at teardown.
    pub fn into_records(self) -> BTreeMap<String, CallRecorder> {
        self.recorders
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_every_call() {
        let mut recorder = CallRecorder::new("mock_me");
        recorder.record_call(&[json!(1), json!(2), json!(3)]);
        recorder.record_call(&[json!(1), json!(2), json!(3)]);

        recorder
            .assert_called_with(&[json!(1), json!(2), json!(3)])
            .expect("called with");
        recorder.assert_called_times(2).expect("called twice");
    }

    #[test]
    fn called_with_requires_exact_match() {
        let mut recorder = CallRecorder::new("mock_me");
        recorder.record_call(&[json!(1), json!(2)]);

        let err = recorder
            .assert_called_with(&[json!(1), json!(2), json!(3)])
            .unwrap_err();
        assert!(err.to_string().contains("mock_me"));
        assert!(err.to_string().contains("(1, 2)"));
    }

    #[test]
    fn called_times_reports_actual_count() {
        let recorder = CallRecorder::new("never");
        let err = recorder.assert_called_times(1).unwrap_err();
        assert!(err.to_string().contains("called 0 times"));
    }

    #[test]
    fn mock_answers_canned_value() {
        let mut recorder = CallRecorder::from_spec(&MockSpec::new("randint").returning(json!(1)));
        match recorder.intercept(&[json!(10), json!(15)]) {
            Interception::Canned(value) => assert_eq!(value, json!(1)),
            Interception::PassThrough(_) => panic!("mock must not pass through"),
        }
        recorder.assert_called_times(1).expect("recorded");
    }

    #[test]
    fn mock_without_canned_value_answers_null() {
        let mut recorder = CallRecorder::from_spec(&MockSpec::new("quiet"));
        assert!(matches!(
            recorder.intercept(&[]),
            Interception::Canned(Value::Null)
        ));
    }

    #[test]
    fn serialized_record_omits_original() {
        let mut recorder = CallRecorder::from_spec(&MockSpec::spy("add"));
        recorder.record_call(&[json!(1)]);
        let json = serde_json::to_value(&recorder).expect("serialize");
        assert_eq!(
            json,
            json!({"name": "add", "calls": [[1]], "spy": true})
        );
        let back: CallRecorder = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, recorder);
    }
}

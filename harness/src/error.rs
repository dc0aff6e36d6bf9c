//! Error taxonomy shared by the supervisor and the worker host.
//!
//! Two layers exist on purpose:
//!
//! - [`Fault`] is *data*: a failure observed inside (or about) the unit. It is
//!   serialized across the process boundary and stored in
//!   [`crate::environment::Results`]; it never unwinds anything by itself.
//! - [`HarnessError`] is what the supervisor returns to its caller when an
//!   operation fails, including the explicit "raise the captured fault" step.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Hint appended when a unit asked for more input than was provided.
pub const END_OF_INPUT_HINT: &str = "Do you have the correct number of input statements?";

/// Classification of a captured unit failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The unit returned an error of its own.
    Raised,
    /// The unit read past the last prepared stdin line.
    EndOfInput,
    /// A requested entry point, setup method or spied original is absent.
    MissingFunctionDefinition,
    /// The unit panicked; the panic was caught inside the worker.
    Panic,
    /// The supervisor killed the worker after its deadline.
    Timeout,
    /// The result channel holds no usable report (overflow or no write).
    MissingOutputData,
    /// The harness could not start or drive the unit.
    Runtime,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::Raised => "Raised",
            FaultKind::EndOfInput => "EndOfInput",
            FaultKind::MissingFunctionDefinition => "MissingFunctionDefinition",
            FaultKind::Panic => "Panic",
            FaultKind::Timeout => "Timeout",
            FaultKind::MissingOutputData => "MissingOutputData",
            FaultKind::Runtime => "Runtime",
        };
        f.write_str(name)
    }
}

/// A failure captured while running a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A failure the unit reports itself.
    pub fn raised(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Raised, message)
    }

    pub fn end_of_input() -> Self {
        Self::new(FaultKind::EndOfInput, "EOF when reading a line")
    }

    pub fn missing_function(name: &str) -> Self {
        Self::new(
            FaultKind::MissingFunctionDefinition,
            format!(
                "Failed to find function with name: {name}.\nAre you missing the function definition?"
            ),
        )
    }

    pub fn timeout(seconds: u64) -> Self {
        Self::new(
            FaultKind::Timeout,
            format!("Submission timed out after {seconds} seconds"),
        )
    }

    /// The channel was never committed or could not hold the report.
    pub fn missing_output(detail: impl fmt::Display) -> Self {
        Self::new(
            FaultKind::MissingOutputData,
            format!(
                "Output results are NULL.\n{detail}\nSubmission possibly crashed or terminated before the harness could write its results."
            ),
        )
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Runtime, message)
    }
}

/// Supervisor-side failures.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Sandbox creation failed. Fatal and not retried.
    #[error("failed to create sandbox {path}: {reason}")]
    Setup { path: PathBuf, reason: String },
    /// Removing the sandbox after a run failed.
    #[error("failed to remove sandbox {path}: {reason}")]
    Cleanup { path: PathBuf, reason: String },
    /// Copying a declared input file into the sandbox failed.
    #[error("failed to move file '{source_path}' to '{destination}': {reason}")]
    FileStaging {
        source_path: PathBuf,
        destination: PathBuf,
        reason: String,
    },
    /// The environment description is unusable (missing file, zero timeout, ...).
    #[error("invalid execution environment: {0}")]
    InvalidEnvironment(String),
    /// The invocation cannot be run by the unit's strategy.
    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),
    /// A captured fault, surfaced by the explicit raise step. Timeouts,
    /// missing output data and missing functions arrive here by `kind`.
    #[error("{message}")]
    UnitFailed { kind: FaultKind, message: String },
    /// A result field was requested but the run did not produce it.
    #[error("{0}")]
    MissingResult(String),
    /// A call-record assertion did not hold.
    #[error("{0}")]
    AssertionFailed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HarnessError {
    /// Turn a captured fault into the error the assertion layer observes.
    pub fn from_fault(fault: &Fault) -> Self {
        let mut message = format!(
            "Submission execution failed due to a {} fault.\n{}",
            fault.kind, fault.message
        );
        if fault.kind == FaultKind::EndOfInput {
            message.push('\n');
            message.push_str(END_OF_INPUT_HINT);
        }
        HarnessError::UnitFailed {
            kind: fault.kind,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_of_input_is_annotated() {
        let err = HarnessError::from_fault(&Fault::end_of_input());
        let msg = err.to_string();
        assert!(msg.contains("EndOfInput"));
        assert!(msg.contains(END_OF_INPUT_HINT));
    }

    #[test]
    fn other_faults_are_not_annotated() {
        let err = HarnessError::from_fault(&Fault::raised("boom"));
        let msg = err.to_string();
        assert!(msg.contains("boom"));
        assert!(!msg.contains(END_OF_INPUT_HINT));
    }

    #[test]
    fn missing_function_message_names_function_once() {
        let fault = Fault::missing_function("run_me");
        assert!(fault.message.contains("run_me"));
        assert_eq!(
            fault
                .message
                .matches("missing the function definition")
                .count(),
            1
        );
    }

    #[test]
    fn fault_serializes_kind_in_snake_case() {
        let json = serde_json::to_string(&Fault::timeout(5)).expect("serialize");
        assert!(json.contains("\"timeout\""));
        assert!(json.contains("timed out after 5 seconds"));
    }
}

//! Process-isolated execution harness for grading untrusted submissions.
//!
//! A submission is turned into an opaque [`unit::ExecutableUnit`] by an external
//! producer, then run inside a sandbox directory by a pluggable
//! [`strategy::ExecutionStrategy`]. The architecture keeps three concerns apart:
//!
//! - **[`tasks`]**: a synchronous, dependency-linked task scheduler that sequences
//!   supervisor-side setup/build/validate work ([`submission`]).
//! - **[`strategy`]**: execution strategies. The isolated worker runs the unit in
//!   a separate process and marshals its observations back through a bounded
//!   [`channel::ResultChannel`]; the subprocess strategy runs compiled binaries.
//! - **[`mock`]**: call interception used to observe how the unit talks to
//!   injected dependencies.
//!
//! [`executor`] owns the sandbox lifecycle and drives a strategy end to end; the
//! grading layer reads the outcome through the fail-fast accessors on
//! [`environment::Results`].

pub mod channel;
pub mod config;
pub mod environment;
pub mod error;
pub mod executor;
pub mod logging;
pub mod mock;
pub mod process;
pub mod strategy;
pub mod submission;
pub mod tasks;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod unit;
pub mod worker;

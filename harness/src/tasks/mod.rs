//! Dependency-linked scheduling of supervisor-side work.
//!
//! Tasks are registered with a name, an operation and a list of suppliers.
//! [`TaskRunner::run`] walks them in registration order; each supplier is a
//! lookup (usually "the result of task X") resolved right before the task's
//! operation. Failures are recorded per task and aggregated, never propagated.

mod runner;
mod task;

pub use runner::TaskRunner;
pub use task::{Operation, Supplier, Task, TaskError, TaskStatus, constant, task_result};

//! A single named unit of supervisor-side work.

use std::fmt;

use tracing::{debug, warn};

use super::runner::TaskRunner;

/// Lifecycle of a task. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    NotStarted,
    Running,
    Complete,
    Error,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::NotStarted => "not started",
            TaskStatus::Running => "running",
            TaskStatus::Complete => "complete",
            TaskStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Failures recorded by the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task `{0}` already exists")]
    AlreadyExists(String),
    #[error("task `{requested}` cannot be the overall result; `{existing}` already is")]
    OverallResultAlreadySet { existing: String, requested: String },
    #[error("task `{0}` does not exist")]
    NotFound(String),
    #[error("task `{name}` has not completed (status: {status})")]
    NotComplete { name: String, status: TaskStatus },
    /// A supplier failed; the operation was never invoked.
    #[error("task `{task}` failed to resolve dependencies: {cause:#}")]
    FailedToLoadSuppliers { task: String, cause: anyhow::Error },
    /// The operation itself failed.
    #[error("task `{task}` failed: {cause:#}")]
    Operation { task: String, cause: anyhow::Error },
}

/// Lookup evaluated against the runner right before the operation runs.
pub type Supplier<'a, T> = Box<dyn Fn(&TaskRunner<'a, T>) -> anyhow::Result<T> + 'a>;

/// Work performed with the resolved supplier values, in supplier order.
pub type Operation<'a, T> = Box<dyn FnMut(Vec<T>) -> anyhow::Result<T> + 'a>;

/// Supplier reading the result of another task by name.
pub fn task_result<'a, T: Clone + 'a>(name: impl Into<String>) -> Supplier<'a, T> {
    let name = name.into();
    Box::new(move |runner: &TaskRunner<'a, T>| Ok(runner.get_result(&name)?))
}

/// Supplier yielding a fixed value.
pub fn constant<'a, T: Clone + 'a>(value: T) -> Supplier<'a, T> {
    Box::new(move |_: &TaskRunner<'a, T>| Ok(value.clone()))
}

pub struct Task<'a, T> {
    name: String,
    operation: Operation<'a, T>,
    pub(super) suppliers: Vec<Supplier<'a, T>>,
    status: TaskStatus,
    result: Option<T>,
    error: Option<TaskError>,
}

impl<'a, T> Task<'a, T> {
    pub fn new<F>(name: impl Into<String>, operation: F, suppliers: Vec<Supplier<'a, T>>) -> Self
    where
        F: FnMut(Vec<T>) -> anyhow::Result<T> + 'a,
    {
        Self {
            name: name.into(),
            operation: Box::new(operation),
            suppliers,
            status: TaskStatus::NotStarted,
            result: None,
            error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn result(&self) -> Option<&T> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    pub(super) fn mark_running(&mut self) {
        if self.status == TaskStatus::NotStarted {
            self.status = TaskStatus::Running;
        }
    }

    /// Finish the task given the outcome of supplier resolution.
    ///
    /// Only a task that has not finished yet can run; a finished task keeps its
    /// status, result and error.
    pub fn do_task(&mut self, resolved: anyhow::Result<Vec<T>>) {
        if matches!(self.status, TaskStatus::Complete | TaskStatus::Error) {
            return;
        }
        self.status = TaskStatus::Running;

        let args = match resolved {
            Ok(args) => args,
            Err(cause) => {
                warn!(task = %self.name, err = %cause, "failed to resolve task dependencies");
                self.status = TaskStatus::Error;
                self.error = Some(TaskError::FailedToLoadSuppliers {
                    task: self.name.clone(),
                    cause,
                });
                return;
            }
        };

        match (self.operation)(args) {
            Ok(value) => {
                debug!(task = %self.name, "task complete");
                self.result = Some(value);
                self.status = TaskStatus::Complete;
            }
            Err(cause) => {
                warn!(task = %self.name, err = %cause, "task operation failed");
                self.status = TaskStatus::Error;
                self.error = Some(TaskError::Operation {
                    task: self.name.clone(),
                    cause,
                });
            }
        }
    }
}

impl<T> fmt::Debug for Task<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("suppliers", &self.suppliers.len())
            .field("status", &self.status)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

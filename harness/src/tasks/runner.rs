//! Registration-ordered scheduler over named tasks.

use tracing::{debug, info, instrument};

use super::task::{Task, TaskError, TaskStatus};

/// Runs tasks strictly in registration order on the calling thread.
///
/// There is no precomputed execution order and no cycle detection: a supplier
/// that reads a task which has not completed (including the task itself) fails
/// that task with [`TaskError::FailedToLoadSuppliers`].
pub struct TaskRunner<'a, T> {
    tasks: Vec<Task<'a, T>>,
    overall_result: Option<String>,
}

impl<T> Default for TaskRunner<'_, T> {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            overall_result: None,
        }
    }
}

impl<'a, T: Clone> TaskRunner<'a, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. Names are unique and at most one task is the overall result.
    pub fn add(&mut self, task: Task<'a, T>, is_overall_result_task: bool) -> Result<(), TaskError> {
        if self.position(task.name()).is_some() {
            return Err(TaskError::AlreadyExists(task.name().to_string()));
        }
        if is_overall_result_task {
            if let Some(existing) = &self.overall_result {
                return Err(TaskError::OverallResultAlreadySet {
                    existing: existing.clone(),
                    requested: task.name().to_string(),
                });
            }
            self.overall_result = Some(task.name().to_string());
        }
        debug!(task = task.name(), is_overall_result_task, "task registered");
        self.tasks.push(task);
        Ok(())
    }

    /// Run every task that has not started yet and return the overall result.
    #[instrument(skip_all, fields(tasks = self.tasks.len()))]
    pub fn run(&mut self) -> Option<T> {
        for index in 0..self.tasks.len() {
            if self.tasks[index].status() != TaskStatus::NotStarted {
                continue;
            }
            self.tasks[index].mark_running();
            let resolved = self.resolve(index);
            self.tasks[index].do_task(resolved);
        }

        let errors = self.get_all_errors().len();
        info!(errors, successful = errors == 0, "task run finished");

        let name = self.overall_result.as_deref()?;
        self.get_result(name).ok()
    }

    fn resolve(&self, index: usize) -> anyhow::Result<Vec<T>> {
        self.tasks[index]
            .suppliers
            .iter()
            .map(|supplier| supplier(self))
            .collect()
    }

    /// Result of a completed task.
    pub fn get_result(&self, name: &str) -> Result<T, TaskError> {
        let task = self
            .task(name)
            .ok_or_else(|| TaskError::NotFound(name.to_string()))?;
        match (task.status(), task.result()) {
            (TaskStatus::Complete, Some(result)) => Ok(result.clone()),
            (status, _) => Err(TaskError::NotComplete {
                name: name.to_string(),
                status,
            }),
        }
    }

    pub fn get_all_errors(&self) -> Vec<&TaskError> {
        self.tasks.iter().filter_map(Task::error).collect()
    }

    pub fn was_successful(&self) -> bool {
        self.tasks
            .iter()
            .all(|task| task.status() == TaskStatus::Complete)
    }

    pub fn task(&self, name: &str) -> Option<&Task<'a, T>> {
        self.position(name).map(|index| &self.tasks[index])
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.tasks.iter().position(|task| task.name() == name)
    }
}

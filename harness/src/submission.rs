//! Turning a submission directory into an executable unit.
//!
//! Discovery, building and static validation are done by an external
//! [`UnitProducer`]; this module sequences the three steps on a
//! [`TaskRunner`] and folds every failure into one validation description.

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use tracing::{info, warn};

use crate::error::HarnessError;
use crate::tasks::{Task, TaskRunner, constant, task_result};
use crate::unit::ExecutableUnit;

const DISCOVER: &str = "discover";
const BUILD: &str = "build";
const VALIDATE: &str = "validate";

/// Produces an executable unit from submitted sources.
pub trait UnitProducer {
    /// Locate the submission's entry inside `root`.
    fn discover(&self, root: &Path) -> anyhow::Result<PathBuf>;
    /// Turn the discovered entry into something a strategy can run.
    fn build(&self, entry: &Path) -> anyhow::Result<ExecutableUnit>;
    /// Reject units that must not be run.
    fn validate(&self, unit: &ExecutableUnit) -> anyhow::Result<()>;
}

/// Values flowing between the pipeline tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionArtifact {
    Root(PathBuf),
    Entry(PathBuf),
    Unit(ExecutableUnit),
}

impl SubmissionArtifact {
    fn into_path(self) -> anyhow::Result<PathBuf> {
        match self {
            SubmissionArtifact::Root(path) | SubmissionArtifact::Entry(path) => Ok(path),
            SubmissionArtifact::Unit(_) => Err(anyhow!("expected a path, got a unit")),
        }
    }

    fn into_unit(self) -> anyhow::Result<ExecutableUnit> {
        match self {
            SubmissionArtifact::Unit(unit) => Ok(unit),
            other => Err(anyhow!("expected a unit, got {other:?}")),
        }
    }
}

/// Outcome of loading a submission. Never fails; problems are described instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    /// Built unit, present even if validation rejected it.
    pub unit: Option<ExecutableUnit>,
    pub validation_error: Option<String>,
}

impl Submission {
    pub fn is_valid(&self) -> bool {
        self.unit.is_some() && self.validation_error.is_none()
    }

    /// The unit, if it may be run.
    pub fn executable(&self) -> Result<&ExecutableUnit, HarnessError> {
        match (&self.unit, &self.validation_error) {
            (Some(unit), None) => Ok(unit),
            (_, Some(error)) => Err(HarnessError::InvalidInvocation(format!(
                "submission is not valid: {error}"
            ))),
            (None, None) => Err(HarnessError::InvalidInvocation(
                "submission produced no unit".to_string(),
            )),
        }
    }
}

fn single(mut args: Vec<SubmissionArtifact>) -> anyhow::Result<SubmissionArtifact> {
    match (args.pop(), args.is_empty()) {
        (Some(arg), true) => Ok(arg),
        _ => Err(anyhow!("expected exactly one input")),
    }
}

/// Run discover → build → validate for the submission at `root`.
pub fn load_submission(root: &Path, producer: &dyn UnitProducer) -> Submission {
    let mut runner: TaskRunner<'_, SubmissionArtifact> = TaskRunner::new();
    let tasks = [
        (
            Task::new(
                DISCOVER,
                |args| {
                    let root = single(args)?.into_path()?;
                    producer.discover(&root).map(SubmissionArtifact::Entry)
                },
                vec![constant(SubmissionArtifact::Root(root.to_path_buf()))],
            ),
            false,
        ),
        (
            Task::new(
                BUILD,
                |args| {
                    let entry = single(args)?.into_path()?;
                    producer.build(&entry).map(SubmissionArtifact::Unit)
                },
                vec![task_result(DISCOVER)],
            ),
            false,
        ),
        (
            Task::new(
                VALIDATE,
                |args| {
                    let unit = single(args)?.into_unit()?;
                    producer.validate(&unit)?;
                    Ok(SubmissionArtifact::Unit(unit))
                },
                vec![task_result(BUILD)],
            ),
            true,
        ),
    ];
    for (task, is_overall) in tasks {
        if let Err(err) = runner.add(task, is_overall) {
            return Submission {
                unit: None,
                validation_error: Some(err.to_string()),
            };
        }
    }

    let validated = runner.run();
    let unit = match validated {
        Some(artifact) => artifact.into_unit().ok(),
        None => runner
            .get_result(BUILD)
            .ok()
            .and_then(|artifact| artifact.into_unit().ok()),
    };

    let errors: Vec<String> = runner
        .get_all_errors()
        .iter()
        .map(|err| err.to_string())
        .collect();
    let validation_error = if errors.is_empty() {
        None
    } else {
        warn!(errors = errors.len(), root = %root.display(), "submission failed to load");
        Some(errors.join("\n"))
    };
    info!(valid = validation_error.is_none(), "submission loaded");
    Submission {
        unit,
        validation_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Finds `main.bin` in the root and rejects units named `bad`.
    struct DirProducer;

    impl UnitProducer for DirProducer {
        fn discover(&self, root: &Path) -> anyhow::Result<PathBuf> {
            let entry = root.join("main.bin");
            if !entry.exists() {
                return Err(anyhow!("no main.bin in {}", root.display()));
            }
            Ok(entry)
        }

        fn build(&self, entry: &Path) -> anyhow::Result<ExecutableUnit> {
            Ok(ExecutableUnit::Binary {
                path: entry.to_path_buf(),
            })
        }

        fn validate(&self, unit: &ExecutableUnit) -> anyhow::Result<()> {
            match unit {
                ExecutableUnit::Binary { path } if path.ends_with("bad/main.bin") => {
                    Err(anyhow!("banned import"))
                }
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn valid_submission_yields_unit() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("main.bin"), "").expect("write");

        let submission = load_submission(temp.path(), &DirProducer);
        assert!(submission.is_valid());
        assert_eq!(
            submission.executable().expect("unit"),
            &ExecutableUnit::Binary {
                path: temp.path().join("main.bin")
            }
        );
    }

    #[test]
    fn discovery_failure_cascades_into_description() {
        let temp = tempfile::tempdir().expect("tempdir");

        let submission = load_submission(temp.path(), &DirProducer);
        assert!(!submission.is_valid());
        assert!(submission.unit.is_none());
        let error = submission.validation_error.expect("error");
        assert!(error.contains("no main.bin"));
        assert!(error.contains("`build`"));
        assert!(error.contains("`validate`"));
    }

    #[test]
    fn rejected_unit_is_kept_but_not_executable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("bad");
        fs::create_dir_all(&root).expect("mkdir");
        fs::write(root.join("main.bin"), "").expect("write");

        let submission = load_submission(&root, &DirProducer);
        assert!(submission.unit.is_some());
        assert!(
            submission
                .validation_error
                .as_deref()
                .is_some_and(|e| e.contains("banned import"))
        );
        assert!(submission.executable().is_err());
    }
}

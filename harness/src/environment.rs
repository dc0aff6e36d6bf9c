//! The per-scenario execution environment and the results a run leaves in it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use regex::RegexBuilder;
use serde_json::Value;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::HarnessConfig;
use crate::error::{Fault, HarnessError};
use crate::mock::CallRecorder;

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SANDBOX: &str = ".harness/sandbox";

/// An input file copied into the sandbox before the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub source: PathBuf,
    /// Relative to the sandbox root.
    pub destination: PathBuf,
}

/// What a run observed. Every field is best effort: a failed run still
/// populates what it could.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Results {
    pub stdout: Option<Vec<String>>,
    pub return_value: Option<Value>,
    /// Parameter values after the call, in call order.
    pub parameters: Option<Vec<Value>>,
    /// Files the run created, sandbox-relative name → absolute path.
    pub file_out: Option<BTreeMap<String, PathBuf>>,
    pub exception: Option<Fault>,
    pub mocks: Option<BTreeMap<String, CallRecorder>>,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
}

impl Results {
    pub fn stdout(&self) -> Result<&[String], HarnessError> {
        if self.timed_out {
            return Err(HarnessError::MissingResult(
                "No OUTPUT was created by the submission.\nThe submission timed out before finishing."
                    .to_string(),
            ));
        }
        match self.stdout.as_deref() {
            Some(lines) if !lines.is_empty() => Ok(lines),
            _ => Err(HarnessError::MissingResult(
                "No OUTPUT was created by the submission.\nAre you printing your results?"
                    .to_string(),
            )),
        }
    }

    pub fn return_value(&self) -> Result<&Value, HarnessError> {
        self.return_value.as_ref().ok_or_else(|| {
            HarnessError::MissingResult("No value was returned by the submission.".to_string())
        })
    }

    /// Value of parameter `index` after the call.
    pub fn parameter(&self, index: usize) -> Result<&Value, HarnessError> {
        self.parameters
            .as_ref()
            .and_then(|params| params.get(index))
            .ok_or_else(|| {
                HarnessError::MissingResult(format!(
                    "Parameter {index} was not returned by the submission."
                ))
            })
    }

    pub fn file_out_path(&self, name: &str) -> Result<&Path, HarnessError> {
        self.file_out
            .as_ref()
            .and_then(|files| files.get(name))
            .map(PathBuf::as_path)
            .ok_or_else(|| {
                HarnessError::MissingResult(format!(
                    "File '{name}' was not created by the submission."
                ))
            })
    }

    /// Contents of an output file, read on access.
    pub fn file_out(&self, name: &str) -> Result<String, HarnessError> {
        let path = self.file_out_path(name)?;
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read output file {}", path.display()))?;
        Ok(contents)
    }

    pub fn mock(&self, name: &str) -> Result<&CallRecorder, HarnessError> {
        let mocks = self.mocks.as_ref().ok_or_else(|| {
            HarnessError::MissingResult("No mocks were returned by the submission.".to_string())
        })?;
        mocks.get(name).ok_or_else(|| {
            HarnessError::MissingResult(format!(
                "Mock '{name}' was not returned by the submission."
            ))
        })
    }

    pub fn exception(&self) -> Option<&Fault> {
        self.exception.as_ref()
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}

/// One graded scenario: where to run, what to feed, how long to wait.
#[derive(Debug, Clone)]
pub struct ExecutionEnvironment {
    sandbox: PathBuf,
    stdin: Vec<String>,
    timeout_secs: u64,
    files: Vec<StagedFile>,
    stdout_marker: Option<String>,
    results: Option<Results>,
}

impl ExecutionEnvironment {
    pub fn builder() -> ExecutionEnvironmentBuilder {
        ExecutionEnvironmentBuilder::new()
    }

    pub fn sandbox(&self) -> &Path {
        &self.sandbox
    }

    pub fn stdin(&self) -> &[String] {
        &self.stdin
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn files(&self) -> &[StagedFile] {
        &self.files
    }

    pub fn stdout_marker(&self) -> Option<&str> {
        self.stdout_marker.as_deref()
    }

    pub fn results(&self) -> Option<&Results> {
        self.results.as_ref()
    }

    pub fn set_results(&mut self, results: Results) {
        self.results = Some(results);
    }

    pub fn clear_results(&mut self) {
        self.results = None;
    }

    /// Stdin as the byte stream a process reads: one line per prepared entry.
    pub fn stdin_bytes(&self) -> Vec<u8> {
        let mut buf = String::new();
        for line in &self.stdin {
            buf.push_str(line);
            buf.push('\n');
        }
        buf.into_bytes()
    }

    /// Keep only the text after the stdout marker, if one is configured.
    pub fn filter_stdout(&self, lines: Vec<String>) -> Result<Vec<String>, HarnessError> {
        match &self.stdout_marker {
            Some(marker) => filter_stdout(lines, marker),
            None => Ok(lines),
        }
    }
}

/// Results of the last run, or an error if the environment never ran.
pub fn get_results(env: &ExecutionEnvironment) -> Result<&Results, HarnessError> {
    env.results().ok_or_else(|| {
        HarnessError::MissingResult(
            "No results were populated: the environment has not been executed.".to_string(),
        )
    })
}

pub struct ExecutionEnvironmentBuilder {
    sandbox: PathBuf,
    data_root: PathBuf,
    stdin: Vec<String>,
    timeout_secs: u64,
    files: Vec<StagedFile>,
    stdout_marker: Option<String>,
    problems: Vec<String>,
}

impl Default for ExecutionEnvironmentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionEnvironmentBuilder {
    pub fn new() -> Self {
        Self {
            sandbox: PathBuf::from(DEFAULT_SANDBOX),
            data_root: PathBuf::from("."),
            stdin: Vec::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            files: Vec::new(),
            stdout_marker: None,
            problems: Vec::new(),
        }
    }

    /// Seed sandbox, timeout, marker and staged files from configuration.
    pub fn from_config(cfg: &HarnessConfig) -> Self {
        let mut builder = Self::new()
            .sandbox(&cfg.sandbox_dir)
            .timeout(cfg.timeout_secs);
        if let Some(marker) = &cfg.stdout_marker {
            builder = builder.stdout_marker(marker.clone());
        }
        for (source, destination) in &cfg.files {
            builder = builder.add_file(source, destination);
        }
        builder
    }

    pub fn sandbox(mut self, path: impl Into<PathBuf>) -> Self {
        self.sandbox = path.into();
        self
    }

    /// Split `text` into stdin lines.
    pub fn stdin_text(mut self, text: &str) -> Self {
        self.stdin = text.lines().map(str::to_string).collect();
        self
    }

    pub fn stdin_lines<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stdin = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Directory relative file sources are resolved against. Set it before adding files.
    pub fn data_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_root = path.into();
        self
    }

    /// Stage `source` at `destination` inside the sandbox. The first mapping of a source wins.
    pub fn add_file(mut self, source: impl AsRef<Path>, destination: impl AsRef<Path>) -> Self {
        let source = normalize(&self.data_root.join(source.as_ref()));
        if self.files.iter().any(|file| file.source == source) {
            debug!(source = %source.display(), "file already staged, ignoring");
            return self;
        }
        self.files.push(StagedFile {
            source,
            destination: normalize(destination.as_ref()),
        });
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        if seconds == 0 {
            self.problems.push("timeout must be > 0".to_string());
        } else {
            self.timeout_secs = seconds;
        }
        self
    }

    pub fn stdout_marker(mut self, marker: impl Into<String>) -> Self {
        self.stdout_marker = Some(marker.into());
        self
    }

    pub fn build(self) -> Result<ExecutionEnvironment, HarnessError> {
        if let Some(problem) = self.problems.into_iter().next() {
            return Err(HarnessError::InvalidEnvironment(problem));
        }
        for file in &self.files {
            if !file.source.exists() {
                return Err(HarnessError::InvalidEnvironment(format!(
                    "{} does not exist",
                    file.source.display()
                )));
            }
            if file.destination.is_absolute()
                || file
                    .destination
                    .components()
                    .any(|c| matches!(c, Component::ParentDir))
            {
                return Err(HarnessError::InvalidEnvironment(format!(
                    "destination {} escapes the sandbox",
                    file.destination.display()
                )));
            }
        }
        Ok(ExecutionEnvironment {
            sandbox: self.sandbox,
            stdin: self.stdin,
            timeout_secs: self.timeout_secs,
            files: self.files,
            stdout_marker: self.stdout_marker,
            results: None,
        })
    }
}

/// Lexically clean a path: drop `.` and fold `..` where possible.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                ) && out.pop();
                if !popped {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Keep the text after `marker` on every line that carries it.
pub fn filter_stdout(lines: Vec<String>, marker: &str) -> Result<Vec<String>, HarnessError> {
    let pattern = RegexBuilder::new(&regex::escape(marker))
        .case_insensitive(true)
        .build()
        .with_context(|| format!("compile stdout marker {marker:?}"))?;
    Ok(lines
        .iter()
        .filter_map(|line| pattern.find(line).map(|m| line[m.end()..].to_string()))
        .collect())
}

/// Files under `sandbox` the run created: everything except declared inputs and `ignored`.
pub fn detect_file_system_changes(
    sandbox: &Path,
    staged: &[StagedFile],
    ignored: &[PathBuf],
) -> anyhow::Result<BTreeMap<String, PathBuf>> {
    let mut changes = BTreeMap::new();
    if !sandbox.exists() {
        return Ok(changes);
    }
    for entry in WalkDir::new(sandbox).follow_links(false) {
        let entry = entry.with_context(|| format!("walk sandbox {}", sandbox.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(sandbox)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        if staged.iter().any(|file| file.destination == relative)
            || ignored.iter().any(|path| path == relative)
        {
            continue;
        }
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        changes.insert(name, entry.path().to_path_buf());
    }
    debug!(created = changes.len(), "sandbox changes detected");
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stdin_text_is_split_into_lines() {
        let env = ExecutionEnvironment::builder()
            .stdin_text("1\n2")
            .build()
            .expect("build");
        assert_eq!(env.stdin(), ["1", "2"]);
        assert_eq!(env.stdin_bytes(), b"1\n2\n");
    }

    #[test]
    fn same_source_is_staged_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("sub")).expect("mkdir");
        fs::write(temp.path().join("sub").join("file.txt"), "").expect("write");

        let env = ExecutionEnvironment::builder()
            .data_root(temp.path())
            .add_file("./sub/file.txt", "file.txt")
            .add_file("sub/file.txt", "file.txt")
            .build()
            .expect("build");

        assert_eq!(env.files().len(), 1);
        assert_eq!(env.files()[0].source, temp.path().join("sub").join("file.txt"));
    }

    #[test]
    fn missing_source_fails_build() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = ExecutionEnvironment::builder()
            .data_root(temp.path())
            .add_file("file.txt", "file.txt")
            .build()
            .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidEnvironment(_)));
        assert!(err.to_string().contains("file.txt does not exist"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = ExecutionEnvironment::builder().timeout(0).build().unwrap_err();
        assert!(err.to_string().contains("timeout must be > 0"));

        let env = ExecutionEnvironment::builder().timeout(10).build().expect("build");
        assert_eq!(env.timeout_secs(), 10);
    }

    #[test]
    fn get_results_requires_a_run() {
        let mut env = ExecutionEnvironment::builder().build().expect("build");
        assert!(get_results(&env).is_err());
        env.set_results(Results::default());
        assert!(get_results(&env).is_ok());
    }

    #[test]
    fn file_out_reads_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("outputFile.txt");
        fs::write(&path, "this is a line in the file").expect("write");

        let results = Results {
            file_out: Some(BTreeMap::from([("outputFile.txt".to_string(), path)])),
            ..Results::default()
        };
        assert_eq!(
            results.file_out("outputFile.txt").expect("file"),
            "this is a line in the file"
        );
        assert!(matches!(
            results.file_out("dne.txt").unwrap_err(),
            HarnessError::MissingResult(_)
        ));
    }

    #[test]
    fn empty_stdout_fails_fast() {
        let results = Results {
            stdout: Some(Vec::new()),
            ..Results::default()
        };
        let err = results.stdout().unwrap_err();
        assert!(err.to_string().contains("No OUTPUT was created by the submission."));
    }

    #[test]
    fn timed_out_run_has_no_stdout() {
        let results = Results {
            stdout: Some(vec!["partial".to_string()]),
            timed_out: true,
            ..Results::default()
        };
        assert!(results.stdout().is_err());
        assert!(results.timed_out());
    }

    #[test]
    fn accessors_report_missing_fields() {
        let results = Results {
            parameters: Some(vec![json!([1, 2])]),
            mocks: Some(BTreeMap::new()),
            ..Results::default()
        };
        assert_eq!(results.parameter(0).expect("param"), &json!([1, 2]));
        assert!(results.parameter(1).is_err());
        assert!(results.return_value().is_err());
        assert!(results.mock("randint").unwrap_err().to_string().contains("randint"));
        assert!(results.exception().is_none());
    }

    #[test]
    fn marker_filter_keeps_text_after_marker() {
        let lines = vec![
            "debug noise".to_string(),
            "output 42".to_string(),
            "OUTPUT done".to_string(),
        ];
        assert_eq!(
            filter_stdout(lines, "OUTPUT ").expect("filter"),
            vec!["42".to_string(), "done".to_string()]
        );
    }

    #[test]
    fn changes_exclude_staged_and_ignored_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = temp.path();
        fs::write(sandbox.join("input.txt"), "in").expect("write");
        fs::write(sandbox.join("unit.bin"), "bin").expect("write");
        fs::create_dir(sandbox.join("out")).expect("mkdir");
        fs::write(sandbox.join("out").join("result.txt"), "out").expect("write");

        let staged = vec![StagedFile {
            source: PathBuf::from("/data/input.txt"),
            destination: PathBuf::from("input.txt"),
        }];
        let changes =
            detect_file_system_changes(sandbox, &staged, &[PathBuf::from("unit.bin")]).expect("detect");
        assert_eq!(changes.keys().collect::<Vec<_>>(), vec!["out/result.txt"]);
    }

    #[test]
    fn normalize_folds_dots() {
        assert_eq!(normalize(Path::new("a/./b/../c")), PathBuf::from("a/c"));
        assert_eq!(normalize(Path::new("./x")), PathBuf::from("x"));
    }
}

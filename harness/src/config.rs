//! Harness configuration, usually stored as `harness.toml` next to the graded scenarios.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Harness configuration (TOML).
///
/// Missing fields default to values that suit a single graded scenario.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Wall-clock budget for one unit run, in seconds.
    pub timeout_secs: u64,

    /// Payload capacity of the result channel. Reports larger than this are a
    /// `MissingOutputData` fault, and binary unit stdout is bounded by it too.
    pub channel_capacity_bytes: usize,

    /// Failed runs whose resources are retained before the oldest is reclaimed.
    pub max_retained_runs: usize,

    /// Directory recreated for every run.
    pub sandbox_dir: PathBuf,

    /// Keep only stdout lines carrying this marker (case-insensitive).
    pub stdout_marker: Option<String>,

    /// Input files staged into the sandbox: source → sandbox-relative destination.
    pub files: BTreeMap<String, String>,

    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker host program and leading arguments (e.g. `["my-worker"]`).
    /// The harness appends `--request <path> --channel <path>`.
    pub command: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec!["harness-worker".to_string()],
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            channel_capacity_bytes: 1024 * 1024,
            max_retained_runs: 8,
            sandbox_dir: PathBuf::from(".harness/sandbox"),
            stdout_marker: None,
            files: BTreeMap::new(),
            worker: WorkerConfig::default(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(anyhow!("timeout_secs must be > 0"));
        }
        if self.channel_capacity_bytes == 0 {
            return Err(anyhow!("channel_capacity_bytes must be > 0"));
        }
        if self.sandbox_dir.as_os_str().is_empty() {
            return Err(anyhow!("sandbox_dir must not be empty"));
        }
        if self.worker.command.is_empty() || self.worker.command[0].trim().is_empty() {
            return Err(anyhow!("worker.command must be a non-empty array"));
        }
        if let Some(marker) = &self.stdout_marker
            && marker.is_empty()
        {
            return Err(anyhow!("stdout_marker must not be empty when set"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()`.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        let cfg = HarnessConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &HarnessConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, HarnessConfig::default());
    }

    #[test]
    fn write_then_load_keeps_files_and_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("harness.toml");
        let mut cfg = HarnessConfig {
            stdout_marker: Some("OUTPUT ".to_string()),
            ..HarnessConfig::default()
        };
        cfg.files
            .insert("data/in.txt".to_string(), "in.txt".to_string());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("harness.toml");
        fs::write(&path, "timeout_secs = 5\n[worker]\ncommand = [\"w\", \"--quiet\"]\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.timeout(), Duration::from_secs(5));
        assert_eq!(cfg.worker.command, vec!["w", "--quiet"]);
        assert_eq!(cfg.channel_capacity_bytes, HarnessConfig::default().channel_capacity_bytes);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("harness.toml");
        fs::write(&path, "timeout_secs = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("timeout_secs must be > 0"));
    }

    #[test]
    fn empty_worker_command_is_rejected() {
        let cfg = HarnessConfig {
            worker: WorkerConfig {
                command: Vec::new(),
            },
            ..HarnessConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}

//! Pipeline configuration stored as TOML (default `insight-pipeline.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::path::DEFAULT_PATH_MARKER;
use crate::core::safety::DEFAULT_DISALLOWED_PATTERNS;

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "insight-pipeline.toml";

/// Pipeline configuration (TOML).
///
/// Missing fields default to the values below, so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Attempts per request, including the first.
    pub max_iterations: u32,

    /// Wall-clock budget for one sandbox run.
    pub timeout_secs: u64,

    /// Case-insensitive substrings that block code before execution.
    pub disallowed_patterns: Vec<String>,

    /// Cap for each of stdout and stderr captured from the code.
    pub output_limit_bytes: usize,

    /// Marker token for in-code data path lines.
    pub path_marker: String,

    /// Name the data handle is bound to inside the sandbox.
    pub data_handle: String,

    /// Directory data paths must stay inside. Defaults to the working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_root: Option<PathBuf>,

    /// Reject code that never mentions the data handle.
    pub require_data_handle: bool,

    /// Treat a run that binds neither result as a structural defect.
    pub require_result: bool,

    pub backend: SandboxBackend,

    pub python: PythonConfig,

    pub regenerator: RegeneratorConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    #[default]
    Python,
    Embedded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PythonConfig {
    /// Interpreter invocation (e.g. `["python3"]`).
    pub command: Vec<String>,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegeneratorConfig {
    /// Command that turns retry feedback (stdin) into new code (stdout).
    /// Empty resubmits the same code.
    pub command: Vec<String>,

    pub timeout_secs: u64,
}

impl Default for RegeneratorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 120,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            timeout_secs: 30,
            disallowed_patterns: DEFAULT_DISALLOWED_PATTERNS
                .iter()
                .map(|pattern| pattern.to_string())
                .collect(),
            output_limit_bytes: 100_000,
            path_marker: DEFAULT_PATH_MARKER.to_string(),
            data_handle: "df".to_string(),
            data_root: None,
            require_data_handle: false,
            require_result: false,
            backend: SandboxBackend::default(),
            python: PythonConfig::default(),
            regenerator: RegeneratorConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be >= 1"));
        }
        if self.timeout_secs == 0 {
            return Err(anyhow!("timeout_secs must be >= 1"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.path_marker.trim().is_empty() {
            return Err(anyhow!("path_marker must be non-empty"));
        }
        if !is_identifier(&self.data_handle) {
            return Err(anyhow!(
                "data_handle must be a plain identifier, got `{}`",
                self.data_handle
            ));
        }
        if self.backend == SandboxBackend::Python
            && (self.python.command.is_empty() || self.python.command[0].trim().is_empty())
        {
            return Err(anyhow!("python.command must be a non-empty array"));
        }
        if !self.regenerator.command.is_empty() {
            if self.regenerator.command[0].trim().is_empty() {
                return Err(anyhow!("regenerator.command must start with a program"));
            }
            if self.regenerator.timeout_secs == 0 {
                return Err(anyhow!("regenerator.timeout_secs must be >= 1"));
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Configured data root, or the working directory.
    ///
    /// Always absolute: a relative root is taken against the working directory,
    /// since sandboxes run in their own scratch directory.
    pub fn resolved_data_root(&self) -> Result<PathBuf> {
        match &self.data_root {
            Some(root) if root.is_absolute() => Ok(root.clone()),
            Some(root) => Ok(std::env::current_dir()
                .context("resolve working directory for relative data root")?
                .join(root)),
            None => std::env::current_dir().context("resolve working directory as data root"),
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first == '_' || first.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

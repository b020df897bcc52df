use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};

/// Top-level Sluice configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub export: Option<ExportConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_name")]
    pub name: String,
    /// Base directory for relative resource, metadata, and log paths.
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Capacity of the event bus broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            workspace: default_workspace(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Resource monitor polling and retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Consecutive failed scans tolerated before escalating.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackendKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_name")]
    pub name: String,
    #[serde(default)]
    pub backend: MetadataBackendKind,
    /// SQLite file, relative to the workspace.
    #[serde(default = "default_metadata_path")]
    pub path: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            name: default_metadata_name(),
            backend: MetadataBackendKind::default(),
            path: default_metadata_path(),
        }
    }
}

/// JSONL event logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable event logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = transitions and failures, 2 = + runs and ledger advances, 3 = everything.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: None,
            level: default_log_level(),
        }
    }
}

/// A filesystem-backed resource node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    /// Directory, relative to the workspace unless absolute.
    pub path: String,
    /// Watch the directory for new artifacts.
    #[serde(default = "default_monitoring")]
    pub monitoring: bool,
    /// Minimum `new` artifacts before triggering; 0 means trigger every epoch.
    #[serde(default = "default_trigger_threshold")]
    pub trigger_threshold: usize,
    /// Cap on retained `old` entries.
    #[serde(default)]
    pub max_old: Option<usize>,
    /// Delete evicted artifacts from disk instead of only forgetting them.
    #[serde(default)]
    pub delete_evicted: bool,
    /// Regex on file names; unmatched files are ignored.
    #[serde(default)]
    pub include: Option<String>,
    #[serde(default)]
    pub predecessors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Directory for run exports, relative to the workspace.
    #[serde(default = "default_export_dir")]
    pub dir: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dir: default_export_dir(),
        }
    }
}

fn default_pipeline_name() -> String { "pipeline".to_string() }
fn default_workspace() -> String { "./sluice-workspace".to_string() }
fn default_event_capacity() -> usize { 1024 }
fn default_poll_interval() -> u64 { 500 }
fn default_max_retries() -> u32 { 5 }
fn default_initial_backoff() -> u64 { 200 }
fn default_max_backoff() -> u64 { 10_000 }
fn default_metadata_name() -> String { "metadata_store".to_string() }
fn default_metadata_path() -> String { "metadata/metadata.db".to_string() }
fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }
fn default_monitoring() -> bool { true }
fn default_trigger_threshold() -> usize { 1 }
fn default_export_dir() -> String { "exports".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SluiceError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| SluiceError::Config(e.to_string()))?;
        config.validate()?;
        tracing::debug!(
            path = %path.display(),
            resources = config.resources.len(),
            "Config loaded"
        );
        Ok(config)
    }

    /// Reject configs that cannot describe a valid pipeline.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        seen.insert(self.metadata.name.as_str());
        for res in &self.resources {
            if res.name.trim().is_empty() {
                return Err(SluiceError::Config("resource name must not be empty".into()));
            }
            if !seen.insert(res.name.as_str()) {
                return Err(SluiceError::Config(format!(
                    "duplicate resource name: {}",
                    res.name
                )));
            }
        }
        if let Some(ref log) = self.log {
            if !(1..=3).contains(&log.level) {
                return Err(SluiceError::Config(format!(
                    "log.level must be 1-3, got {}",
                    log.level
                )));
            }
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.pipeline.workspace;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    /// Resolve a path relative to the workspace (absolute paths pass through).
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace_dir().join(p)
        }
    }

    /// Directory for JSONL event logs, if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match log.log_dir {
            Some(ref dir) => self.resolve(dir),
            None => self.workspace_dir().join("logs"),
        })
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    tracing::warn!(var = %var_name, "Config references unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

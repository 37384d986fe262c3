use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::logging::LogLevel;

pub const CONFIG_FILE_NAMES: [&str; 3] = [
    "safepatch.config.yaml",
    "safepatch.config.yml",
    "safepatch.config.json",
];
pub const DEFAULT_STATE_DIR: &str = ".safepatch";

#[derive(Clone, Copy, Debug, Deserialize, Serialize, ValueEnum, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub project_id: String,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_poll_interval")]
    pub clipboard_poll_interval: u64,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    #[serde(default)]
    pub approval_on_error_count: usize,
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_command: Option<String>,
    #[serde(default)]
    pub linter: String,
    #[serde(default)]
    pub pre_command: String,
    #[serde(default)]
    pub post_command: String,
    #[serde(default)]
    pub min_file_changes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_changes: Option<usize>,
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<String>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_approval_timeout() -> u64 {
    30_000
}

fn default_protected_paths() -> Vec<String> {
    vec![".git/**".to_string()]
}

impl Config {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            log_level: LogLevel::default(),
            state_dir: default_state_dir(),
            clipboard_poll_interval: default_poll_interval(),
            approval_mode: ApprovalMode::default(),
            approval_on_error_count: 0,
            approval_timeout: default_approval_timeout(),
            approval_command: None,
            linter: String::new(),
            pre_command: String::new(),
            post_command: String::new(),
            min_file_changes: 0,
            max_file_changes: None,
            protected_paths: default_protected_paths(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.clipboard_poll_interval.max(1))
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout)
    }

    /// The configured state dir, resolved against the project root when relative.
    pub fn state_dir_in(&self, root: &Path) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            root.join(&self.state_dir)
        }
    }
}

pub fn find_config(root: &Path) -> Option<PathBuf> {
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
}

pub fn load_config(root: &Path) -> Result<Config> {
    let Some(path) = find_config(root) else {
        bail!(
            "no configuration found in {}; run `safepatch init` first",
            root.display()
        );
    };
    load_config_file(&path)
}

pub fn load_config_file(path: &Path) -> Result<Config> {
    let data = fs::read(path).with_context(|| format!("reading config {}", path.display()))?;
    let config: Config = if is_json(path) {
        serde_json::from_slice(&data)
            .with_context(|| format!("parsing config {}", path.display()))?
    } else {
        serde_yaml::from_slice(&data)
            .with_context(|| format!("parsing config {}", path.display()))?
    };
    if config.project_id.trim().is_empty() {
        bail!("config {} has an empty projectId", path.display());
    }
    Ok(config)
}

pub fn write_default_config(root: &Path) -> Result<PathBuf> {
    if let Some(existing) = find_config(root) {
        bail!("configuration already exists at {}", existing.display());
    }
    let project_id = root
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or("project")
        .to_string();
    let config = Config::new(project_id);
    let path = root.join(CONFIG_FILE_NAMES[0]);
    let yaml = serde_yaml::to_string(&config)?;
    fs::write(&path, yaml).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

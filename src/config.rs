//! Configuration for rnadeseq runs.
//!
//! Configuration sources (highest priority first):
//! 1. Command-line flags (applied by the CLI)
//! 2. Environment variables (RNADESEQ_OUTDIR, RNADESEQ_WORK_DIR, RNADESEQ_SCRIPTS_DIR)
//! 3. Config file (`--config <file>` or .rnadeseq/config.yaml)
//! 4. Defaults (./results, ./work, ./bin, ./docs)
//!
//! Config file discovery:
//! - Searches current directory and parents for .rnadeseq/config.yaml
//! - Paths in config file are relative to the project root (the parent of .rnadeseq/)

pub mod paths;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::limits::ResourceLimits;
use crate::core::pipeline::RetryPolicy;

/// Directory searched for in the current directory and its parents
pub const CONFIG_DIR: &str = ".rnadeseq";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Logical program name -> executable
    #[serde(default)]
    pub tools: BTreeMap<String, String>,
    #[serde(default)]
    pub notification: NotificationSettings,
    #[serde(default)]
    pub analysis: AnalysisSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Output root (relative to the project root)
    pub outdir: Option<String>,
    /// Stage working directories
    pub work_dir: Option<String>,
    /// R and Python helper scripts
    pub scripts_dir: Option<String>,
    /// Documentation sources (output.md)
    pub docs_dir: Option<String>,
}

/// Who gets told about a finished run, and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// Recipient notified on every completion
    #[serde(default)]
    pub email: Option<String>,

    /// Recipient notified only when the run failed
    #[serde(default)]
    pub email_on_fail: Option<String>,

    /// Skip the HTML tier and send plain text only
    #[serde(default)]
    pub plaintext_email: bool,

    /// Endpoint receiving the summary and the report archive
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_sendmail")]
    pub sendmail_program: String,

    #[serde(default = "default_mail")]
    pub mail_program: String,

    /// Wall-clock budget of each email tier
    #[serde(default = "default_email_timeout")]
    pub email_timeout_seconds: u64,
}

fn default_sendmail() -> String {
    "sendmail".to_string()
}
fn default_mail() -> String {
    "mail".to_string()
}
fn default_email_timeout() -> u64 {
    60
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            email: None,
            email_on_fail: None,
            plaintext_email: false,
            webhook_url: None,
            sendmail_program: default_sendmail(),
            mail_program: default_mail(),
            email_timeout_seconds: default_email_timeout(),
        }
    }
}

/// Thresholds handed to the analysis scripts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    /// Minimum absolute log2 fold change for a gene to count as DE
    #[serde(default)]
    pub logfc_threshold: f64,

    /// Minimum DE genes in a pathway for it to be reported
    #[serde(default = "default_min_deg_pathway")]
    pub min_deg_pathway: u32,
}

fn default_min_deg_pathway() -> u32 {
    1
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            logfc_threshold: 0.0,
            min_deg_pathway: default_min_deg_pathway(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
    /// Output root; artifacts are published below it
    pub outdir: PathBuf,
    /// Root of the per-stage working directories
    pub work_dir: PathBuf,
    pub scripts_dir: PathBuf,
    pub docs_dir: PathBuf,
    pub limits: ResourceLimits,
    pub retry: RetryPolicy,
    pub tools: BTreeMap<String, String>,
    pub notification: NotificationSettings,
    pub analysis: AnalysisSettings,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self::rooted_at(Path::new("."))
    }
}

impl ResolvedConfig {
    /// Defaults with every directory placed under `root`
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            outdir: root.join("results"),
            work_dir: root.join("work"),
            scripts_dir: root.join("bin"),
            docs_dir: root.join("docs"),
            limits: ResourceLimits::default(),
            retry: RetryPolicy::default(),
            tools: BTreeMap::new(),
            notification: NotificationSettings::default(),
            analysis: AnalysisSettings::default(),
            config_file: None,
        }
    }

    /// Build from a parsed config file located under `base_dir`
    pub fn from_file(config: ConfigFile, base_dir: &Path, config_file: Option<PathBuf>) -> Self {
        let defaults = Self::rooted_at(base_dir);
        let resolve = |value: &Option<String>, default: PathBuf| {
            value
                .as_deref()
                .map(|p| resolve_path(base_dir, p))
                .unwrap_or(default)
        };

        Self {
            outdir: resolve(&config.paths.outdir, defaults.outdir),
            work_dir: resolve(&config.paths.work_dir, defaults.work_dir),
            scripts_dir: resolve(&config.paths.scripts_dir, defaults.scripts_dir),
            docs_dir: resolve(&config.paths.docs_dir, defaults.docs_dir),
            limits: config.limits.unwrap_or_default(),
            retry: config.retry.unwrap_or_default(),
            tools: config.tools,
            notification: config.notification,
            analysis: config.analysis,
            config_file,
        }
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(outdir) = lookup("RNADESEQ_OUTDIR") {
            self.outdir = PathBuf::from(outdir);
        }
        if let Some(work_dir) = lookup("RNADESEQ_WORK_DIR") {
            self.work_dir = PathBuf::from(work_dir);
        }
        if let Some(scripts_dir) = lookup("RNADESEQ_SCRIPTS_DIR") {
            self.scripts_dir = PathBuf::from(scripts_dir);
        }
    }

    /// Path of a helper script
    pub fn script(&self, name: &str) -> PathBuf {
        self.scripts_dir.join(name)
    }
}

/// Find config file by searching `start` and its parents
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's project root
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    if let (Some(rest), Some(home)) = (path_str.strip_prefix("~/"), dirs::home_dir()) {
        return home.join(rest);
    }

    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Project root of a discovered config: the parent of `.rnadeseq/`
fn project_root(config_path: &Path) -> PathBuf {
    let parent = config_path.parent().unwrap_or(Path::new("."));
    if parent.file_name().map(|n| n == CONFIG_DIR).unwrap_or(false) {
        parent.parent().unwrap_or(Path::new(".")).to_path_buf()
    } else {
        parent.to_path_buf()
    }
}

/// Load configuration from all sources except command-line flags
pub fn load_config(explicit: Option<&Path>) -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;

    let config_file = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => find_config_file(&cwd),
    };

    let mut config = match config_file {
        Some(ref path) => {
            let parsed = load_config_file(path)?;
            ResolvedConfig::from_file(parsed, &project_root(path), Some(path.clone()))
        }
        None => ResolvedConfig::rooted_at(&cwd),
    };

    config.apply_env(|key| std::env::var(key).ok());

    Ok(config)
}

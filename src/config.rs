//! TOML configuration.
//!
//! ```toml
//! [store]
//! path = "./data/publish.sqlite"
//!
//! [publish]
//! root = "/mnt/projects"
//! host_error_trigger = "FPUB_FATAL"
//!
//! [contractors.deadline.farm]
//! url = "http://deadline:8081"
//! pool = "cpu"
//! priority = 50
//!
//! [contractors.local.inline]
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub publish: PublishConfig,
    #[serde(default)]
    pub contractors: ContractorsConfig,
    /// Path the config was loaded from. Forwarded to remote resume runs.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// How long a connection waits on a lock held by another process
    /// (a resume subprocess writes the same file).
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_busy_timeout_secs() -> u64 {
    30
}

fn default_max_connections() -> u32 {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct PublishConfig {
    /// Filesystem root holding the publish tree and `dumps/`.
    pub root: PathBuf,
    #[serde(default)]
    pub user: Option<String>,
    /// Magic string printed on failure for farm-side log watchers.
    #[serde(default)]
    pub host_error_trigger: Option<String>,
    /// Executable contractors invoke to resume; defaults to the running binary.
    #[serde(default)]
    pub resume_executable: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ContractorsConfig {
    #[serde(default)]
    pub deadline: HashMap<String, DeadlineContractorConfig>,
    #[serde(default)]
    pub local: HashMap<String, LocalContractorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeadlineContractorConfig {
    /// Deadline Web Service base URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Path to `deadlinecommand`.
    #[serde(default)]
    pub command: Option<PathBuf>,
    #[serde(default = "default_pool")]
    pub pool: String,
    #[serde(default)]
    pub secondary_pool: Option<String>,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_pool() -> String {
    "none".to_string()
}
fn default_group() -> String {
    "none".to_string()
}
fn default_priority() -> u32 {
    50
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LocalContractorConfig {
    /// Overrides `publish.resume_executable` for this contractor.
    #[serde(default)]
    pub executable: Option<PathBuf>,
}

impl Config {
    /// Config with an in-tree store and no contractors.
    pub fn minimal(root: &Path) -> Self {
        Self {
            store: StoreConfig {
                path: root.join("publish.sqlite"),
                busy_timeout_secs: default_busy_timeout_secs(),
                max_connections: default_max_connections(),
            },
            publish: PublishConfig {
                root: root.to_path_buf(),
                user: None,
                host_error_trigger: None,
                resume_executable: None,
            },
            contractors: ContractorsConfig::default(),
            source_path: None,
        }
    }

    /// Publishing user: config value, then `$USER`/`$USERNAME`.
    pub fn user(&self) -> String {
        self.publish
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn dumps_dir(&self) -> PathBuf {
        self.publish.root.join("dumps")
    }

    /// Executable that remote and local contractors run to resume.
    pub fn resume_executable(&self) -> Result<PathBuf> {
        match &self.publish.resume_executable {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().context("Failed to resolve current executable"),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.source_path = Some(
        std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()),
    );

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.publish.root.as_os_str().is_empty() {
        anyhow::bail!("publish.root must not be empty");
    }
    if config.store.max_connections == 0 {
        anyhow::bail!("store.max_connections must be at least 1");
    }

    for (name, cfg) in &config.contractors.deadline {
        match (&cfg.url, &cfg.command) {
            (Some(_), Some(_)) => anyhow::bail!(
                "contractors.deadline.{}: set either url or command, not both",
                name
            ),
            (None, None) => anyhow::bail!(
                "contractors.deadline.{}: one of url or command is required",
                name
            ),
            _ => {}
        }
        if cfg.priority > 100 {
            anyhow::bail!(
                "contractors.deadline.{}.priority must be in [0, 100]",
                name
            );
        }
    }

    for name in config.contractors.local.keys() {
        if config.contractors.deadline.contains_key(name) {
            anyhow::bail!(
                "Contractor name '{}' is configured more than once; names must be unique",
                name
            );
        }
    }

    Ok(())
}

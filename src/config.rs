use crate::error::LibrarianError;
use crate::platforms::PlatformId;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_VERSION: u32 = 1;
pub const CONFIG_FILE_NAME: &str = "config.yaml";
pub const MAX_WORKERS: usize = 8;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub workers: usize,
    pub default_platforms: Vec<PlatformId>,
    pub health: HealthSettings,
    pub fixer: FixerSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HealthSettings {
    pub level_timeout_sec: u64,
    pub healthy_below_ms: u64,
    pub degraded_up_to_ms: u64,
    pub recovery_wait_sec: u64,
    pub history_limit: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FixerSettings {
    pub lockfile_timeout_sec: u64,
    pub default_node_version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            workers: 4,
            default_platforms: Vec::new(),
            health: HealthSettings::default(),
            fixer: FixerSettings::default(),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            level_timeout_sec: 10,
            healthy_below_ms: 5_000,
            degraded_up_to_ms: 15_000,
            recovery_wait_sec: 5,
            history_limit: 168,
        }
    }
}

impl Default for FixerSettings {
    fn default() -> Self {
        Self {
            lockfile_timeout_sec: 120,
            default_node_version: "20".to_string(),
        }
    }
}

impl HealthSettings {
    pub fn level_timeout(&self) -> Duration {
        Duration::from_secs(self.level_timeout_sec)
    }

    pub fn recovery_wait(&self) -> Duration {
        Duration::from_secs(self.recovery_wait_sec)
    }
}

impl FixerSettings {
    pub fn lockfile_timeout(&self) -> Duration {
        Duration::from_secs(self.lockfile_timeout_sec)
    }
}

/// Resolves the config root: `--config-dir` (or `MCP_LIBRARIAN_HOME`, which
/// clap folds into it), then `~/.config/mcp-librarian`.
pub fn resolve_config_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("mcp-librarian");
    base
}

pub fn build_default_config_yaml() -> Result<String, LibrarianError> {
    Ok(serde_yaml::to_string(&Config::default())?)
}

pub fn read_config_from_str(content: &str) -> Result<Config, LibrarianError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != CONFIG_VERSION {
        return Err(LibrarianError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, LibrarianError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

/// Missing config file means defaults; a present but invalid one is an error.
pub fn load_config_or_default(path: &Path) -> Result<Config, LibrarianError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    read_config(path).map_err(|err| match err {
        LibrarianError::Config(_) => err,
        other => LibrarianError::Config(format!("{}: {other}", path.display())),
    })
}

pub fn validate_config(cfg: &Config) -> Result<(), LibrarianError> {
    if cfg.workers == 0 || cfg.workers > MAX_WORKERS {
        return Err(LibrarianError::Config(format!(
            "workers must be between 1 and {MAX_WORKERS}"
        )));
    }
    if cfg.health.level_timeout_sec == 0 {
        return Err(LibrarianError::Config(
            "health.level_timeout_sec must be greater than 0".to_string(),
        ));
    }
    if cfg.health.healthy_below_ms == 0 {
        return Err(LibrarianError::Config(
            "health.healthy_below_ms must be greater than 0".to_string(),
        ));
    }
    if cfg.health.healthy_below_ms > cfg.health.degraded_up_to_ms {
        return Err(LibrarianError::Config(
            "health.healthy_below_ms must not exceed health.degraded_up_to_ms".to_string(),
        ));
    }
    if cfg.health.history_limit == 0 {
        return Err(LibrarianError::Config(
            "health.history_limit must be greater than 0".to_string(),
        ));
    }
    if cfg.fixer.lockfile_timeout_sec == 0 {
        return Err(LibrarianError::Config(
            "fixer.lockfile_timeout_sec must be greater than 0".to_string(),
        ));
    }
    let node = cfg.fixer.default_node_version.trim();
    if node.is_empty() || !node.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(LibrarianError::Config(
            "fixer.default_node_version must be a numeric version such as \"20\"".to_string(),
        ));
    }
    Ok(())
}

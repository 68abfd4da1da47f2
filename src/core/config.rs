//! Project configuration loaded from `.membank/config.toml`.
//!
//! Every numeric budget the condenser, recorder and lock layer rely on lives
//! here. A missing file means defaults; a malformed file is a hard error.

use crate::core::error::MembankError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct MembankConfig {
    pub store: StoreConfig,
    pub condenser: CondenserConfig,
    pub decisions: DecisionConfig,
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a writer waits for a per-path lock before giving up.
    pub lock_timeout_ms: u64,
    /// Lock files older than this are assumed abandoned and broken.
    pub stale_lock_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            stale_lock_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BudgetUnit {
    Bytes,
    Tokens,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CondenserConfig {
    pub budget: usize,
    pub budget_unit: BudgetUnit,
    pub section_lines: usize,
    pub max_requirements: usize,
    pub summary_chars: usize,
}

impl Default for CondenserConfig {
    fn default() -> Self {
        Self {
            budget: 6_000,
            budget_unit: BudgetUnit::Bytes,
            section_lines: 12,
            max_requirements: 3,
            summary_chars: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecisionConfig {
    pub window_small: usize,
    pub window_medium: usize,
    pub window_large: usize,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            window_small: 3,
            window_medium: 8,
            window_large: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct LifecycleConfig {
    pub allow_completed_reopen: bool,
}

pub fn config_path(project_root: &Path) -> PathBuf {
    project_root.join(".membank").join(CONFIG_FILE)
}

/// Load config from `<project_root>/.membank/config.toml`.
pub fn load_config(project_root: &Path) -> Result<MembankConfig, MembankError> {
    let path = config_path(project_root);
    if !path.exists() {
        return Ok(MembankConfig::default());
    }
    let content = fs::read_to_string(&path).map_err(MembankError::IoError)?;
    parse_config(&content)
        .map_err(|e| MembankError::ConfigError(format!("{}: {}", path.display(), e)))
}

pub fn parse_config(content: &str) -> Result<MembankConfig, String> {
    let config: MembankConfig = toml::from_str(content).map_err(|e| e.to_string())?;
    if config.condenser.budget == 0 {
        return Err("condenser.budget must be greater than zero".to_string());
    }
    Ok(config)
}

pub fn render_default_config() -> Result<String, MembankError> {
    toml::to_string_pretty(&MembankConfig::default())
        .map_err(|e| MembankError::ConfigError(e.to_string()))
}

//! Configuration loading and parsing

use anyhow::{Context, Result};
use cansock::InterfaceConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main application configuration (loaded from a TOML file)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub interface: InterfaceSection,
    #[serde(default)]
    pub dump: DumpConfig,
}

/// `[interface]` table: the interface name plus library settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InterfaceSection {
    pub name: Option<String>,
    #[serde(flatten)]
    pub settings: InterfaceConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DumpConfig {
    /// Filters in `ID:MASK` form, used when none are given on the command line
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub json: bool,
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    Ok(config)
}

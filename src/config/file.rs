use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::logging::LoggingConfig;

/// Raw shape of the YAML config file, before defaults and parsing are
/// applied.
#[derive(Deserialize, Clone, Debug)]
pub struct ConfigFile {
    pub database: PathBuf,
    #[serde(default)]
    pub poll_interval: Option<u64>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub transfer_api: Option<TransferApiSection>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TransferApiSection {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub local_node: String,
}

pub fn read_config_file(path: &Path) -> anyhow::Result<ConfigFile> {
    let content = std::fs::read_to_string(path).context("Failed to read config file")?;
    let config = serde_yml::from_str(&content).context("Failed to parse config file")?;

    Ok(config)
}

pub mod file;
pub mod logging;
pub mod validation;

use anyhow::{bail, Context, Result};
use chrono_tz::{Tz, UTC};
use log::warn;
use std::path::{Path, PathBuf};
use std::time::Duration;

use self::file::{read_config_file, ConfigFile};
use self::logging::LoggingConfig;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: PathBuf,
    pub poll_interval: Duration,
    pub timezone: Tz,
    pub transfer_api: Option<TransferApiConfig>,
    pub logging: LoggingConfig,
}

/// Credentials and routing for the managed file transfer API.
#[derive(Debug, Clone)]
pub struct TransferApiConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub local_node: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let file = read_config_file(path)?;
    parse_config_file(&file)
}

pub fn parse_config_file(file: &ConfigFile) -> Result<Config> {
    if file.database.as_os_str().is_empty() {
        bail!("Config must point at a database file");
    }

    let poll_interval =
        Duration::from_secs(file.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL_SECS));

    let timezone: Tz = match &file.timezone {
        Some(name) => {
            name.parse().context(format!("Unable to parse timezone: '{}'", name))?
        }
        None => system_timezone(),
    };

    let transfer_api = file.transfer_api.as_ref().map(|t| TransferApiConfig {
        base_url: t.base_url.trim_end_matches('/').to_string(),
        username: t.username.clone(),
        password: t.password.clone(),
        local_node: t.local_node.clone(),
    });

    Ok(Config {
        database: file.database.clone(),
        poll_interval,
        timezone,
        transfer_api,
        logging: file.logging.clone().unwrap_or_default(),
    })
}

/// A daemon should come up even on hosts with broken tzdata, so failures
/// here degrade to UTC instead of erroring.
fn system_timezone() -> Tz {
    match iana_time_zone::get_timezone() {
        Ok(name) => match name.parse() {
            Ok(tz) => tz,
            Err(_) => {
                warn!("Unrecognized system timezone '{}', falling back to UTC", name);
                UTC
            }
        },
        Err(e) => {
            warn!("Unable to detect system timezone ({}), falling back to UTC", e);
            UTC
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_resolves_every_section() {
        let yaml = "\
database: /var/lib/taskmill/taskmill.db
poll_interval: 30
timezone: America/Sao_Paulo
transfer_api:
  base_url: https://mft.example.com/api/
  username: svc
  password: secret
  local_node: NODE_A
logging:
  output: stdout
  level: debug
";
        let file: ConfigFile = serde_yml::from_str(yaml).unwrap();
        let config = parse_config_file(&file).unwrap();

        assert_eq!(config.database, PathBuf::from("/var/lib/taskmill/taskmill.db"));
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.timezone, chrono_tz::America::Sao_Paulo);
        let api = config.transfer_api.unwrap();
        assert_eq!(api.base_url, "https://mft.example.com/api");
        assert_eq!(api.local_node, "NODE_A");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let file: ConfigFile = serde_yml::from_str("database: ./taskmill.db\n").unwrap();
        let config = parse_config_file(&file).unwrap();

        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert!(config.transfer_api.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let file: ConfigFile =
            serde_yml::from_str("database: ./t.db\ntimezone: Mars/Olympus\n").unwrap();
        assert!(parse_config_file(&file).is_err());
    }

    #[test]
    fn empty_database_path_is_rejected() {
        let file: ConfigFile = serde_yml::from_str("database: \"\"\n").unwrap();
        assert!(parse_config_file(&file).is_err());
    }
}

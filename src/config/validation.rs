use chrono_tz::Tz;
use reqwest::Url;
use std::path::Path;
use std::process::Command;

use crate::config::file::ConfigFile;
use crate::config::logging::LogOutput;

#[derive(Debug, Clone)]
pub enum ValidationResult {
    Error(String),
    Warning(String),
}

/// Static checks over the raw config file, run by `serve --validate`
/// and at startup. Errors block startup, warnings only get printed.
pub fn validate_config(conf: &ConfigFile) -> Vec<ValidationResult> {
    let mut result = vec![];

    if conf.database.as_os_str().is_empty() {
        result.push(ValidationResult::Error("Database path must not be empty".to_string()));
    }

    match conf.poll_interval {
        Some(0) => result.push(ValidationResult::Error(
            "poll_interval must be at least 1 second".to_string(),
        )),
        Some(n) if n < 5 => result.push(ValidationResult::Warning(format!(
            "poll_interval of {} s leaves little room between passes",
            n
        ))),
        _ => {}
    }

    if let Some(tz_name) = &conf.timezone {
        let tz: Result<Tz, _> = tz_name.parse();
        if tz.is_err() {
            result.push(ValidationResult::Error(format!(
                "Unable to parse timezone: '{}'",
                tz_name
            )));
        }
    }

    if let Some(api) = &conf.transfer_api {
        match Url::parse(&api.base_url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => result.push(ValidationResult::Error(format!(
                "transfer_api.base_url must be http or https, got '{}'",
                url.scheme()
            ))),
            Err(e) => result.push(ValidationResult::Error(format!(
                "Invalid transfer_api.base_url: {}",
                e
            ))),
        }
        if api.username.is_empty() {
            result.push(ValidationResult::Warning("transfer_api.username is empty".to_string()));
        }
        if api.local_node.is_empty() {
            result.push(ValidationResult::Error(
                "transfer_api.local_node must not be empty".to_string(),
            ));
        }
    }

    result.extend(validate_logging_config(conf));

    result
}

fn validate_logging_config(conf: &ConfigFile) -> Vec<ValidationResult> {
    let mut result = vec![];

    if let Some(logging) = &conf.logging {
        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&logging.level.as_str()) {
            result.push(ValidationResult::Error(format!(
                "Invalid log level '{}'. Must be one of: {}",
                logging.level,
                valid_levels.join(", ")
            )));
        }

        if logging.output == LogOutput::File {
            match &logging.file {
                Some(path) => {
                    if let Some(err) = validate_log_file(path) {
                        result.push(ValidationResult::Error(format!("Invalid log file: {}", err)));
                    }
                }
                None => result.push(ValidationResult::Warning(
                    "Log output is set to 'file' but no file path specified".to_string(),
                )),
            }
        }
    }

    result
}

fn validate_log_file(path: &Path) -> Option<String> {
    if path.exists() && !path.is_file() {
        return Some(format!("'{}' exists but is not a file", path.display()));
    }

    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            if !parent.exists() {
                return Some(format!("Directory '{}' does not exist", parent.display()));
            }
            let writable = Command::new("test")
                .args(["-w", &parent.to_string_lossy()])
                .status()
                .map(|s| s.success())
                .unwrap_or(false);
            if !writable {
                return Some(format!("Directory '{}' is not writable", parent.display()));
            }
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::file::TransferApiSection;
    use std::path::PathBuf;

    fn minimal() -> ConfigFile {
        ConfigFile {
            database: PathBuf::from("/tmp/taskmill-validate.db"),
            poll_interval: None,
            timezone: None,
            transfer_api: None,
            logging: None,
        }
    }

    fn error_count(results: &[ValidationResult]) -> usize {
        results.iter().filter(|r| matches!(r, ValidationResult::Error(_))).count()
    }

    fn warning_count(results: &[ValidationResult]) -> usize {
        results.iter().filter(|r| matches!(r, ValidationResult::Warning(_))).count()
    }

    #[test]
    fn clean_config_passes() {
        let results = validate_config(&minimal());
        assert_eq!(error_count(&results), 0);
        assert_eq!(warning_count(&results), 0);
    }

    #[test]
    fn empty_database_path_is_an_error() {
        let mut conf = minimal();
        conf.database = PathBuf::new();
        assert_eq!(error_count(&validate_config(&conf)), 1);
    }

    #[test]
    fn zero_poll_interval_is_an_error() {
        let mut conf = minimal();
        conf.poll_interval = Some(0);
        assert_eq!(error_count(&validate_config(&conf)), 1);
    }

    #[test]
    fn short_poll_interval_only_warns() {
        let mut conf = minimal();
        conf.poll_interval = Some(2);
        let results = validate_config(&conf);
        assert_eq!(error_count(&results), 0);
        assert_eq!(warning_count(&results), 1);
    }

    #[test]
    fn bad_timezone_is_an_error() {
        let mut conf = minimal();
        conf.timezone = Some("Mars/Olympus".to_string());
        assert_eq!(error_count(&validate_config(&conf)), 1);
    }

    #[test]
    fn transfer_api_url_must_be_http() {
        let mut conf = minimal();
        conf.transfer_api = Some(TransferApiSection {
            base_url: "ftp://mft.example.com".to_string(),
            username: "svc".to_string(),
            password: "secret".to_string(),
            local_node: "NODE_A".to_string(),
        });
        assert_eq!(error_count(&validate_config(&conf)), 1);
    }

    #[test]
    fn unparseable_transfer_api_url_is_an_error() {
        let mut conf = minimal();
        conf.transfer_api = Some(TransferApiSection {
            base_url: "not a url".to_string(),
            username: "svc".to_string(),
            password: "secret".to_string(),
            local_node: "NODE_A".to_string(),
        });
        assert!(error_count(&validate_config(&conf)) >= 1);
    }

    #[test]
    fn file_output_without_path_warns() {
        let mut conf = minimal();
        conf.logging = Some(crate::config::logging::LoggingConfig {
            output: LogOutput::File,
            file: None,
            level: "info".to_string(),
        });
        let results = validate_config(&conf);
        assert_eq!(error_count(&results), 0);
        assert_eq!(warning_count(&results), 1);
    }

    #[test]
    fn bogus_log_level_is_an_error() {
        let mut conf = minimal();
        conf.logging = Some(crate::config::logging::LoggingConfig {
            output: LogOutput::Stdout,
            file: None,
            level: "loud".to_string(),
        });
        assert_eq!(error_count(&validate_config(&conf)), 1);
    }
}

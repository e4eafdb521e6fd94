use crate::config::logging::{LogOutput, LoggingConfig};
use anyhow::{anyhow, Context, Result};
use log::LevelFilter;
use std::fs::OpenOptions;
use std::path::PathBuf;

const DEFAULT_LOG_FILE: &str = "/var/log/taskmill.log";

pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let level = config
        .level
        .parse::<LevelFilter>()
        .context(format!("Unknown log level '{}'", config.level))?;

    match &config.output {
        LogOutput::Stdout => {
            env_logger::Builder::new().filter_level(level).format_timestamp_secs().init();
        }
        LogOutput::File => {
            let path = config.file.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .context(format!("Failed to open log file '{}'", path.display()))?;

            env_logger::Builder::new()
                .filter_level(level)
                .format_timestamp_secs()
                .target(env_logger::Target::Pipe(Box::new(file)))
                .init();
        }
        LogOutput::Syslog => {
            let formatter = syslog::Formatter3164 {
                facility: syslog::Facility::LOG_USER,
                hostname: None,
                process: "taskmill".into(),
                pid: std::process::id(),
            };

            let logger = syslog::unix(formatter)
                .map_err(|e| anyhow!("Failed to connect to syslog: {}", e))?;
            log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))?;
            log::set_max_level(level);
        }
    }

    Ok(())
}

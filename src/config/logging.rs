use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
pub enum LogOutput {
    #[serde(rename = "stdout")]
    #[default]
    Stdout,
    #[serde(rename = "file")]
    File,
    #[serde(rename = "syslog")]
    Syslog,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub output: LogOutput,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { output: LogOutput::Stdout, file: None, level: default_level() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_sections_fill_in_defaults() {
        let config: LoggingConfig = serde_yml::from_str("output: syslog\n").unwrap();
        assert_eq!(config.output, LogOutput::Syslog);
        assert_eq!(config.level, "info");
        assert!(config.file.is_none());
    }

    #[test]
    fn empty_section_matches_the_default() {
        let config: LoggingConfig = serde_yml::from_str("{}").unwrap();
        assert_eq!(config.output, LogOutput::Stdout);
        assert_eq!(config.level, "info");
    }
}

//! Observability configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Base level for crates without a debug flag (trace, debug, info, warn, error)
    pub level: String,
    pub format: LogFormat,
    /// Per-run log folders are created here when file logging is enabled
    pub log_dir: Option<PathBuf>,
    pub retention_days: u64,
    pub retention_runs: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            log_dir: None,
            retention_days: 30,
            retention_runs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let options: LoggingOptions =
            serde_json::from_str(r#"{"level": "debug", "format": "json"}"#).unwrap();
        assert_eq!(options.level, "debug");
        assert_eq!(options.format, LogFormat::Json);
        assert_eq!(options.retention_runs, 10);
        assert!(options.log_dir.is_none());
    }
}

// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Logging initialization
//!
//! Console logging is always available. With the `file-logging` feature each
//! process run also gets its own timestamped folder of JSON log files.

use anyhow::{anyhow, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::cli::CrateDebugFlags;
use crate::config::{LogFormat, LoggingOptions};

/// Build the `EnvFilter` for the given flags, honouring `RUST_LOG` when set
pub fn build_env_filter(debug_flags: &CrateDebugFlags, options: &LoggingOptions) -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(debug_flags.to_filter_string(&options.level)),
    }
}

fn console_layer(
    debug_flags: &CrateDebugFlags,
    options: &LoggingOptions,
) -> Box<dyn Layer<Registry> + Send + Sync> {
    let filter = build_env_filter(debug_flags, options);
    match options.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
    }
}

/// Install a console-only global subscriber
///
/// # Errors
///
/// Fails if a global subscriber has already been installed.
pub fn init_console_logging(debug_flags: &CrateDebugFlags, options: &LoggingOptions) -> Result<()> {
    Registry::default()
        .with(console_layer(debug_flags, options))
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}

#[cfg(feature = "file-logging")]
pub use file::{init_logging, LoggingGuard};

#[cfg(feature = "file-logging")]
mod file {
    use super::*;
    use anyhow::Context;
    use chrono::{NaiveDateTime, Utc};
    use std::path::{Path, PathBuf};
    use tracing_appender::rolling;

    /// Keeps the non-blocking writers alive; logs are flushed on drop
    pub struct LoggingGuard {
        _file_guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
        log_dir: PathBuf,
    }

    impl LoggingGuard {
        pub fn log_dir(&self) -> &Path {
            &self.log_dir
        }
    }

    /// Initialize console logging plus per-run JSON log files
    ///
    /// ```text
    /// ./logs/
    ///   └── run_20250101_120000/
    ///       ├── dlsim-engine.log
    ///       ├── dlsim-model.log
    ///       └── dlsim.log (combined)
    /// ```
    pub fn init_logging(
        debug_flags: &CrateDebugFlags,
        options: &LoggingOptions,
    ) -> Result<LoggingGuard> {
        let base_log_dir = options
            .log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./logs"));

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let run_folder = base_log_dir.join(format!("run_{}", timestamp));
        std::fs::create_dir_all(&run_folder)
            .with_context(|| format!("Failed to create log directory: {}", run_folder.display()))?;

        cleanup_old_logs(&base_log_dir, &run_folder, options.retention_days, options.retention_runs)?;

        let mut layers = vec![console_layer(debug_flags, options)];
        let mut file_guards = Vec::new();

        for crate_name in crate::KNOWN_CRATES {
            let file_appender = rolling::daily(&run_folder, format!("{}.log", crate_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            file_guards.push(guard);

            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .with_filter(EnvFilter::new(format!(
                    "{}=debug,off",
                    crate_name.replace('-', "_")
                )))
                .boxed();
            layers.push(layer);
        }

        let combined_appender = rolling::daily(&run_folder, "dlsim.log");
        let (combined_non_blocking, combined_guard) = tracing_appender::non_blocking(combined_appender);
        file_guards.push(combined_guard);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(combined_non_blocking)
                .with_target(true)
                .json()
                .with_filter(build_env_filter(debug_flags, options))
                .boxed(),
        );

        Registry::default()
            .with(layers)
            .try_init()
            .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))?;

        Ok(LoggingGuard {
            _file_guards: file_guards,
            log_dir: run_folder,
        })
    }

    /// Remove run folders older than `retention_days`, then all but the newest `retention_runs`
    pub(crate) fn cleanup_old_logs(
        base_log_dir: &Path,
        current_run: &Path,
        retention_days: u64,
        retention_runs: usize,
    ) -> Result<()> {
        if !base_log_dir.exists() {
            return Ok(());
        }

        let cutoff = Utc::now().naive_utc() - chrono::Duration::days(retention_days as i64);
        let mut runs: Vec<(PathBuf, NaiveDateTime)> = Vec::new();

        for entry in std::fs::read_dir(base_log_dir)? {
            let path = entry?.path();
            if !path.is_dir() || path == current_run {
                continue;
            }
            let stamp = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("run_"))
                .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y%m%d_%H%M%S").ok());
            if let Some(stamp) = stamp {
                runs.push((path, stamp));
            }
        }

        // newest first
        runs.sort_by(|a, b| b.1.cmp(&a.1));

        // the current run occupies one retention slot
        let keep = retention_runs.saturating_sub(1);
        for (index, (path, stamp)) in runs.iter().enumerate() {
            if *stamp < cutoff || index >= keep {
                if let Err(e) = std::fs::remove_dir_all(path) {
                    tracing::warn!("failed to remove old log directory {}: {}", path.display(), e);
                }
            }
        }

        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_cleanup_keeps_newest_runs() {
            let dir = tempfile::tempdir().unwrap();
            let now = Utc::now().naive_utc();
            let mut names = Vec::new();
            for minutes in 0..4 {
                let stamp = now - chrono::Duration::minutes(minutes);
                let name = format!("run_{}", stamp.format("%Y%m%d_%H%M%S"));
                std::fs::create_dir_all(dir.path().join(&name)).unwrap();
                names.push(name);
            }
            let current = dir.path().join("run_current");
            std::fs::create_dir_all(&current).unwrap();

            cleanup_old_logs(dir.path(), &current, 30, 3).unwrap();

            assert!(dir.path().join(&names[0]).exists());
            assert!(dir.path().join(&names[1]).exists());
            assert!(!dir.path().join(&names[2]).exists());
            assert!(!dir.path().join(&names[3]).exists());
            assert!(current.exists());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_flags() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let flags = CrateDebugFlags::from_args(vec!["--debug-dlsim-model".to_string()]);
        let options = LoggingOptions {
            level: "warn".to_string(),
            ..LoggingOptions::default()
        };
        let filter = build_env_filter(&flags, &options).to_string();
        assert!(filter.contains("dlsim_model=debug"));
        assert!(filter.contains("warn"));
    }

    #[test]
    fn test_second_init_reports_error() {
        let flags = CrateDebugFlags::default();
        let options = LoggingOptions::default();
        let _ = init_console_logging(&flags, &options);
        assert!(init_console_logging(&flags, &options).is_err());
    }
}

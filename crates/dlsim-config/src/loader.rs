// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration file loading with override support
//!
//! Three tiers, later tiers win:
//! 1. TOML file (base values, missing keys fall back to defaults)
//! 2. Environment variables (`DLSIM_*`)
//! 3. CLI arguments (explicit user overrides)

use crate::{ConfigError, ConfigResult, DlsimConfig};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "DLSIM_CONFIG_PATH";

/// File name searched for in the working directory and its parents
pub const CONFIG_FILE_NAME: &str = "dlsim.toml";

/// Find the dlsim configuration file
///
/// Search order:
/// 1. `DLSIM_CONFIG_PATH` environment variable
/// 2. Current working directory: `./dlsim.toml`
/// 3. Up to 5 parent directories
///
/// # Errors
///
/// Returns `ConfigError::FileNotFound` if no config file is found in any location
pub fn find_config_file() -> ConfigResult<PathBuf> {
    if let Ok(env_path) = env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::FileNotFound(format!(
            "Config file specified by {} not found: {}",
            CONFIG_PATH_ENV,
            path.display()
        )));
    }

    let mut search_paths = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        search_paths.push(cwd.join(CONFIG_FILE_NAME));
        let mut current = cwd.as_path();
        for _ in 0..5 {
            match current.parent() {
                Some(parent) => {
                    search_paths.push(parent.join(CONFIG_FILE_NAME));
                    current = parent;
                }
                None => break,
            }
        }
    }

    if let Some(found) = search_paths.iter().find(|p| p.exists()) {
        return Ok(found.clone());
    }

    let search_list = search_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::FileNotFound(format!(
        "'{}' not found in any of these locations:\n{}\n\nSet {} to specify a custom location.",
        CONFIG_FILE_NAME, search_list, CONFIG_PATH_ENV
    )))
}

/// Load configuration from a TOML file and apply overrides
///
/// * `config_path` - Optional path to config file. If `None`, the file is searched for.
/// * `cli_args` - Optional CLI argument overrides
///
/// # Errors
///
/// Returns error if the config file is not found or contains invalid TOML
pub fn load_config(
    config_path: Option<&Path>,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<DlsimConfig> {
    let config_file = match config_path {
        Some(path) => path.to_path_buf(),
        None => find_config_file()?,
    };

    let content = fs::read_to_string(&config_file)?;
    let mut config: DlsimConfig = toml::from_str(&content)?;

    apply_environment_overrides(&mut config)?;
    if let Some(cli) = cli_args {
        apply_cli_overrides(&mut config, cli)?;
    }

    Ok(config)
}

/// Like [`load_config`], but starts from defaults when no file can be found
///
/// Parse errors in an existing file are still reported.
pub fn load_config_or_default(
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<DlsimConfig> {
    match load_config(None, cli_args) {
        Err(ConfigError::FileNotFound(_)) => {
            let mut config = DlsimConfig::default();
            apply_environment_overrides(&mut config)?;
            if let Some(cli) = cli_args {
                apply_cli_overrides(&mut config, cli)?;
            }
            Ok(config)
        }
        other => other,
    }
}

fn parse_bool(value: &str) -> bool {
    let lower = value.to_lowercase();
    lower == "true" || lower == "1" || lower == "yes"
}

fn parse_optional_usize(key: &str, value: &str) -> ConfigResult<Option<usize>> {
    let lower = value.to_lowercase();
    if lower.is_empty() || lower == "none" || lower == "0" {
        return Ok(None);
    }
    value
        .parse::<usize>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue(format!("{} must be an integer, got '{}'", key, value)))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue(format!("{} has invalid value '{}'", key, value)))
}

/// Apply a single `key = value` override, keys use `section_field` naming
fn apply_override(config: &mut DlsimConfig, key: &str, value: &str) -> ConfigResult<bool> {
    match key {
        "data_dir" => config.system.data_dir = PathBuf::from(value),
        "log_level" => config.system.log_level = value.to_string(),
        "dt" => config.simulator.dt = parse_number(key, value)?,
        "seed" => config.simulator.seed = Some(parse_number(key, value)?),
        "dtype" => config.simulator.dtype = value.parse()?,
        "device" => config.simulator.device = value.parse()?,
        "unroll_simulation" | "unroll" => {
            config.simulator.unroll_simulation = parse_number(key, value)?
        }
        "minibatch_size" => config.simulator.minibatch_size = parse_optional_usize(key, value)?,
        "tensorboard" => config.simulator.tensorboard = parse_bool(value),
        "profile" => config.simulator.profile = parse_bool(value),
        "progress_bar" => config.simulator.progress_bar = parse_bool(value),
        "planner" => config.graph_optimizer.planner = value.parse()?,
        "sort_signals" => config.graph_optimizer.sort_signals = parse_bool(value),
        "n_passes" => config.graph_optimizer.n_passes = parse_number(key, value)?,
        "n_epochs" => config.training.n_epochs = parse_number(key, value)?,
        "shuffle" => config.training.shuffle = parse_bool(value),
        "optimizer" => config.training.optimizer = value.parse()?,
        "learning_rate" => config.training.learning_rate = parse_number(key, value)?,
        "fd_epsilon" => config.training.fd_epsilon = parse_number(key, value)?,
        _ => return Ok(false),
    }
    Ok(true)
}

/// Apply environment variable overrides to configuration
///
/// Every key understood by [`apply_cli_overrides`] can be set through the
/// upper-cased variable `DLSIM_<KEY>`, e.g. `DLSIM_DTYPE=float64`,
/// `DLSIM_DEVICE=/gpu:0`, `DLSIM_UNROLL_SIMULATION=10`,
/// `DLSIM_MINIBATCH_SIZE=32`, `DLSIM_TENSORBOARD=1`.
pub fn apply_environment_overrides(config: &mut DlsimConfig) -> ConfigResult<()> {
    for key in OVERRIDE_KEYS {
        let var = format!("DLSIM_{}", key.to_uppercase());
        if let Ok(value) = env::var(&var) {
            apply_override(config, key, &value)?;
        }
    }
    Ok(())
}

/// Apply CLI argument overrides to configuration
///
/// `cli_args` maps keys such as `"dtype"` or `"unroll_simulation"` to values.
/// Unknown keys are ignored so callers can pass their full argument map.
pub fn apply_cli_overrides(
    config: &mut DlsimConfig,
    cli_args: &HashMap<String, String>,
) -> ConfigResult<()> {
    for (key, value) in cli_args {
        apply_override(config, key, value)?;
    }
    Ok(())
}

const OVERRIDE_KEYS: &[&str] = &[
    "data_dir",
    "log_level",
    "dt",
    "seed",
    "dtype",
    "device",
    "unroll_simulation",
    "minibatch_size",
    "tensorboard",
    "profile",
    "progress_bar",
    "planner",
    "sort_signals",
    "n_passes",
    "n_epochs",
    "shuffle",
    "optimizer",
    "learning_rate",
    "fd_epsilon",
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceSpec, PlannerKind, Precision};
    use std::fs::File;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_find_config_file_env_var() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("custom.toml");
        File::create(&config_path).unwrap();

        env::set_var(CONFIG_PATH_ENV, config_path.to_str().unwrap());
        let result = find_config_file();
        env::remove_var(CONFIG_PATH_ENV);

        assert_eq!(result.unwrap(), config_path);
    }

    #[test]
    fn test_find_config_file_env_var_missing() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        env::set_var(CONFIG_PATH_ENV, "/definitely/not/here/dlsim.toml");
        let result = find_config_file();
        env::remove_var(CONFIG_PATH_ENV);

        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_load_minimal_config() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);

        let mut file = File::create(&config_path).unwrap();
        writeln!(file, "[simulator]").unwrap();
        writeln!(file, "unroll_simulation = 4").unwrap();
        writeln!(file, "dtype = \"float64\"").unwrap();

        let config = load_config(Some(&config_path), None).unwrap();

        assert_eq!(config.simulator.unroll_simulation, 4);
        assert_eq!(config.simulator.dtype, Precision::Float64);
        assert_eq!(config.graph_optimizer.n_passes, 10);
    }

    #[test]
    fn test_environment_overrides() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let mut config = DlsimConfig::default();

        env::set_var("DLSIM_DEVICE", "/gpu:1");
        env::set_var("DLSIM_MINIBATCH_SIZE", "16");
        let result = apply_environment_overrides(&mut config);
        env::remove_var("DLSIM_DEVICE");
        env::remove_var("DLSIM_MINIBATCH_SIZE");

        result.unwrap();
        assert_eq!(config.simulator.device, DeviceSpec::Gpu(1));
        assert_eq!(config.simulator.minibatch_size, Some(16));
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = DlsimConfig::default();
        let mut cli_args = HashMap::new();
        cli_args.insert("planner".to_string(), "transitive".to_string());
        cli_args.insert("tensorboard".to_string(), "yes".to_string());
        cli_args.insert("unrelated_flag".to_string(), "x".to_string());

        apply_cli_overrides(&mut config, &cli_args).unwrap();

        assert_eq!(config.graph_optimizer.planner, PlannerKind::Transitive);
        assert!(config.simulator.tensorboard);
    }

    #[test]
    fn test_cli_override_rejects_bad_value() {
        let mut config = DlsimConfig::default();
        let mut cli_args = HashMap::new();
        cli_args.insert("unroll_simulation".to_string(), "many".to_string());

        let result = apply_cli_overrides(&mut config, &cli_args);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_minibatch_none_disables_batching() {
        let mut config = DlsimConfig::default();
        config.simulator.minibatch_size = Some(8);
        apply_override(&mut config, "minibatch_size", "none").unwrap();
        assert_eq!(config.simulator.minibatch_size, None);
    }

    #[test]
    fn test_override_precedence() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);

        let mut file = File::create(&config_path).unwrap();
        writeln!(file, "[simulator]").unwrap();
        writeln!(file, "unroll_simulation = 2").unwrap();
        writeln!(file, "device = \"/cpu:0\"").unwrap();

        env::set_var("DLSIM_UNROLL_SIMULATION", "8");
        env::set_var("DLSIM_DEVICE", "/gpu:0");

        let mut cli_args = HashMap::new();
        cli_args.insert("device".to_string(), "/cpu:3".to_string());

        let config = load_config(Some(&config_path), Some(&cli_args));

        env::remove_var("DLSIM_UNROLL_SIMULATION");
        env::remove_var("DLSIM_DEVICE");

        let config = config.unwrap();
        // CLI wins for device, env wins for unroll (no CLI override)
        assert_eq!(config.simulator.device, DeviceSpec::Cpu(3));
        assert_eq!(config.simulator.unroll_simulation, 8);
    }
}

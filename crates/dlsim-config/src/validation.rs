//! Configuration validation
//!
//! Checks that values are within the ranges the simulator can honour.
//! All problems are collected and reported together.

use crate::{ConfigError, ConfigResult, DlsimConfig};

/// Validation errors that can occur during config validation
#[derive(Debug, Clone)]
pub enum ConfigValidationError {
    MustBePositive { field: String, value: f64 },
    MustBeAtLeastOne { field: String },
    InvalidValue { field: String, reason: String },
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MustBePositive { field, value } => {
                write!(f, "{} must be > 0 (got {})", field, value)
            }
            Self::MustBeAtLeastOne { field } => write!(f, "{} must be >= 1", field),
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid configuration value for {}: {}", field, reason)
            }
        }
    }
}

/// Validate the complete configuration
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` listing every violation found
pub fn validate_config(config: &DlsimConfig) -> ConfigResult<()> {
    let mut errors = Vec::new();

    validate_simulator(config, &mut errors);
    validate_graph_optimizer(config, &mut errors);
    validate_training(config, &mut errors);

    if !errors.is_empty() {
        let error_messages = errors
            .iter()
            .map(|e| format!("  - {}", e))
            .collect::<Vec<_>>()
            .join("\n");

        return Err(ConfigError::ValidationError(format!(
            "Configuration validation failed:\n{}",
            error_messages
        )));
    }

    Ok(())
}

fn check_positive(field: &str, value: f64, errors: &mut Vec<ConfigValidationError>) {
    if !(value > 0.0 && value.is_finite()) {
        errors.push(ConfigValidationError::MustBePositive {
            field: field.to_string(),
            value,
        });
    }
}

fn validate_simulator(config: &DlsimConfig, errors: &mut Vec<ConfigValidationError>) {
    let sim = &config.simulator;
    check_positive("simulator.dt", sim.dt, errors);

    if sim.unroll_simulation == 0 {
        errors.push(ConfigValidationError::MustBeAtLeastOne {
            field: "simulator.unroll_simulation".to_string(),
        });
    }
    if sim.minibatch_size == Some(0) {
        errors.push(ConfigValidationError::MustBeAtLeastOne {
            field: "simulator.minibatch_size".to_string(),
        });
    }
    if config.system.data_dir.as_os_str().is_empty() && (sim.tensorboard || sim.profile) {
        errors.push(ConfigValidationError::InvalidValue {
            field: "system.data_dir".to_string(),
            reason: "must be set when tensorboard or profile output is enabled".to_string(),
        });
    }
}

fn validate_graph_optimizer(config: &DlsimConfig, errors: &mut Vec<ConfigValidationError>) {
    if config.graph_optimizer.n_passes == 0 {
        errors.push(ConfigValidationError::MustBeAtLeastOne {
            field: "graph_optimizer.n_passes".to_string(),
        });
    }
}

fn validate_training(config: &DlsimConfig, errors: &mut Vec<ConfigValidationError>) {
    check_positive("training.learning_rate", config.training.learning_rate, errors);
    check_positive("training.fd_epsilon", config.training.fd_epsilon, errors);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_valid_default_config() {
        assert!(validate_config(&DlsimConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_unroll_rejected() {
        let mut config = DlsimConfig::default();
        config.simulator.unroll_simulation = 0;

        let result = validate_config(&config);
        if let Err(ConfigError::ValidationError(msg)) = result {
            assert!(msg.contains("simulator.unroll_simulation"));
        } else {
            panic!("expected validation error");
        }
    }

    #[test]
    fn test_all_errors_reported() {
        let mut config = DlsimConfig::default();
        config.simulator.dt = 0.0;
        config.simulator.minibatch_size = Some(0);
        config.training.learning_rate = -1.0;

        let msg = match validate_config(&config) {
            Err(ConfigError::ValidationError(msg)) => msg,
            other => panic!("expected validation error, got {:?}", other),
        };
        assert!(msg.contains("simulator.dt"));
        assert!(msg.contains("simulator.minibatch_size"));
        assert!(msg.contains("training.learning_rate"));
    }

    #[test]
    fn test_output_requires_data_dir() {
        let mut config = DlsimConfig::default();
        config.system.data_dir = PathBuf::new();
        config.simulator.profile = true;

        assert!(validate_config(&config).is_err());
    }
}

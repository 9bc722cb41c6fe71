// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration type definitions
//!
//! This module defines all configuration structs that map to sections in
//! `dlsim.toml`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DlsimConfig {
    pub system: SystemConfig,
    pub simulator: SimulatorConfig,
    pub graph_optimizer: GraphOptimizerConfig,
    pub training: TrainingConfig,
    pub logging: LoggingConfig,
}

/// System-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Root directory for tensorboard runs, profiles and saved parameters
    pub data_dir: PathBuf,
    pub log_level: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./dlsim_data"),
            log_level: "info".to_string(),
        }
    }
}

/// Floating point precision used for all internal computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum Precision {
    #[default]
    Float32,
    Float64,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Float32 => "float32",
            Precision::Float64 => "float64",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precision {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "float32" | "f32" => Ok(Precision::Float32),
            "float64" | "f64" => Ok(Precision::Float64),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown dtype '{}' (expected float32 or float64)",
                other
            ))),
        }
    }
}

impl TryFrom<String> for Precision {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Precision> for String {
    fn from(value: Precision) -> Self {
        value.as_str().to_string()
    }
}

/// Device placement for simulator computation
///
/// Accepts `"default"`, `"cpu"`, `"gpu"`, and indexed forms such as
/// `"/cpu:0"` or `"/gpu:1"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceSpec {
    #[default]
    Default,
    Cpu(usize),
    Gpu(usize),
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Default => write!(f, "default"),
            DeviceSpec::Cpu(index) => write!(f, "/cpu:{}", index),
            DeviceSpec::Gpu(index) => write!(f, "/gpu:{}", index),
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        if normalized.is_empty() || normalized == "default" || normalized == "none" {
            return Ok(DeviceSpec::Default);
        }

        let body = normalized.trim_start_matches('/');
        let (kind, index) = match body.split_once(':') {
            Some((kind, index)) => {
                let index = index.parse::<usize>().map_err(|_| {
                    ConfigError::InvalidValue(format!("invalid device index in '{}'", s))
                })?;
                (kind, index)
            }
            None => (body, 0),
        };

        match kind {
            "cpu" => Ok(DeviceSpec::Cpu(index)),
            "gpu" => Ok(DeviceSpec::Gpu(index)),
            _ => Err(ConfigError::InvalidValue(format!(
                "unknown device '{}' (expected default, /cpu:N or /gpu:N)",
                s
            ))),
        }
    }
}

impl TryFrom<String> for DeviceSpec {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceSpec> for String {
    fn from(value: DeviceSpec) -> Self {
        value.to_string()
    }
}

/// Simulator configuration (`[simulator]`)
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Length of one simulation timestep, in seconds
    pub dt: f64,
    pub seed: Option<u64>,
    pub dtype: Precision,
    pub device: DeviceSpec,
    /// Steps executed per outer-loop iteration
    pub unroll_simulation: usize,
    /// `None` disables minibatching (one input instance per step)
    pub minibatch_size: Option<usize>,
    pub tensorboard: bool,
    pub profile: bool,
    pub progress_bar: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            dt: 0.001,
            seed: None,
            dtype: Precision::Float32,
            device: DeviceSpec::Default,
            unroll_simulation: 1,
            minibatch_size: None,
            tensorboard: false,
            profile: false,
            progress_bar: true,
        }
    }
}

/// Operator merging strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlannerKind {
    #[default]
    Greedy,
    Tree,
    Noop,
    Transitive,
}

impl fmt::Display for PlannerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannerKind::Greedy => write!(f, "greedy"),
            PlannerKind::Tree => write!(f, "tree"),
            PlannerKind::Noop => write!(f, "noop"),
            PlannerKind::Transitive => write!(f, "transitive"),
        }
    }
}

impl FromStr for PlannerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "greedy" => Ok(PlannerKind::Greedy),
            "tree" => Ok(PlannerKind::Tree),
            "noop" => Ok(PlannerKind::Noop),
            "transitive" => Ok(PlannerKind::Transitive),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown planner '{}'",
                other
            ))),
        }
    }
}

/// Graph optimizer configuration (`[graph_optimizer]`)
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GraphOptimizerConfig {
    pub planner: PlannerKind,
    /// Reorder signals to make operator reads contiguous
    pub sort_signals: bool,
    pub n_passes: usize,
}

impl Default for GraphOptimizerConfig {
    fn default() -> Self {
        Self {
            planner: PlannerKind::Greedy,
            sort_signals: true,
            n_passes: 10,
        }
    }
}

/// Parameter update rule used by training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    GradientDescent,
    Momentum,
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gradient_descent" | "sgd" => Ok(OptimizerKind::GradientDescent),
            "momentum" => Ok(OptimizerKind::Momentum),
            "adam" => Ok(OptimizerKind::Adam),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown optimizer '{}'",
                other
            ))),
        }
    }
}

/// Training configuration (`[training]`)
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub n_epochs: usize,
    pub shuffle: bool,
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    /// Perturbation size for finite-difference gradients
    pub fd_epsilon: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            n_epochs: 1,
            shuffle: true,
            optimizer: OptimizerKind::GradientDescent,
            learning_rate: 0.1,
            fd_epsilon: 1e-3,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_to_file: bool,
    pub log_dir: PathBuf,
    pub retention_days: u64,
    pub debug_crates: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_to_file: false,
            log_dir: PathBuf::from("./logs"),
            retention_days: 7,
            debug_crates: Vec::new(),
        }
    }
}

// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Simulator error types

use dlsim_config::ConfigError;
use dlsim_model::ModelError;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Simulator is closed; create a new simulator")]
    Closed,

    #[error("Simulation error: {0}")]
    Simulation(String),

    #[error("Shape of data array {actual:?} for {context} does not match expected shape {expected:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Build error: {0}")]
    Build(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Profile(#[from] dlsim_observability::ProfileError),
}

pub type Result<T> = std::result::Result<T, SimError>;

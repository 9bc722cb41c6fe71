// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Saving and restoring base array contents
//!
//! Trainable bases are always included. "Local" bases (non-trainable state
//! such as neuron voltages and filter values) are included on request.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SimError};
use crate::executor::SignalState;
use crate::float::SimFloat;
use crate::tensor_signal::SignalLayout;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamArray {
    pub key: usize,
    pub trainable: bool,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamFile {
    pub dtype: String,
    pub minibatch_size: usize,
    pub arrays: Vec<ParamArray>,
}

impl ParamFile {
    /// Snapshot the selected bases of `state`
    pub fn collect<T: SimFloat>(layout: &SignalLayout<T>, state: &SignalState<T>, include_local: bool) -> Self {
        let minibatch_size = state.iter().map(|b| b.dim().2).max().unwrap_or(1);
        let arrays = selected(layout, include_local)
            .map(|key| ParamArray {
                key,
                trainable: layout.params[key].trainable,
                shape: state[key].shape().to_vec(),
                values: state[key].iter().map(|v| v.into_f64()).collect(),
            })
            .collect();
        Self {
            dtype: T::NAME.to_string(),
            minibatch_size,
            arrays,
        }
    }

    /// Write the saved arrays back into `state`
    ///
    /// The file must contain exactly the bases that `include_local` selects,
    /// with matching shapes.
    pub fn apply<T: SimFloat>(&self, layout: &SignalLayout<T>, state: &mut SignalState<T>, include_local: bool) -> Result<()> {
        let keys: Vec<usize> = selected(layout, include_local).collect();
        let saved: Vec<usize> = self.arrays.iter().map(|a| a.key).collect();
        if keys != saved {
            return Err(SimError::Simulation(format!(
                "Number of saved parameters ({}) does not match the number of parameters in the model ({})",
                saved.len(),
                keys.len()
            )));
        }
        for array in &self.arrays {
            let base = &mut state[array.key];
            if base.shape() != array.shape.as_slice() {
                return Err(SimError::ShapeMismatch {
                    context: format!("saved base array {}", array.key),
                    expected: base.shape().to_vec(),
                    actual: array.shape.clone(),
                });
            }
            let dim = base.dim();
            let values: Vec<T> = array.values.iter().map(|v| T::of_f64(*v)).collect();
            *base = Array3::from_shape_vec(dim, values).map_err(|e| {
                SimError::Simulation(format!("saved base array {} is malformed: {}", array.key, e))
            })?;
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        info!("[SIM] Saved {} parameter arrays to {}", self.arrays.len(), path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let params: ParamFile = serde_json::from_reader(BufReader::new(file))?;
        info!("[SIM] Loaded {} parameter arrays from {}", params.arrays.len(), path.display());
        Ok(params)
    }
}

fn selected<T>(layout: &SignalLayout<T>, include_local: bool) -> impl Iterator<Item = usize> + '_ {
    layout
        .params
        .iter()
        .enumerate()
        .filter(move |(_, p)| p.trainable || include_local)
        .map(|(key, _)| key)
}

/// Human readable listing of the trainable signals and their current values
pub fn format_params<T: SimFloat>(layout: &SignalLayout<T>, state: &SignalState<T>, msg: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(msg) = msg {
        let _ = writeln!(out, "{}", msg);
    }
    let mut signals: Vec<_> = layout
        .signals()
        .filter(|ts| layout.params[ts.key].trainable)
        .collect();
    signals.sort_by(|a, b| a.label.cmp(&b.label));
    for ts in signals {
        let values: Vec<f64> = ts.gather(state).iter().map(|v| v.into_f64()).collect();
        let _ = writeln!(out, "{} {:?}: {:?}", ts.label, ts.shape, values);
    }
    out
}

// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Neuron model descriptions
//!
//! Only parameters live here. The per-step dynamics are implemented by the
//! execution engine so they can run at the simulator's precision.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Neuron nonlinearity applied to a population's input current
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NeuronType {
    /// `max(J, 0) * amplitude`
    RectifiedLinear { amplitude: f64 },
    /// Integrates `max(J, 0)` and emits spikes of height `amplitude / dt`
    SpikingRectifiedLinear { amplitude: f64 },
    /// `1 / (tau_ref * (1 + exp(-J)))`
    Sigmoid { tau_ref: f64 },
    /// Steady-state firing rate of a leaky integrate-and-fire neuron
    LifRate {
        tau_rc: f64,
        tau_ref: f64,
        amplitude: f64,
    },
    /// Spiking leaky integrate-and-fire neuron
    Lif {
        tau_rc: f64,
        tau_ref: f64,
        min_voltage: f64,
        amplitude: f64,
    },
}

impl NeuronType {
    pub fn rectified_linear() -> Self {
        NeuronType::RectifiedLinear { amplitude: 1.0 }
    }

    pub fn spiking_rectified_linear() -> Self {
        NeuronType::SpikingRectifiedLinear { amplitude: 1.0 }
    }

    pub fn sigmoid() -> Self {
        NeuronType::Sigmoid { tau_ref: 0.0025 }
    }

    pub fn lif_rate() -> Self {
        NeuronType::LifRate {
            tau_rc: 0.02,
            tau_ref: 0.002,
            amplitude: 1.0,
        }
    }

    pub fn lif() -> Self {
        NeuronType::Lif {
            tau_rc: 0.02,
            tau_ref: 0.002,
            min_voltage: 0.0,
            amplitude: 1.0,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            NeuronType::RectifiedLinear { .. } => "RectifiedLinear",
            NeuronType::SpikingRectifiedLinear { .. } => "SpikingRectifiedLinear",
            NeuronType::Sigmoid { .. } => "Sigmoid",
            NeuronType::LifRate { .. } => "LIFRate",
            NeuronType::Lif { .. } => "LIF",
        }
    }

    /// True if both are the same neuron model, regardless of parameters
    pub fn same_kind(&self, other: &NeuronType) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Names of the per-neuron state signals this model carries between steps
    pub fn state_names(&self) -> &'static [&'static str] {
        match self {
            NeuronType::SpikingRectifiedLinear { .. } => &["voltage"],
            NeuronType::Lif { .. } => &["voltage", "refractory_time"],
            _ => &[],
        }
    }

    pub fn is_spiking(&self) -> bool {
        matches!(
            self,
            NeuronType::SpikingRectifiedLinear { .. } | NeuronType::Lif { .. }
        )
    }

    /// Spiking models have no useful gradient
    pub fn is_differentiable(&self) -> bool {
        !self.is_spiking()
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        let positive = |name: &str, value: f64| {
            if value > 0.0 && value.is_finite() {
                Ok(())
            } else {
                Err(format!("{} must be > 0 (got {})", name, value))
            }
        };
        match *self {
            NeuronType::Sigmoid { tau_ref } => positive("tau_ref", tau_ref),
            NeuronType::LifRate { tau_rc, tau_ref, .. } | NeuronType::Lif { tau_rc, tau_ref, .. } => {
                positive("tau_rc", tau_rc)?;
                if tau_ref < 0.0 {
                    return Err(format!("tau_ref must be >= 0 (got {})", tau_ref));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for NeuronType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_name())
    }
}

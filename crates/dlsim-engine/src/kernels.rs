// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-step neuron and synapse math
//!
//! All arrays are `(neurons, batch)`. Large populations are updated with
//! rayon through `Zip::par_for_each`.

use ndarray::{Array2, ArrayView2, Zip};

use dlsim_model::{Lowpass, NeuronType};

use crate::error::{Result, SimError};
use crate::float::SimFloat;

/// Element count above which neuron updates run in parallel
pub const PARALLEL_THRESHOLD: usize = 16_384;

/// Advance `neuron_type` by one step
///
/// `states` holds the model's state arrays in the order given by
/// [`NeuronType::state_names`]; they are modified in place.
pub fn step_neurons<T: SimFloat>(
    neuron_type: &NeuronType,
    dt: f64,
    current: ArrayView2<T>,
    states: &mut [Array2<T>],
) -> Result<Array2<T>> {
    let expected = neuron_type.state_names().len();
    if states.len() != expected {
        return Err(SimError::Simulation(format!(
            "{} expects {} state signals, got {}",
            neuron_type,
            expected,
            states.len()
        )));
    }
    if let Some(state) = states.iter().find(|s| s.dim() != current.dim()) {
        return Err(SimError::ShapeMismatch {
            context: format!("{} state", neuron_type),
            expected: vec![current.nrows(), current.ncols()],
            actual: state.shape().to_vec(),
        });
    }
    let mut output = Array2::zeros(current.dim());
    let parallel = current.len() >= PARALLEL_THRESHOLD;
    let zero = T::zero();
    let one = T::one();
    let dt_t = T::of_f64(dt);

    match *neuron_type {
        NeuronType::RectifiedLinear { amplitude } => {
            let amp = T::of_f64(amplitude);
            let zip = Zip::from(&mut output).and(&current);
            let f = |out: &mut T, &j: &T| *out = j.max(zero) * amp;
            if parallel {
                zip.par_for_each(f)
            } else {
                zip.for_each(f)
            }
        }
        NeuronType::SpikingRectifiedLinear { amplitude } => {
            let amp = T::of_f64(amplitude);
            let (voltage, _) = states.split_at_mut(1);
            let zip = Zip::from(&mut output).and(&current).and(&mut voltage[0]);
            let f = |out: &mut T, &j: &T, v: &mut T| {
                *v += j.max(zero) * dt_t;
                let n_spikes = v.floor();
                *out = n_spikes * amp / dt_t;
                *v -= n_spikes;
            };
            if parallel {
                zip.par_for_each(f)
            } else {
                zip.for_each(f)
            }
        }
        NeuronType::Sigmoid { tau_ref } => {
            let tau_ref = T::of_f64(tau_ref);
            let zip = Zip::from(&mut output).and(&current);
            let f = |out: &mut T, &j: &T| *out = one / (tau_ref * (one + (-j).exp()));
            if parallel {
                zip.par_for_each(f)
            } else {
                zip.for_each(f)
            }
        }
        NeuronType::LifRate {
            tau_rc,
            tau_ref,
            amplitude,
        } => {
            let (tau_rc, tau_ref, amp) = (T::of_f64(tau_rc), T::of_f64(tau_ref), T::of_f64(amplitude));
            let zip = Zip::from(&mut output).and(&current);
            let f = |out: &mut T, &j: &T| {
                *out = if j > one {
                    amp / (tau_ref + tau_rc * (one / (j - one)).ln_1p())
                } else {
                    zero
                };
            };
            if parallel {
                zip.par_for_each(f)
            } else {
                zip.for_each(f)
            }
        }
        NeuronType::Lif {
            tau_rc,
            tau_ref,
            min_voltage,
            amplitude,
        } => {
            let (tau_rc, tau_ref) = (T::of_f64(tau_rc), T::of_f64(tau_ref));
            let (min_voltage, amp) = (T::of_f64(min_voltage), T::of_f64(amplitude));
            let (voltage, refractory) = states.split_at_mut(1);
            let zip = Zip::from(&mut output)
                .and(&current)
                .and(&mut voltage[0])
                .and(&mut refractory[0]);
            let f = |out: &mut T, &j: &T, v: &mut T, r: &mut T| {
                *r -= dt_t;
                let delta_t = (dt_t - *r).max(zero).min(dt_t);
                *v -= (j - *v) * (-delta_t / tau_rc).exp_m1();
                let spiked = *v > one;
                let t_spike = if spiked {
                    dt_t + tau_rc * (-(*v - one) / (j - one)).ln_1p()
                } else {
                    zero
                };
                *out = if spiked { amp / dt_t } else { zero };
                if *v < min_voltage {
                    *v = min_voltage;
                }
                if spiked {
                    *v = zero;
                    *r = tau_ref + t_spike;
                }
            };
            if parallel {
                zip.par_for_each(f)
            } else {
                zip.for_each(f)
            }
        }
    }

    Ok(output)
}

/// One lowpass step from the previous filtered value `y` and input `x`
///
/// `y` and `x` may differ in batch width when one of them has a single column.
pub fn lowpass_step<T: SimFloat>(filter: &Lowpass, dt: f64, y: &Array2<T>, x: &Array2<T>) -> Array2<T> {
    let decay = T::of_f64(filter.decay(dt));
    let gain = T::one() - decay;
    y * decay + &(x * gain)
}

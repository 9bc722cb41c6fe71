// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Training trainable base arrays against probe targets
//!
//! Every loss evaluation runs the model from its initial state (step 0) with
//! the current trainable values. Gradients are central finite differences
//! over every trainable element, evaluated in parallel with rayon.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ndarray::{Array3, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use dlsim_model::{Model, Operator, ProbeId};

use crate::error::{Result, SimError};
use crate::executor::{Executor, InputValues, SignalState};
use crate::feeds::{generate_inputs, InputFeeds};
use crate::float::SimFloat;
use crate::optimizer::Optimizer;

/// Target values per probe, shaped `(batch, n_steps, probe_size)`
pub type TargetData = HashMap<ProbeId, Array3<f64>>;

type ObjectiveFn = dyn Fn(ArrayView3<f64>, ArrayView3<f64>) -> f64 + Send + Sync;

/// Loss between probe output and target, both `(batch, n_steps, size)`
#[derive(Clone, Default)]
pub enum Objective {
    #[default]
    Mse,
    Custom(Arc<ObjectiveFn>),
}

impl Objective {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(ArrayView3<f64>, ArrayView3<f64>) -> f64 + Send + Sync + 'static,
    {
        Objective::Custom(Arc::new(f))
    }

    pub fn evaluate(&self, output: ArrayView3<f64>, target: ArrayView3<f64>) -> f64 {
        match self {
            Objective::Mse => {
                let n = output.len().max(1) as f64;
                output
                    .iter()
                    .zip(target.iter())
                    .map(|(o, t)| (o - t) * (o - t))
                    .sum::<f64>()
                    / n
            }
            Objective::Custom(f) => f(output, target),
        }
    }
}

impl fmt::Debug for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Objective::Mse => write!(f, "Mse"),
            Objective::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// One slice of the training data
#[derive(Debug, Clone)]
pub struct Minibatch {
    pub inputs: InputFeeds,
    pub targets: TargetData,
}

/// Number of data elements shared by every input and target array
pub fn data_batch_size(inputs: &InputFeeds, targets: &TargetData) -> Result<usize> {
    let mut sizes = inputs
        .values()
        .map(|a| a.dim().0)
        .chain(targets.values().map(|a| a.dim().0));
    let first = sizes
        .next()
        .ok_or_else(|| SimError::Simulation("no training targets given".to_string()))?;
    if sizes.any(|n| n != first) {
        return Err(SimError::Simulation(
            "all inputs and targets must have the same number of data elements".to_string(),
        ));
    }
    Ok(first)
}

/// Split the data into `minibatch_size` pieces, shuffled or in order
///
/// Elements left over after the last full minibatch are dropped with a warning.
pub fn minibatch_generator<R: Rng>(
    inputs: &InputFeeds,
    targets: &TargetData,
    minibatch_size: usize,
    shuffle: bool,
    rng: &mut R,
) -> Result<Vec<Minibatch>> {
    let n = data_batch_size(inputs, targets)?;
    if minibatch_size == 0 || n < minibatch_size {
        return Err(SimError::Simulation(format!(
            "Number of data elements ({}) is smaller than the minibatch size ({})",
            n, minibatch_size
        )));
    }
    if n % minibatch_size != 0 {
        warn!(
            "Number of data elements ({}) is not an even multiple of minibatch size ({}); inputs will be truncated",
            n, minibatch_size
        );
    }

    let mut order: Vec<usize> = (0..n).collect();
    if shuffle {
        order.shuffle(rng);
    }

    Ok(order
        .chunks_exact(minibatch_size)
        .map(|indices| Minibatch {
            inputs: inputs
                .iter()
                .map(|(k, v)| (*k, v.select(Axis(0), indices)))
                .collect(),
            targets: targets
                .iter()
                .map(|(k, v)| (*k, v.select(Axis(0), indices)))
                .collect(),
        })
        .collect())
}

/// Position of one trainable element: base key and `(row, element, batch)`
type ParamSlot = (usize, [usize; 3]);

fn param_slots<T: SimFloat>(executor: &Executor<T>) -> Vec<ParamSlot> {
    let layout = executor.layout();
    let mut slots = Vec::new();
    for (key, (base, params)) in layout.bases.iter().zip(&layout.params).enumerate() {
        if !params.trainable {
            continue;
        }
        let (rows, row_size, batch) = base.dim();
        for r in 0..rows {
            for e in 0..row_size {
                for b in 0..batch {
                    slots.push((key, [r, e, b]));
                }
            }
        }
    }
    slots
}

fn read_params<T: SimFloat>(state: &SignalState<T>, slots: &[ParamSlot]) -> Vec<f64> {
    slots.iter().map(|(key, idx)| state[*key][*idx].into_f64()).collect()
}

fn write_params<T: SimFloat>(state: &mut SignalState<T>, slots: &[ParamSlot], values: &[f64]) {
    for ((key, idx), v) in slots.iter().zip(values) {
        state[*key][*idx] = T::of_f64(*v);
    }
}

/// Runs one minibatch from step 0 and scores the target probes
struct LossEvaluator<'a, T: SimFloat> {
    executor: &'a Executor<T>,
    inputs: InputValues<T>,
    targets: &'a TargetData,
    n_steps: usize,
    objective: &'a Objective,
}

impl<'a, T: SimFloat> LossEvaluator<'a, T> {
    fn new(
        trainer: &'a Trainer<'a, T>,
        batch: &'a Minibatch,
        n_steps: usize,
        objective: &'a Objective,
    ) -> Result<Self> {
        let inputs = generate_inputs(
            trainer.model,
            &batch.inputs,
            0,
            n_steps,
            trainer.minibatch_size,
            trainer.model.dt,
        )?;
        Ok(Self {
            executor: trainer.executor,
            inputs,
            targets: &batch.targets,
            n_steps,
            objective,
        })
    }

    fn loss(&self, state: &SignalState<T>) -> Result<f64> {
        let mut state = state.clone();
        self.executor.set_step(&mut state, 0)?;

        let mut probes = Vec::with_capacity(self.targets.len());
        for (id, target) in self.targets {
            let ts = self
                .executor
                .probe_signal(*id)
                .ok_or_else(|| SimError::Simulation(format!("{} is not a probe of this model", id)))?;
            probes.push((ts, target, Array3::<f64>::zeros(target.dim())));
        }

        for i in 0..self.n_steps {
            self.executor.step(&mut state, &self.inputs, i)?;
            for (ts, _, output) in probes.iter_mut() {
                let values = ts.gather(&state);
                let (batch, _, size) = output.dim();
                for b in 0..batch {
                    let column = if values.ncols() == 1 { 0 } else { b };
                    for j in 0..size {
                        output[[b, i, j]] = values[[j, column]].into_f64();
                    }
                }
            }
        }

        let total: f64 = probes
            .iter()
            .map(|(_, target, output)| self.objective.evaluate(output.view(), target.view()))
            .sum();
        let loss = total / probes.len().max(1) as f64;
        if !loss.is_finite() {
            return Err(SimError::Simulation(format!("training loss is not finite ({})", loss)));
        }
        Ok(loss)
    }

    fn gradient(&self, state: &SignalState<T>, slots: &[ParamSlot], epsilon: f64) -> Result<Vec<f64>> {
        slots
            .par_iter()
            .map(|(key, idx)| {
                let mut perturbed = state.clone();
                let original = perturbed[*key][*idx].into_f64();
                perturbed[*key][*idx] = T::of_f64(original + epsilon);
                let plus = self.loss(&perturbed)?;
                perturbed[*key][*idx] = T::of_f64(original - epsilon);
                let minus = self.loss(&perturbed)?;
                Ok((plus - minus) / (2.0 * epsilon))
            })
            .collect()
    }
}

/// Borrowed view of a compiled simulator used for training and loss evaluation
pub struct Trainer<'a, T: SimFloat> {
    pub model: &'a Model,
    pub executor: &'a Executor<T>,
    pub minibatch_size: usize,
    pub fd_epsilon: f64,
}

impl<'a, T: SimFloat> Trainer<'a, T> {
    /// Check node/probe ids and `(batch, n_steps, size)` shapes; returns `n_steps`
    pub fn check_data(&self, inputs: &InputFeeds, targets: &TargetData) -> Result<usize> {
        let n_steps = targets
            .values()
            .map(|t| t.dim().1)
            .next()
            .ok_or_else(|| SimError::Simulation("no training targets given".to_string()))?;

        for (node, values) in inputs {
            let input = self.model.input(*node).ok_or_else(|| {
                SimError::Simulation(format!("{} is not an input node of model '{}'", node, self.model.label))
            })?;
            let (batch, steps, size) = values.dim();
            if steps != n_steps || size != input.size_out {
                return Err(SimError::ShapeMismatch {
                    context: format!("training input of node '{}'", input.label),
                    expected: vec![batch, n_steps, input.size_out],
                    actual: values.shape().to_vec(),
                });
            }
        }
        for (probe, values) in targets {
            let ts = self
                .executor
                .probe_signal(*probe)
                .ok_or_else(|| SimError::Simulation(format!("{} is not a probe of this model", probe)))?;
            let (batch, steps, size) = values.dim();
            if steps != n_steps || size != ts.size() {
                return Err(SimError::ShapeMismatch {
                    context: format!("training target of probe '{}'", ts.label),
                    expected: vec![batch, n_steps, ts.size()],
                    actual: values.shape().to_vec(),
                });
            }
        }
        data_batch_size(inputs, targets)?;
        Ok(n_steps)
    }

    /// Initial state of every non-trainable base with the trainable values of `state`
    fn training_state(&self, state: &SignalState<T>) -> SignalState<T> {
        let mut train_state = self.executor.initial_state();
        for (key, params) in self.executor.layout().params.iter().enumerate() {
            if params.trainable {
                train_state[key] = state[key].clone();
            }
        }
        train_state
    }

    fn warn_non_differentiable(&self) {
        for op in &self.model.operators {
            if let Operator::SimNeurons { neuron_type, .. } = op {
                if !neuron_type.is_differentiable() {
                    warn!(
                        "{} neurons are not differentiable; finite-difference gradients may be zero or noisy",
                        neuron_type
                    );
                    return;
                }
            }
        }
    }

    /// Optimise the trainable values in `state`; returns the mean loss of each epoch
    #[allow(clippy::too_many_arguments)]
    pub fn train<R: Rng>(
        &self,
        state: &mut SignalState<T>,
        inputs: &InputFeeds,
        targets: &TargetData,
        optimizer: &mut dyn Optimizer,
        n_epochs: usize,
        objective: &Objective,
        shuffle: bool,
        rng: &mut R,
    ) -> Result<Vec<f64>> {
        let n_steps = self.check_data(inputs, targets)?;
        self.warn_non_differentiable();

        let slots = param_slots(self.executor);
        if slots.is_empty() {
            warn!("Model has no trainable parameters; training only evaluates the loss");
        }
        info!(
            "[TRAIN] Training {} parameters for {} epochs with {} ({} steps per minibatch)",
            slots.len(),
            n_epochs,
            optimizer.name(),
            n_steps
        );

        let mut train_state = self.training_state(state);
        let mut epoch_losses = Vec::with_capacity(n_epochs);
        for epoch in 0..n_epochs {
            let batches = minibatch_generator(inputs, targets, self.minibatch_size, shuffle, rng)?;
            let mut total = 0.0;
            for batch in &batches {
                let evaluator = LossEvaluator::new(self, batch, n_steps, objective)?;
                total += evaluator.loss(&train_state)?;
                if slots.is_empty() {
                    continue;
                }
                let grads = evaluator.gradient(&train_state, &slots, self.fd_epsilon)?;
                let mut params = read_params(&train_state, &slots);
                optimizer.apply(&mut params, &grads);
                write_params(&mut train_state, &slots, &params);
            }
            let mean = total / batches.len().max(1) as f64;
            debug!("[TRAIN] epoch {}: loss {:.6}", epoch, mean);
            epoch_losses.push(mean);
        }

        for (key, params) in self.executor.layout().params.iter().enumerate() {
            if params.trainable {
                state[key] = train_state[key].clone();
            }
        }
        Ok(epoch_losses)
    }

    /// Mean loss over the data in `minibatch_size` pieces
    pub fn loss(
        &self,
        state: &SignalState<T>,
        inputs: &InputFeeds,
        targets: &TargetData,
        objective: &Objective,
    ) -> Result<f64> {
        let n_steps = self.check_data(inputs, targets)?;
        let train_state = self.training_state(state);
        // ordered batches; the rng is unused without shuffling
        let mut rng = StdRng::seed_from_u64(0);
        let batches = minibatch_generator(inputs, targets, self.minibatch_size, false, &mut rng)?;
        let mut total = 0.0;
        for batch in &batches {
            total += LossEvaluator::new(self, batch, n_steps, objective)?.loss(&train_state)?;
        }
        Ok(total / batches.len().max(1) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn data(n: usize) -> (InputFeeds, TargetData) {
        let mut inputs = InputFeeds::new();
        inputs.insert(
            dlsim_model::NodeId(0),
            Array3::from_shape_fn((n, 2, 1), |(b, _, _)| b as f64),
        );
        let mut targets = TargetData::new();
        targets.insert(ProbeId(0), Array3::from_shape_fn((n, 2, 1), |(b, _, _)| -(b as f64)));
        (inputs, targets)
    }

    #[test]
    fn test_minibatches_truncate() {
        let (inputs, targets) = data(5);
        let mut rng = StdRng::seed_from_u64(0);
        let batches = minibatch_generator(&inputs, &targets, 2, false, &mut rng).unwrap();
        assert_eq!(batches.len(), 2);
        let second = &batches[1].inputs[&dlsim_model::NodeId(0)];
        assert_eq!(second[[0, 0, 0]], 2.0);
        assert_eq!(second[[1, 0, 0]], 3.0);
    }

    #[test]
    fn test_shuffled_minibatches_keep_pairs() {
        let (inputs, targets) = data(6);
        let mut rng = StdRng::seed_from_u64(3);
        let batches = minibatch_generator(&inputs, &targets, 3, true, &mut rng).unwrap();
        let mut seen = Vec::new();
        for batch in &batches {
            let x = &batch.inputs[&dlsim_model::NodeId(0)];
            let y = &batch.targets[&ProbeId(0)];
            for b in 0..3 {
                assert_eq!(x[[b, 0, 0]], -y[[b, 0, 0]]);
                seen.push(x[[b, 0, 0]] as usize);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_too_little_data() {
        let (inputs, targets) = data(1);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(minibatch_generator(&inputs, &targets, 4, false, &mut rng).is_err());
    }

    #[test]
    fn test_objectives() {
        let out = Array3::from_elem((1, 2, 1), 1.0);
        let target = Array3::from_elem((1, 2, 1), 3.0);
        assert_eq!(Objective::Mse.evaluate(out.view(), target.view()), 4.0);
        let abs = Objective::custom(|o, t| (&o - &t).mapv(f64::abs).sum());
        assert_eq!(abs.evaluate(out.view(), target.view()), 4.0);
    }
}

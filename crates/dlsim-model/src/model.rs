// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! The lowered model: signals, operators, probes and external inputs

use ndarray::{ArrayD, IxDyn};

use crate::error::{ModelError, ModelResult};
use crate::ids::{NodeId, OpId, ProbeId, SignalId};
use crate::network::NodeFunction;
use crate::operator::Operator;
use crate::signal::{Signal, SignalView};

/// A probe resolved to the signal it records
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    pub id: ProbeId,
    pub label: String,
    pub signal: SignalId,
    pub sample_every: Option<f64>,
}

/// Where an input node's values come from when no feed overrides them
#[derive(Debug, Clone)]
pub enum InputSource {
    Constant(Vec<f64>),
    Function(NodeFunction),
}

/// A node without inputs; its values are generated outside the step loop
#[derive(Debug, Clone)]
pub struct InputInfo {
    pub node: NodeId,
    pub label: String,
    pub size_out: usize,
    /// `None` for nodes that produce no values (`size_out == 0`)
    pub output: Option<SignalId>,
    pub source: InputSource,
}

#[derive(Debug, Clone)]
pub struct Model {
    pub label: String,
    pub dt: f64,
    pub signals: Vec<Signal>,
    pub operators: Vec<Operator>,
    pub probes: Vec<ProbeInfo>,
    pub inputs: Vec<InputInfo>,
    pub step: SignalId,
    pub time: SignalId,
}

impl Model {
    /// Empty model containing only the step counter, the clock and their update
    pub fn new(label: impl Into<String>, dt: f64) -> Self {
        let mut model = Self {
            label: label.into(),
            dt,
            signals: Vec::new(),
            operators: Vec::new(),
            probes: Vec::new(),
            inputs: Vec::new(),
            step: SignalId(0),
            time: SignalId(1),
        };
        model.step = model.add_signal(Signal::zeros("step", &[1]));
        model.time = model.add_signal(Signal::zeros("time", &[1]));
        model.add_op(Operator::TimeUpdate {
            step: model.step,
            time: model.time,
        });
        model
    }

    pub fn add_signal(&mut self, signal: Signal) -> SignalId {
        self.signals.push(signal);
        SignalId(self.signals.len() - 1)
    }

    /// Add a view selecting `rows` rows of `base`, starting at `offset`, every `stride` rows
    ///
    /// Views of views are resolved onto the root base.
    pub fn add_view(
        &mut self,
        name: impl Into<String>,
        base: SignalId,
        offset: usize,
        rows: usize,
        stride: usize,
    ) -> ModelResult<SignalId> {
        let parent = self.signal(base)?;
        if rows == 0 || stride == 0 {
            return Err(ModelError::InvalidView {
                base,
                reason: "views need at least one row and a positive stride".to_string(),
            });
        }
        let last = offset + (rows - 1) * stride;
        if last >= parent.rows() {
            return Err(ModelError::InvalidView {
                base,
                reason: format!("row {} out of range for {} rows", last, parent.rows()),
            });
        }

        let mut shape = parent.shape().to_vec();
        shape[0] = rows;
        let row_size = parent.row_size();
        let source = parent.initial_value();
        let flat: Vec<f64> = source.iter().copied().collect();
        let mut values = Vec::with_capacity(rows * row_size);
        for k in 0..rows {
            let row = offset + k * stride;
            values.extend_from_slice(&flat[row * row_size..(row + 1) * row_size]);
        }
        let initial = ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|e| {
            ModelError::InvalidView {
                base,
                reason: e.to_string(),
            }
        })?;

        let view = match parent.view {
            Some(outer) => SignalView {
                base: outer.base,
                offset: outer.offset + offset * outer.stride,
                stride: outer.stride * stride,
            },
            None => SignalView {
                base,
                offset,
                stride,
            },
        };

        let mut signal = Signal::new(name, initial)
            .trainable(parent.trainable)
            .minibatched(parent.minibatched);
        signal.view = Some(view);
        Ok(self.add_signal(signal))
    }

    pub fn add_op(&mut self, op: Operator) -> OpId {
        self.operators.push(op);
        OpId(self.operators.len() - 1)
    }

    pub fn signal(&self, id: SignalId) -> ModelResult<&Signal> {
        self.signals.get(id.0).ok_or(ModelError::UnknownSignal(id))
    }

    /// The signal that owns the memory of `id`
    pub fn base_of(&self, id: SignalId) -> SignalId {
        match self.signals.get(id.0).and_then(|s| s.view) {
            Some(view) => view.base,
            None => id,
        }
    }

    /// Rows of the base signal covered by `id`
    pub fn base_rows(&self, id: SignalId) -> Vec<usize> {
        match self.signals.get(id.0) {
            Some(signal) => match signal.view {
                Some(view) => (0..signal.rows())
                    .map(|k| view.offset + k * view.stride)
                    .collect(),
                None => (0..signal.rows()).collect(),
            },
            None => Vec::new(),
        }
    }

    /// True if the two signals share any memory
    pub fn overlaps(&self, a: SignalId, b: SignalId) -> bool {
        if a == b {
            return true;
        }
        if self.base_of(a) != self.base_of(b) {
            return false;
        }
        let rows_a = self.base_rows(a);
        let rows_b = self.base_rows(b);
        rows_a.iter().any(|r| rows_b.contains(r))
    }

    pub fn probe(&self, id: ProbeId) -> Option<&ProbeInfo> {
        self.probes.iter().find(|p| p.id == id)
    }

    pub fn input(&self, node: NodeId) -> Option<&InputInfo> {
        self.inputs.iter().find(|i| i.node == node)
    }

    /// Every signal referenced by an operator must exist
    pub fn validate(&self) -> ModelResult<()> {
        for op in &self.operators {
            for sig in op.all_signals() {
                self.signal(sig)?;
            }
        }
        for probe in &self.probes {
            self.signal(probe.signal)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_new_model_has_time_update() {
        let model = Model::new("m", 0.001);
        assert_eq!(model.signals.len(), 2);
        assert_eq!(model.operators.len(), 1);
        assert!(matches!(model.operators[0], Operator::TimeUpdate { .. }));
    }

    #[test]
    fn test_view_copies_rows_and_resolves_nested_base() {
        let mut model = Model::new("m", 0.001);
        let values = Array2::from_shape_fn((6, 2), |(r, c)| (r * 10 + c) as f64).into_dyn();
        let base = model.add_signal(Signal::new("base", values).minibatched(true));

        let every_other = model.add_view("even", base, 0, 3, 2).unwrap();
        let nested = model.add_view("nested", every_other, 1, 2, 1).unwrap();

        let sig = model.signal(nested).unwrap();
        assert_eq!(sig.shape(), &[2, 2]);
        assert!(sig.minibatched);
        assert_eq!(model.base_of(nested), base);
        assert_eq!(model.base_rows(nested), vec![2, 4]);
        assert_eq!(sig.initial_value()[[0, 1]], 21.0);
        assert_eq!(sig.initial_value()[[1, 0]], 40.0);
    }

    #[test]
    fn test_view_out_of_range() {
        let mut model = Model::new("m", 0.001);
        let base = model.add_signal(Signal::zeros("base", &[4]));
        assert!(model.add_view("bad", base, 2, 2, 2).is_err());
        assert!(model.add_view("empty", base, 0, 0, 1).is_err());
    }

    #[test]
    fn test_overlap() {
        let mut model = Model::new("m", 0.001);
        let base = model.add_signal(Signal::zeros("base", &[6]));
        let low = model.add_view("low", base, 0, 3, 1).unwrap();
        let high = model.add_view("high", base, 3, 3, 1).unwrap();
        let odd = model.add_view("odd", base, 1, 3, 2).unwrap();
        let other = model.add_signal(Signal::zeros("other", &[6]));

        assert!(!model.overlaps(low, high));
        assert!(model.overlaps(low, base));
        assert!(model.overlaps(odd, high));
        assert!(!model.overlaps(base, other));
    }
}

// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Base arrays and the signal views into them
//!
//! Signals with the same trailing shape and the same trainable/minibatched
//! flags are packed into shared base arrays of shape
//! `(rows, row_size, batch)`. Each signal becomes a [`TensorSignal`]: a list
//! of rows in one base array.

use ahash::AHashMap;
use ndarray::{s, Array2, Array3};
use tracing::debug;

use dlsim_model::{Model, SignalId};

use crate::error::{Result, SimError};
use crate::float::SimFloat;
use crate::planner::Plan;

/// A signal resolved to rows of a base array
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSignal {
    /// Index of the base array
    pub key: usize,
    pub indices: Vec<usize>,
    pub shape: Vec<usize>,
    pub minibatched: bool,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Set,
    Inc,
}

impl TensorSignal {
    pub fn rows(&self) -> usize {
        self.indices.len()
    }

    pub fn row_size(&self) -> usize {
        self.shape[1..].iter().product()
    }

    pub fn size(&self) -> usize {
        self.rows() * self.row_size()
    }

    /// Values as `(size, batch)`, rows flattened in row-major order
    pub fn gather<T: SimFloat>(&self, bases: &[Array3<T>]) -> Array2<T> {
        let base = &bases[self.key];
        let row_size = self.row_size();
        let batch = base.dim().2;
        let mut out = Array2::zeros((self.size(), batch));
        for (k, &row) in self.indices.iter().enumerate() {
            out.slice_mut(s![k * row_size..(k + 1) * row_size, ..])
                .assign(&base.slice(s![row, .., ..]));
        }
        out
    }

    /// Write `(size, batch)` values back; a single column is broadcast over the batch
    pub fn scatter<T: SimFloat>(&self, bases: &mut [Array3<T>], values: &Array2<T>, mode: WriteMode) -> Result<()> {
        let base = &mut bases[self.key];
        let row_size = self.row_size();
        let batch = base.dim().2;
        let (size, value_batch) = values.dim();
        if size != self.size() || (value_batch != batch && value_batch != 1) {
            return Err(SimError::ShapeMismatch {
                context: format!("write to {}", self.label),
                expected: vec![self.size(), batch],
                actual: vec![size, value_batch],
            });
        }
        for (k, &row) in self.indices.iter().enumerate() {
            let src = values.slice(s![k * row_size..(k + 1) * row_size, ..]);
            let mut dst = base.slice_mut(s![row, .., ..]);
            match mode {
                WriteMode::Set => dst.assign(&src),
                WriteMode::Inc => dst += &src,
            }
        }
        Ok(())
    }

    /// Sub-signal selecting `rows` rows starting at `offset`, every `stride` rows
    fn slice_rows(&self, offset: usize, rows: usize, stride: usize, label: String) -> Option<Self> {
        let indices = (0..rows)
            .map(|k| self.indices.get(offset + k * stride).copied())
            .collect::<Option<Vec<_>>>()?;
        let mut shape = self.shape.clone();
        shape[0] = rows;
        Some(Self {
            key: self.key,
            indices,
            shape,
            minibatched: self.minibatched,
            label,
        })
    }
}

/// Packing parameters shared by every signal in a base array
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaseParams {
    pub trailing_shape: Vec<usize>,
    pub trainable: bool,
    pub minibatched: bool,
}

#[derive(Debug, Clone)]
pub struct SignalLayout<T> {
    /// Initial contents of every base array
    pub bases: Vec<Array3<T>>,
    pub params: Vec<BaseParams>,
    sig_map: Vec<Option<TensorSignal>>,
}

impl<T: SimFloat> SignalLayout<T> {
    pub fn get(&self, sig: SignalId) -> Option<&TensorSignal> {
        self.sig_map.get(sig.index()).and_then(|t| t.as_ref())
    }

    pub fn require(&self, sig: SignalId) -> Result<&TensorSignal> {
        self.get(sig)
            .ok_or_else(|| SimError::Build(format!("signal {} has no place in the base arrays", sig)))
    }

    /// Every mapped signal, in signal id order
    pub fn signals(&self) -> impl Iterator<Item = &TensorSignal> {
        self.sig_map.iter().flatten()
    }

    pub fn n_mapped(&self) -> usize {
        self.sig_map.iter().filter(|t| t.is_some()).count()
    }
}

/// Split the ordered signal list where no operator group reads across the gap
///
/// Resets are ignored; one big reset group would otherwise join everything.
fn partition_breaks(model: &Model, order: &[SignalId], plan: &Plan) -> Vec<bool> {
    let position: AHashMap<SignalId, usize> = order.iter().enumerate().map(|(i, s)| (*s, i)).collect();
    let mut diff: AHashMap<SignalId, i64> = AHashMap::new();

    for ops in plan {
        let first = &model.operators[ops[0].index()];
        if first.kind() == dlsim_model::OpKind::Reset {
            continue;
        }
        let all: Vec<Vec<SignalId>> = ops
            .iter()
            .map(|op| model.operators[op.index()].all_signals())
            .collect();
        for i in 0..all[0].len() {
            let bases: Vec<SignalId> = all.iter().map(|sigs| model.base_of(sigs[i])).collect();
            let idx = |s: &SignalId| position.get(s).copied().unwrap_or(0);
            let lo = bases.iter().min_by_key(|s| idx(s)).copied();
            let hi = bases.iter().rev().max_by_key(|s| idx(s)).copied();
            if let (Some(lo), Some(hi)) = (lo, hi) {
                *diff.entry(lo).or_default() += 1;
                *diff.entry(hi).or_default() -= 1;
            }
        }
    }

    // break_before[i]: signal i starts a new partition
    let mut break_before = vec![false; order.len() + 1];
    let mut open = 0i64;
    for (i, sig) in order.iter().enumerate() {
        open += diff.get(sig).copied().unwrap_or(0);
        if open == 0 {
            break_before[i + 1] = true;
        }
    }
    break_before
}

/// Pack the base signals in `order` into base arrays and map every signal
/// used by the plan or a probe onto them
pub fn create_signals<T: SimFloat>(
    model: &Model,
    order: &[SignalId],
    plan: &Plan,
    minibatch_size: usize,
) -> Result<SignalLayout<T>> {
    // probes can target bases no operator touches
    let mut order = order.to_vec();
    for probe in &model.probes {
        let base = model.base_of(probe.signal);
        if !order.contains(&base) {
            order.push(base);
        }
    }

    let breaks = partition_breaks(model, &order, plan);
    let mut curr_keys: AHashMap<BaseParams, usize> = AHashMap::new();
    let mut chunks: Vec<Vec<Array3<T>>> = Vec::new();
    let mut params: Vec<BaseParams> = Vec::new();
    let mut row_counts: Vec<usize> = Vec::new();
    let mut sig_map: Vec<Option<TensorSignal>> = vec![None; model.signals.len()];

    for (i, &sig_id) in order.iter().enumerate() {
        let sig = model.signal(sig_id)?;
        if sig.is_view() {
            return Err(SimError::Build(format!("{} is a view, expected a base signal", sig.name)));
        }
        if breaks[i] {
            curr_keys.clear();
        }

        let shape = sig.shape().to_vec();
        let base_params = BaseParams {
            trailing_shape: shape[1..].to_vec(),
            trainable: sig.trainable,
            minibatched: sig.minibatched,
        };
        let key = match curr_keys.get(&base_params) {
            Some(&key) => key,
            None => {
                let key = chunks.len();
                chunks.push(Vec::new());
                params.push(base_params.clone());
                row_counts.push(0);
                curr_keys.insert(base_params, key);
                key
            }
        };

        let rows = sig.rows();
        let row_size = sig.row_size();
        let batch = if sig.minibatched { minibatch_size } else { 1 };
        let flat: Vec<T> = sig.initial_value().iter().map(|v| T::of_f64(*v)).collect();
        let chunk = Array3::from_shape_fn((rows, row_size, batch), |(r, e, _)| flat[r * row_size + e]);
        chunks[key].push(chunk);

        let start = row_counts[key];
        row_counts[key] += rows;
        sig_map[sig_id.index()] = Some(TensorSignal {
            key,
            indices: (start..start + rows).collect(),
            shape,
            minibatched: sig.minibatched,
            label: sig.name.clone(),
        });
    }

    let bases = chunks
        .into_iter()
        .zip(params.iter())
        .map(|(parts, p)| {
            let views: Vec<_> = parts.iter().map(|a| a.view()).collect();
            ndarray::concatenate(ndarray::Axis(0), &views).map_err(|e| {
                SimError::Build(format!("cannot pack base array {:?}: {}", p, e))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    // views used by operators or probes
    let views = plan
        .iter()
        .flatten()
        .flat_map(|op| model.operators[op.index()].all_signals())
        .chain(model.probes.iter().map(|p| p.signal))
        .filter(|s| model.signals[s.index()].is_view());
    for sig_id in views {
        if sig_map[sig_id.index()].is_some() {
            continue;
        }
        let sig = model.signal(sig_id)?;
        let Some(view) = sig.view else { continue };
        let base = sig_map[view.base.index()]
            .as_ref()
            .ok_or_else(|| SimError::Build(format!("base of view {} was not packed", sig.name)))?;
        if sig.trailing_shape() != &base.shape[1..] {
            return Err(SimError::Build(format!(
                "Slicing and reshaping the same signal is not supported ({})",
                sig.name
            )));
        }
        let mapped = base
            .slice_rows(view.offset, sig.rows(), view.stride, sig.name.clone())
            .ok_or_else(|| SimError::Build(format!("view {} exceeds its base", sig.name)))?;
        sig_map[sig_id.index()] = Some(mapped);
    }

    let layout = SignalLayout { bases, params, sig_map };
    verify_layout(model, &layout)?;

    debug!(
        "[LAYOUT] {} signals packed into {} base arrays",
        layout.n_mapped(),
        layout.bases.len()
    );
    for (key, (base, p)) in layout.bases.iter().zip(layout.params.iter()).enumerate() {
        debug!(
            "[LAYOUT]   base {}: shape {:?}, trainable={}, minibatched={}",
            key,
            base.shape(),
            p.trainable,
            p.minibatched
        );
    }
    Ok(layout)
}

/// Every mapped signal must have its declared shape and initial value
fn verify_layout<T: SimFloat>(model: &Model, layout: &SignalLayout<T>) -> Result<()> {
    for (index, mapped) in layout.sig_map.iter().enumerate() {
        let Some(ts) = mapped else { continue };
        let sig = &model.signals[index];
        if ts.shape != sig.shape() {
            return Err(SimError::Build(format!(
                "TensorSignal shape {:?} does not match Signal shape {:?}",
                ts.shape,
                sig.shape()
            )));
        }
        let values = ts.gather(&layout.bases);
        for (k, expected) in sig.initial_value().iter().enumerate() {
            for actual in values.row(k) {
                let actual = actual.into_f64();
                let tolerance = 1e-8 + 1e-5 * expected.abs();
                if (actual - expected).abs() > tolerance {
                    return Err(SimError::Build(format!(
                        "TensorSignal values don't match Signal values ({})",
                        sig.name
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::operator_dependency_graph;
    use crate::planner::greedy_planner;
    use crate::signal_order::order_signals;
    use dlsim_model::{Operator, Signal};
    use ndarray::{array, ArrayD, IxDyn};

    fn packed(model: &Model, minibatch: usize) -> SignalLayout<f64> {
        let graph = operator_dependency_graph(model).unwrap();
        let plan = greedy_planner(model, &graph).unwrap();
        let (order, plan) = order_signals(model, &plan, 10);
        create_signals(model, &order, &plan, minibatch).unwrap()
    }

    #[test]
    fn test_same_params_share_a_base() {
        let mut model = Model::new("pack", 0.001);
        let a = model.add_signal(Signal::from_vec("a", vec![1.0, 2.0]).minibatched(true));
        let b = model.add_signal(Signal::from_vec("b", vec![3.0]).minibatched(true));
        let out = model.add_signal(Signal::zeros("out", &[2]).minibatched(true));
        let out_b = model.add_signal(Signal::zeros("out_b", &[1]).minibatched(true));
        model.add_op(Operator::Copy { src: a, dst: out, inc: false });
        model.add_op(Operator::Copy { src: b, dst: out_b, inc: false });

        let layout = packed(&model, 3);
        let ta = layout.get(a).unwrap();
        let tb = layout.get(b).unwrap();
        assert_eq!(ta.key, tb.key);
        assert_eq!(layout.bases[ta.key].dim().2, 3);

        let values = ta.gather(&layout.bases);
        assert_eq!(values.dim(), (2, 3));
        assert_eq!(values[[1, 2]], 2.0);
    }

    #[test]
    fn test_flags_split_bases() {
        let mut model = Model::new("pack", 0.001);
        let w = model.add_signal(Signal::from_vec("w", vec![0.5]).trainable(true));
        let x = model.add_signal(Signal::from_vec("x", vec![2.0]).minibatched(true));
        let y = model.add_signal(Signal::zeros("y", &[1]).minibatched(true));
        model.add_op(Operator::ElementwiseInc { a: w, x, y });

        let layout = packed(&model, 2);
        let tw = layout.get(w).unwrap();
        let tx = layout.get(x).unwrap();
        assert_ne!(tw.key, tx.key);
        assert!(layout.params[tw.key].trainable);
        assert_eq!(layout.bases[tw.key].dim().2, 1);
    }

    #[test]
    fn test_views_map_to_base_rows() {
        let mut model = Model::new("views", 0.001);
        let values = ArrayD::from_shape_vec(IxDyn(&[4, 2]), (0..8).map(|v| v as f64).collect()).unwrap();
        let base = model.add_signal(Signal::new("base", values));
        let odd = model.add_view("odd", base, 1, 2, 2).unwrap();
        let dst = model.add_signal(Signal::zeros("dst", &[2, 2]));
        model.add_op(Operator::Copy { src: odd, dst, inc: false });

        let layout = packed(&model, 1);
        let view = layout.get(odd).unwrap();
        let base_ts = layout.get(base).unwrap();
        assert_eq!(view.key, base_ts.key);
        assert_eq!(view.indices, vec![base_ts.indices[1], base_ts.indices[3]]);
        assert_eq!(view.gather(&layout.bases), array![[2.0], [3.0], [6.0], [7.0]]);
    }

    #[test]
    fn test_scatter_modes() {
        let mut model = Model::new("scatter", 0.001);
        let a = model.add_signal(Signal::from_vec("a", vec![1.0, 1.0]).minibatched(true));
        let b = model.add_signal(Signal::zeros("b", &[2]).minibatched(true));
        model.add_op(Operator::Copy { src: a, dst: b, inc: true });

        let layout = packed(&model, 2);
        let mut bases = layout.bases.clone();
        let tb = layout.get(b).unwrap();
        tb.scatter(&mut bases, &array![[1.0], [2.0]], WriteMode::Set).unwrap();
        tb.scatter(&mut bases, &array![[1.0, 2.0], [3.0, 4.0]], WriteMode::Inc).unwrap();
        assert_eq!(tb.gather(&bases), array![[2.0, 3.0], [5.0, 6.0]]);
        assert!(tb.scatter(&mut bases, &array![[1.0, 2.0, 3.0]], WriteMode::Set).is_err());
    }
}

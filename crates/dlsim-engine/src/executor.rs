// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Step execution over packed base arrays
//!
//! The executor owns the plan and the signal layout; simulation state is a
//! separate `Vec<Array3<T>>` so callers can snapshot, restore and clone it
//! (training evaluates many perturbed copies in parallel).

use ahash::AHashMap;
use ndarray::{s, Array2, Array3};
use tracing::trace_span;

use dlsim_model::{Model, NodeId, OpKind, Operator, ProcessMode, ProbeId, SignalId};

use crate::error::{Result, SimError};
use crate::float::SimFloat;
use crate::kernels::{lowpass_step, step_neurons};
use crate::planner::Plan;
use crate::tensor_signal::{SignalLayout, TensorSignal, WriteMode};

/// Values of every input node for one run, shaped `(steps, size_out, batch)`
pub type InputValues<T> = AHashMap<NodeId, Array3<T>>;

/// Simulation state: the current contents of every base array
pub type SignalState<T> = Vec<Array3<T>>;

#[derive(Debug, Clone)]
struct Group {
    kind: OpKind,
    ops: Vec<Operator>,
}

#[derive(Debug, Clone)]
pub struct Executor<T: SimFloat> {
    groups: Vec<Group>,
    layout: SignalLayout<T>,
    probes: Vec<(ProbeId, TensorSignal)>,
    step_signal: TensorSignal,
    time_signal: TensorSignal,
    dt: f64,
    unroll: usize,
}

impl<T: SimFloat> Executor<T> {
    pub fn new(model: &Model, plan: &Plan, layout: SignalLayout<T>, unroll: usize) -> Result<Self> {
        let mut groups = Vec::with_capacity(plan.len());
        for ops in plan {
            let ops: Vec<Operator> = ops.iter().map(|op| model.operators[op.index()].clone()).collect();
            for op in &ops {
                for sig in op.all_signals() {
                    layout.require(sig)?;
                }
                if let Operator::SimProcess {
                    mode: ProcessMode::Set,
                    state: None,
                    ..
                } = op
                {
                    return Err(SimError::Build(format!("{} has no filter state", op)));
                }
            }
            let kind = ops
                .first()
                .map(|op| op.kind())
                .ok_or_else(|| SimError::Build("empty operator group in plan".to_string()))?;
            groups.push(Group { kind, ops });
        }

        let probes = model
            .probes
            .iter()
            .map(|p| Ok((p.id, layout.require(p.signal)?.clone())))
            .collect::<Result<Vec<_>>>()?;
        let step_signal = layout.require(model.step)?.clone();
        let time_signal = layout.require(model.time)?.clone();

        Ok(Self {
            groups,
            layout,
            probes,
            step_signal,
            time_signal,
            dt: model.dt,
            unroll: unroll.max(1),
        })
    }

    pub fn layout(&self) -> &SignalLayout<T> {
        &self.layout
    }

    pub fn unroll(&self) -> usize {
        self.unroll
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn initial_state(&self) -> SignalState<T> {
        self.layout.bases.clone()
    }

    /// Position the clock at `step`; the next step computes `step + 1`
    pub fn set_step(&self, state: &mut [Array3<T>], step: usize) -> Result<()> {
        let step_value = Array2::from_elem((1, 1), T::of_f64(step as f64));
        let time_value = Array2::from_elem((1, 1), T::of_f64(step as f64 * self.dt));
        self.step_signal.scatter(state, &step_value, WriteMode::Set)?;
        self.time_signal.scatter(state, &time_value, WriteMode::Set)
    }

    /// Execute `n_iterations` unrolled blocks of `unroll` steps
    ///
    /// `on_step` is called after every step with its index within this call.
    pub fn run<F>(
        &self,
        state: &mut SignalState<T>,
        inputs: &InputValues<T>,
        n_iterations: usize,
        mut on_step: F,
    ) -> Result<()>
    where
        F: FnMut(usize, &SignalState<T>) -> Result<()>,
    {
        for iteration in 0..n_iterations {
            let _span = trace_span!("unrolled_iteration", iteration).entered();
            for k in 0..self.unroll {
                let index = iteration * self.unroll + k;
                self.step(state, inputs, index)?;
                on_step(index, state)?;
            }
        }
        Ok(())
    }

    /// Execute every group of the plan once
    pub fn step(&self, state: &mut SignalState<T>, inputs: &InputValues<T>, index: usize) -> Result<()> {
        for group in &self.groups {
            let _span = trace_span!("op_group", kind = %group.kind, n_ops = group.ops.len()).entered();
            for op in &group.ops {
                self.execute(op, state, inputs, index)?;
            }
        }
        Ok(())
    }

    /// Current value of every probe as `(size, batch)` in `f64`
    pub fn probe_values(&self, state: &SignalState<T>) -> Vec<(ProbeId, Array2<f64>)> {
        self.probes
            .iter()
            .map(|(id, ts)| (*id, ts.gather(state).mapv(|v| v.into_f64())))
            .collect()
    }

    pub fn probe_signal(&self, id: ProbeId) -> Option<&TensorSignal> {
        self.probes.iter().find(|(p, _)| *p == id).map(|(_, ts)| ts)
    }

    fn ts(&self, sig: SignalId) -> Result<&TensorSignal> {
        self.layout.require(sig)
    }

    fn read(&self, sig: SignalId, state: &SignalState<T>) -> Result<Array2<T>> {
        Ok(self.ts(sig)?.gather(state))
    }

    fn write(&self, sig: SignalId, state: &mut SignalState<T>, values: &Array2<T>, mode: WriteMode) -> Result<()> {
        self.ts(sig)?.scatter(state, values, mode)
    }

    fn execute(
        &self,
        op: &Operator,
        state: &mut SignalState<T>,
        inputs: &InputValues<T>,
        index: usize,
    ) -> Result<()> {
        match op {
            Operator::Reset { dst, value } => {
                let size = self.ts(*dst)?.size();
                self.write(*dst, state, &Array2::from_elem((size, 1), T::of_f64(*value)), WriteMode::Set)
            }
            Operator::Copy { src, dst, inc } => {
                let values = self.read(*src, state)?;
                let mode = if *inc { WriteMode::Inc } else { WriteMode::Set };
                self.write(*dst, state, &values, mode)
            }
            Operator::ElementwiseInc { a, x, y } => {
                let a_val = self.read(*a, state)?;
                let x_val = self.read(*x, state)?;
                let size = self.ts(*y)?.size();
                let product = broadcast_multiply(&a_val, &x_val, size).ok_or_else(|| {
                    SimError::Simulation(format!("cannot broadcast {} into {} values", op, size))
                })?;
                self.write(*y, state, &product, WriteMode::Inc)
            }
            Operator::DotInc { a, x, y } => {
                let a_ts = self.ts(*a)?;
                if a_ts.shape.len() != 2 {
                    return Err(SimError::Simulation(format!("{} needs a matrix, got shape {:?}", op, a_ts.shape)));
                }
                let (rows, cols) = (a_ts.shape[0], a_ts.shape[1]);
                let a_val = a_ts.gather(state);
                let x_val = self.read(*x, state)?;
                if x_val.nrows() != cols {
                    return Err(SimError::ShapeMismatch {
                        context: format!("{}", op),
                        expected: vec![cols],
                        actual: vec![x_val.nrows()],
                    });
                }
                let product = matmul(&a_val, &x_val, rows, cols)?;
                self.write(*y, state, &product, WriteMode::Inc)
            }
            Operator::TimeUpdate { step, time } => {
                let current = self.read(*step, state)?;
                let next = current[[0, 0]].into_f64() + 1.0;
                self.write(*step, state, &Array2::from_elem((1, 1), T::of_f64(next)), WriteMode::Set)?;
                self.write(*time, state, &Array2::from_elem((1, 1), T::of_f64(next * self.dt)), WriteMode::Set)
            }
            Operator::SimNeurons {
                neuron_type,
                j,
                output,
                states,
            } => {
                let current = self.read(*j, state)?;
                let mut neuron_states = states
                    .iter()
                    .map(|s| self.read(*s, state))
                    .collect::<Result<Vec<_>>>()?;
                let out = step_neurons(neuron_type, self.dt, current.view(), &mut neuron_states)?;
                self.write(*output, state, &out, WriteMode::Set)?;
                for (sig, values) in states.iter().zip(neuron_states.iter()) {
                    self.write(*sig, state, values, WriteMode::Set)?;
                }
                Ok(())
            }
            Operator::SimProcess {
                process,
                input,
                output,
                state: filter_state,
                mode,
            } => {
                let x = self.read(*input, state)?;
                match (mode, filter_state) {
                    (ProcessMode::Update, _) => {
                        let y = self.read(*output, state)?;
                        let next = lowpass_step(process, self.dt, &y, &x);
                        self.write(*output, state, &next, WriteMode::Set)
                    }
                    (ProcessMode::Set, Some(filter_state)) => {
                        let y = self.read(*filter_state, state)?;
                        let next = lowpass_step(process, self.dt, &y, &x);
                        self.write(*output, state, &next, WriteMode::Set)?;
                        self.write(*filter_state, state, &next, WriteMode::Set)
                    }
                    (ProcessMode::Set, None) => Err(SimError::Build(format!("{} has no filter state", op))),
                }
            }
            Operator::SimPyFunc {
                function,
                t,
                x,
                output,
            } => {
                let t_val = match t {
                    Some(t) => self.read(*t, state)?[[0, 0]].into_f64(),
                    None => 0.0,
                };
                let x_val = match x {
                    Some(x) => Some(self.read(*x, state)?),
                    None => None,
                };
                let out_ts = match output {
                    Some(o) => Some(self.ts(*o)?),
                    None => None,
                };
                let out_batch = out_ts.map_or(1, |ts| state[ts.key].dim().2);
                let x_batch = x_val.as_ref().map_or(1, |v| v.ncols());
                let batch = out_batch.max(x_batch);

                let mut result = out_ts.map(|ts| Array2::zeros((ts.size(), batch)));
                for b in 0..batch {
                    let args: Vec<f64> = match &x_val {
                        Some(v) => v.column(if x_batch == 1 { 0 } else { b }).iter().map(|e| e.into_f64()).collect(),
                        None => Vec::new(),
                    };
                    let values = function.call(t_val, &args);
                    if let Some(result) = result.as_mut() {
                        check_function_output(function.name(), &values, result.nrows())?;
                        for (k, v) in values.iter().enumerate() {
                            result[[k, b]] = T::of_f64(*v);
                        }
                    }
                }
                match (output, result) {
                    (Some(o), Some(values)) => self.write(*o, state, &values, WriteMode::Set),
                    _ => Ok(()),
                }
            }
            Operator::NodeInput { node, output } => {
                let values = inputs
                    .get(node)
                    .ok_or_else(|| SimError::Simulation(format!("no input values supplied for {}", node)))?;
                if index >= values.dim().0 {
                    return Err(SimError::Simulation(format!(
                        "input values for {} cover {} steps, step {} requested",
                        node,
                        values.dim().0,
                        index
                    )));
                }
                let step_values = values.slice(s![index, .., ..]).to_owned();
                self.write(*output, state, &step_values, WriteMode::Set)
            }
        }
    }
}

/// Check a host function result against the declared output size
pub(crate) fn check_function_output(name: &str, values: &[f64], size: usize) -> Result<()> {
    if values.len() != size {
        return Err(SimError::Simulation(format!(
            "Function '{}' returned {} values, expected {}",
            name,
            values.len(),
            size
        )));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(SimError::Simulation(format!(
            "Function '{}' returned non-finite values",
            name
        )));
    }
    Ok(())
}

/// `a * x` where either operand may have a single row or a single column
fn broadcast_multiply<T: SimFloat>(a: &Array2<T>, x: &Array2<T>, size: usize) -> Option<Array2<T>> {
    let rows_ok = |n: usize| n == 1 || n == size;
    let (na, ba) = a.dim();
    let (nx, bx) = x.dim();
    if !rows_ok(na) || !rows_ok(nx) || (ba != bx && ba != 1 && bx != 1) {
        return None;
    }
    let batch = ba.max(bx);
    let pick = |n: usize, i: usize| if n == 1 { 0 } else { i };
    Some(Array2::from_shape_fn((size, batch), |(i, b)| {
        a[[pick(na, i), pick(ba, b)]] * x[[pick(nx, i), pick(bx, b)]]
    }))
}

/// `A @ x` with `A` stored flattened as `(rows * cols, batch_a)`
fn matmul<T: SimFloat>(a: &Array2<T>, x: &Array2<T>, rows: usize, cols: usize) -> Result<Array2<T>> {
    let to_matrix = |b: usize| {
        Array2::from_shape_vec((rows, cols), a.column(b).to_vec())
            .map_err(|e| SimError::Simulation(format!("bad matrix layout: {}", e)))
    };
    let (batch_a, batch_x) = (a.ncols(), x.ncols());
    if batch_a == 1 {
        return Ok(to_matrix(0)?.dot(x));
    }
    if batch_x != batch_a && batch_x != 1 {
        return Err(SimError::ShapeMismatch {
            context: "matrix batch".to_string(),
            expected: vec![batch_a],
            actual: vec![batch_x],
        });
    }
    let mut out = Array2::zeros((rows, batch_a));
    for b in 0..batch_a {
        let column = x.column(if batch_x == 1 { 0 } else { b });
        out.column_mut(b).assign(&to_matrix(b)?.dot(&column));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::operator_dependency_graph;
    use crate::planner::greedy_planner;
    use crate::signal_order::order_signals;
    use crate::tensor_signal::create_signals;
    use dlsim_model::{NodeFunction, Signal};
    use ndarray::array;

    fn executor(model: &Model, minibatch: usize) -> Executor<f64> {
        let graph = operator_dependency_graph(model).unwrap();
        let plan = greedy_planner(model, &graph).unwrap();
        let (order, plan) = order_signals(model, &plan, 10);
        let layout = create_signals(model, &order, &plan, minibatch).unwrap();
        Executor::new(model, &plan, layout, 1).unwrap()
    }

    #[test]
    fn test_dot_inc_and_time() {
        let mut model = Model::new("dot", 0.01);
        let a = model.add_signal(Signal::new("A", array![[1.0, 2.0], [3.0, 4.0]].into_dyn()));
        let x = model.add_signal(Signal::from_vec("x", vec![1.0, 1.0]).minibatched(true));
        let y = model.add_signal(Signal::zeros("y", &[2]).minibatched(true));
        model.add_op(Operator::Reset { dst: y, value: 0.0 });
        model.add_op(Operator::DotInc { a, x, y });

        let exec = executor(&model, 2);
        let mut state = exec.initial_state();
        exec.set_step(&mut state, 0).unwrap();
        exec.step(&mut state, &InputValues::default(), 0).unwrap();
        exec.step(&mut state, &InputValues::default(), 1).unwrap();

        let y_val = exec.layout().get(y).unwrap().gather(&state);
        assert_eq!(y_val, array![[3.0, 3.0], [7.0, 7.0]]);
        let time = exec.layout().get(model.time).unwrap().gather(&state);
        assert!((time[[0, 0]] - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_function_output_checked() {
        let mut model = Model::new("func", 0.001);
        let out = model.add_signal(Signal::zeros("out", &[2]));
        let time = model.time;
        model.add_op(Operator::SimPyFunc {
            function: NodeFunction::new("bad", |_, _| vec![1.0]),
            t: Some(time),
            x: None,
            output: Some(out),
        });
        let exec = executor(&model, 1);
        let mut state = exec.initial_state();
        let err = exec.step(&mut state, &InputValues::default(), 0).unwrap_err();
        assert!(err.to_string().contains("returned 1 values"));
    }

    #[test]
    fn test_node_input_reads_current_step() {
        let mut model = Model::new("input", 0.001);
        let out = model.add_signal(Signal::zeros("out", &[1]).minibatched(true));
        model.add_op(Operator::NodeInput {
            node: NodeId(0),
            output: out,
        });
        let exec = executor(&model, 2);
        let mut state = exec.initial_state();
        let mut inputs = InputValues::default();
        inputs.insert(NodeId(0), Array3::from_shape_fn((3, 1, 2), |(t, _, b)| (t * 10 + b) as f64));

        let mut seen = Vec::new();
        exec.run(&mut state, &inputs, 3, |i, st| {
            seen.push((i, exec.layout().get(out).unwrap().gather(st)));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen[2].1, array![[20.0, 21.0]]);
        assert!(exec.step(&mut state, &inputs, 3).is_err());
    }

    #[test]
    fn test_broadcast_multiply() {
        let a = array![[2.0]];
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        assert_eq!(broadcast_multiply(&a, &x, 2).unwrap(), array![[2.0, 4.0], [6.0, 8.0]]);
        assert!(broadcast_multiply(&array![[1.0], [2.0], [3.0]], &x, 2).is_none());
    }
}

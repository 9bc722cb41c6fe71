// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Probe recording and the arrays handed back to callers

use ndarray::{Array2, ArrayD, IxDyn};

use dlsim_model::{Model, ProbeId};

use crate::error::{Result, SimError};
use crate::executor::Executor;
use crate::float::SimFloat;

/// Whether the sample taken after step `step` (zero based) is kept
///
/// `period` is the probe's `sample_every` in steps.
pub fn keep_sample(step: usize, period: Option<f64>) -> bool {
    match period {
        Some(period) => ((step + 1) as f64) % period < 1.0,
        None => true,
    }
}

#[derive(Debug, Clone)]
struct ProbeTrace {
    id: ProbeId,
    label: String,
    shape: Vec<usize>,
    minibatched: bool,
    period: Option<f64>,
    samples: Vec<Array2<f64>>,
}

/// Accumulates probe samples across runs until cleared
#[derive(Debug, Clone)]
pub struct ProbeRecorder {
    traces: Vec<ProbeTrace>,
    /// Whether minibatched output keeps a leading batch axis
    batch_axis: bool,
}

impl ProbeRecorder {
    pub fn new<T: SimFloat>(model: &Model, executor: &Executor<T>, batch_axis: bool) -> Result<Self> {
        let traces = model
            .probes
            .iter()
            .map(|probe| {
                let ts = executor
                    .probe_signal(probe.id)
                    .ok_or_else(|| SimError::Build(format!("probe '{}' has no signal", probe.label)))?;
                Ok(ProbeTrace {
                    id: probe.id,
                    label: probe.label.clone(),
                    shape: ts.shape.clone(),
                    minibatched: ts.minibatched,
                    period: probe.sample_every.map(|every| every / model.dt),
                    samples: Vec::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { traces, batch_axis })
    }

    /// Record the values after absolute step `step`, honouring `sample_every`
    pub fn record(&mut self, step: usize, values: Vec<(ProbeId, Array2<f64>)>) {
        for (trace, (id, value)) in self.traces.iter_mut().zip(values) {
            debug_assert_eq!(trace.id, id);
            if keep_sample(step, trace.period) {
                trace.samples.push(value);
            }
        }
    }

    pub fn clear(&mut self) {
        for trace in &mut self.traces {
            trace.samples.clear();
        }
    }

    pub fn n_samples(&self, probe: ProbeId) -> Option<usize> {
        self.traces.iter().find(|t| t.id == probe).map(|t| t.samples.len())
    }

    /// Assemble the recorded samples into caller-facing arrays
    pub fn data(&self) -> ProbeData {
        let entries = self
            .traces
            .iter()
            .map(|trace| ProbeEntry {
                id: trace.id,
                label: trace.label.clone(),
                data: assemble(trace, self.batch_axis),
            })
            .collect();
        ProbeData { entries }
    }
}

/// `(batch, n, size)` for minibatched signals with a batch axis, `(n, size)`
/// for other minibatched signals and `(n, *shape)` otherwise
fn assemble(trace: &ProbeTrace, batch_axis: bool) -> ArrayD<f64> {
    let n = trace.samples.len();
    let size: usize = trace.shape.iter().product();
    if trace.minibatched {
        let batch = trace.samples.first().map_or(1, |s| s.ncols());
        if batch_axis {
            return ArrayD::from_shape_fn(IxDyn(&[batch, n, size]), |idx| trace.samples[idx[1]][[idx[2], idx[0]]]);
        }
        return ArrayD::from_shape_fn(IxDyn(&[n, size]), |idx| trace.samples[idx[0]][[idx[1], 0]]);
    }
    let mut shape = vec![n];
    shape.extend_from_slice(&trace.shape);
    let flat: Vec<f64> = trace.samples.iter().flat_map(|s| s.column(0).to_vec()).collect();
    ArrayD::from_shape_vec(IxDyn(&shape), flat).unwrap_or_else(|_| ArrayD::zeros(IxDyn(&shape)))
}

#[derive(Debug, Clone)]
pub struct ProbeEntry {
    pub id: ProbeId,
    pub label: String,
    pub data: ArrayD<f64>,
}

/// Recorded data of every probe
#[derive(Debug, Clone, Default)]
pub struct ProbeData {
    entries: Vec<ProbeEntry>,
}

impl ProbeData {
    pub fn get(&self, probe: ProbeId) -> Option<&ArrayD<f64>> {
        self.entries.iter().find(|e| e.id == probe).map(|e| &e.data)
    }

    pub fn by_label(&self, label: &str) -> Option<&ArrayD<f64>> {
        self.entries.iter().find(|e| e.label == label).map(|e| &e.data)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProbeEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

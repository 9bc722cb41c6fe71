// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Simulator with precision chosen at runtime from `dtype`

use std::path::Path;

use dlsim_config::Precision;
use dlsim_model::{Model, Network};

use crate::error::Result;
use crate::feeds::InputFeeds;
use crate::optimizer::Optimizer;
use crate::probes::ProbeData;
use crate::simulator::{RunOptions, Simulator, SimulatorOptions};
use crate::training::{Objective, TargetData};

pub enum DynamicSimulator {
    F32(Simulator<f32>),
    F64(Simulator<f64>),
}

macro_rules! dispatch {
    ($self:expr, $sim:ident => $body:expr) => {
        match $self {
            DynamicSimulator::F32($sim) => $body,
            DynamicSimulator::F64($sim) => $body,
        }
    };
}

impl DynamicSimulator {
    pub fn new(network: &Network, options: SimulatorOptions) -> Result<Self> {
        Ok(match options.dtype {
            Precision::Float32 => DynamicSimulator::F32(Simulator::new(network, options)?),
            Precision::Float64 => DynamicSimulator::F64(Simulator::new(network, options)?),
        })
    }

    pub fn from_model(model: Model, options: SimulatorOptions) -> Result<Self> {
        Ok(match options.dtype {
            Precision::Float32 => DynamicSimulator::F32(Simulator::from_model(model, options)?),
            Precision::Float64 => DynamicSimulator::F64(Simulator::from_model(model, options)?),
        })
    }

    pub fn dtype(&self) -> Precision {
        match self {
            DynamicSimulator::F32(_) => Precision::Float32,
            DynamicSimulator::F64(_) => Precision::Float64,
        }
    }

    pub fn step(&mut self) -> Result<()> {
        dispatch!(self, sim => sim.step())
    }

    pub fn run(&mut self, seconds: f64) -> Result<()> {
        dispatch!(self, sim => sim.run(seconds))
    }

    pub fn run_steps(&mut self, n_steps: usize) -> Result<()> {
        dispatch!(self, sim => sim.run_steps(n_steps))
    }

    pub fn run_steps_with(&mut self, n_steps: usize, options: &RunOptions) -> Result<()> {
        dispatch!(self, sim => sim.run_steps_with(n_steps, options))
    }

    pub fn reset(&mut self, seed: Option<u64>) -> Result<()> {
        dispatch!(self, sim => sim.reset(seed))
    }

    pub fn soft_reset(&mut self, include_trainable: bool, include_probes: bool) -> Result<()> {
        dispatch!(self, sim => sim.soft_reset(include_trainable, include_probes))
    }

    pub fn data(&self) -> ProbeData {
        dispatch!(self, sim => sim.data())
    }

    pub fn n_steps(&self) -> usize {
        dispatch!(self, sim => sim.n_steps())
    }

    pub fn time(&self) -> f64 {
        dispatch!(self, sim => sim.time())
    }

    pub fn dt(&self) -> f64 {
        dispatch!(self, sim => sim.dt())
    }

    pub fn trange(&self, dt: Option<f64>) -> Vec<f64> {
        dispatch!(self, sim => sim.trange(dt))
    }

    pub fn train(
        &mut self,
        inputs: &InputFeeds,
        targets: &TargetData,
        optimizer: &mut dyn Optimizer,
        n_epochs: usize,
        objective: &Objective,
        shuffle: bool,
    ) -> Result<Vec<f64>> {
        dispatch!(self, sim => sim.train(inputs, targets, optimizer, n_epochs, objective, shuffle))
    }

    pub fn loss(&self, inputs: &InputFeeds, targets: &TargetData, objective: &Objective) -> Result<f64> {
        dispatch!(self, sim => sim.loss(inputs, targets, objective))
    }

    pub fn save_params(&self, path: &Path, include_local: bool) -> Result<()> {
        dispatch!(self, sim => sim.save_params(path, include_local))
    }

    pub fn load_params(&mut self, path: &Path, include_local: bool) -> Result<()> {
        dispatch!(self, sim => sim.load_params(path, include_local))
    }

    pub fn format_params(&self, msg: Option<&str>) -> Result<String> {
        dispatch!(self, sim => sim.format_params(msg))
    }

    pub fn close(&mut self) {
        dispatch!(self, sim => sim.close())
    }
}

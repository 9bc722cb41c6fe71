// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Benchmark networks and a timing harness
//!
//! Shared by the criterion benches and the `run_benchmarks` tool.

use std::time::Instant;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;

use dlsim_model::{
    Connection, ModelError, ModelResult, Network, NeuronType, Node, ParamInit, Population,
    PopulationId, Probe, ProbeId, ProbeTarget, Transform,
};

use crate::error::Result;
use crate::float::SimFloat;
use crate::simulator::{Simulator, SimulatorOptions};

fn random_matrix(rows: usize, cols: usize, scale: f64, rng: &mut StdRng) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-scale..scale))
}

/// Recurrently connected population integrating a sinusoidal input
pub fn integrator(
    dimensions: usize,
    neurons_per_d: usize,
    neuron_type: NeuronType,
    seed: u64,
) -> ModelResult<(Network, ProbeId)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = dimensions * neurons_per_d;
    let mut net = Network::new("integrator").with_seed(seed);

    let input = net.add_node(Node::time_function("input", dimensions, move |t| {
        (0..dimensions).map(|d| (t * (d + 1) as f64).sin()).collect()
    }));
    let ens = net.add_population(
        Population::new("ens", n, neuron_type)
            .with_gain(ParamInit::Uniform { low: 0.5, high: 2.0 })
            .with_bias(ParamInit::Uniform { low: -1.0, high: 1.0 }),
    );

    let encoders = random_matrix(n, dimensions, 0.1, &mut rng);
    let recurrent = random_matrix(n, n, 1.0 / n as f64, &mut rng);
    net.connect(
        Connection::new(input, ens)
            .with_label("input_ens")
            .with_transform(Transform::Matrix(encoders)),
    )?;
    net.connect(
        Connection::new(ens, ens)
            .with_label("recurrent")
            .with_transform(Transform::Matrix(recurrent))
            .with_synapse(Some(0.1)),
    )?;
    let probe = net.add_probe(
        Probe::new(ProbeTarget::NeuronOutput(ens))
            .with_label("output")
            .with_synapse(0.01),
    )?;
    Ok((net, probe))
}

/// Feed-forward stack of `n_layers` populations of `width` neurons
pub fn chain(
    n_layers: usize,
    width: usize,
    neuron_type: NeuronType,
    seed: u64,
) -> ModelResult<(Network, ProbeId)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut net = Network::new("chain").with_seed(seed);
    let stim = net.add_node(Node::constant("stim", vec![0.5; width]));

    let mut prev: Option<PopulationId> = None;
    for layer in 0..n_layers.max(1) {
        let pop = net.add_population(
            Population::new(format!("layer{}", layer), width, neuron_type.clone())
                .with_bias(ParamInit::Uniform { low: 0.0, high: 1.0 }),
        );
        let connection = match prev {
            None => Connection::new(stim, pop),
            Some(prev) => Connection::new(prev, pop).with_transform(Transform::Matrix(random_matrix(
                width,
                width,
                1.0 / width as f64,
                &mut rng,
            ))),
        };
        net.connect(connection.with_label(format!("ff{}", layer)))?;
        prev = Some(pop);
    }
    let last = prev.ok_or_else(|| ModelError::InvalidParameter("chain needs a layer".to_string()))?;
    let probe = net.add_probe(Probe::new(ProbeTarget::NeuronOutput(last)).with_label("output"))?;
    Ok((net, probe))
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkResult {
    pub name: String,
    pub dtype: String,
    pub planner: String,
    pub unroll: usize,
    pub n_groups: usize,
    pub build_secs: f64,
    pub run_secs: f64,
    pub steps_per_sec: f64,
}

/// Build a simulator for `network` and time `n_steps` steps
pub fn run_profile<T: SimFloat>(
    name: &str,
    network: &Network,
    options: SimulatorOptions,
    n_steps: usize,
) -> Result<BenchmarkResult> {
    let planner = options.planner.to_string();
    let unroll = options.unroll_simulation;

    let started = Instant::now();
    let mut sim = Simulator::<T>::new(network, options)?;
    let build_secs = started.elapsed().as_secs_f64();

    let started = Instant::now();
    sim.run_steps(n_steps)?;
    let run_secs = started.elapsed().as_secs_f64();
    let n_groups = sim.executor().n_groups();
    sim.close();

    let result = BenchmarkResult {
        name: name.to_string(),
        dtype: T::NAME.to_string(),
        planner,
        unroll,
        n_groups,
        build_secs,
        run_secs,
        steps_per_sec: n_steps as f64 / run_secs.max(f64::EPSILON),
    };
    info!(
        "[BENCH] {} ({}, planner={}, unroll={}): build {:.3}s, run {:.3}s, {:.0} steps/s",
        result.name, result.dtype, result.planner, result.unroll, build_secs, run_secs, result.steps_per_sec
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlsim_config::PlannerKind;

    #[test]
    fn test_benchmark_networks_build_and_run() {
        let (net, probe) = integrator(2, 4, NeuronType::lif_rate(), 0).unwrap();
        let options = SimulatorOptions::default().with_seed(0).with_progress_bar(false);
        let result = run_profile::<f32>("integrator", &net, options, 5).unwrap();
        assert_eq!(result.unroll, 1);
        assert!(result.n_groups > 0);
        assert_eq!(probe, ProbeId(0));

        let (net, _) = chain(3, 4, NeuronType::rectified_linear(), 0).unwrap();
        assert_eq!(net.populations().len(), 3);
        assert_eq!(net.connections().len(), 3);
        let options = SimulatorOptions::default()
            .with_seed(0)
            .with_planner(PlannerKind::Transitive)
            .with_unroll(2)
            .with_progress_bar(false);
        run_profile::<f64>("chain", &net, options, 4).unwrap();
    }
}

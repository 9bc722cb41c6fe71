// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Training a single connection weight toward a constant target

use dlsim::config::TrainingConfig;
use dlsim::model::NodeId;
use dlsim::prelude::*;
use ndarray::Array3;

/// `input -> (w = 1) -> relay`, probed on the relay
fn gain_network() -> (Network, NodeId, ProbeId) {
    let mut net = Network::new("gain");
    let input = net.add_node(Node::constant("input", vec![0.0]));
    let relay = net.add_node(Node::passthrough("relay", 1));
    net.connect(
        Connection::new(input, relay)
            .with_label("gain")
            .with_synapse(None),
    )
    .unwrap();
    let probe = net
        .add_probe(Probe::new(ProbeTarget::NodeOutput(relay)))
        .unwrap();
    (net, input, probe)
}

fn data(input: NodeId, probe: ProbeId) -> (InputFeeds, TargetData) {
    let mut inputs = InputFeeds::new();
    inputs.insert(input, Array3::ones((4, 3, 1)));
    let mut targets = TargetData::new();
    targets.insert(probe, Array3::from_elem((4, 3, 1), 2.0));
    (inputs, targets)
}

fn simulator(net: &Network) -> Simulator<f64> {
    Simulator::new(
        net,
        SimulatorOptions::default()
            .with_seed(0)
            .with_minibatch_size(2)
            .with_progress_bar(false),
    )
    .unwrap()
}

#[test]
fn test_gradient_descent_fits_the_gain() {
    let (net, input, probe) = gain_network();
    let (inputs, targets) = data(input, probe);
    let mut sim = simulator(&net);

    let initial = sim.loss(&inputs, &targets, &Objective::Mse).unwrap();
    assert!((initial - 1.0).abs() < 1e-9);

    let mut optimizer = GradientDescent::new(0.1);
    let losses = sim
        .train(&inputs, &targets, &mut optimizer, 50, &Objective::Mse, true)
        .unwrap();
    assert_eq!(losses.len(), 50);
    assert!(losses[0] < initial);
    assert!(losses.windows(2).all(|w| w[1] <= w[0] + 1e-12));

    let fitted = sim.loss(&inputs, &targets, &Objective::Mse).unwrap();
    assert!(fitted < 1e-4, "loss after training: {}", fitted);
    assert!(sim.format_params(None).unwrap().contains("gain.weights"));

    // training does not advance the simulation
    assert_eq!(sim.n_steps(), 0);
    sim.close();
}

#[test]
fn test_soft_reset_restores_trainable_values() {
    let (net, input, probe) = gain_network();
    let (inputs, targets) = data(input, probe);
    let mut sim = simulator(&net);

    let mut optimizer = Momentum::new(0.05, 0.5);
    sim.train(&inputs, &targets, &mut optimizer, 20, &Objective::Mse, false)
        .unwrap();
    let trained = sim.loss(&inputs, &targets, &Objective::Mse).unwrap();
    assert!(trained < 0.5);

    sim.soft_reset(false, true).unwrap();
    let kept = sim.loss(&inputs, &targets, &Objective::Mse).unwrap();
    assert!((kept - trained).abs() < 1e-12);

    sim.soft_reset(true, true).unwrap();
    let restored = sim.loss(&inputs, &targets, &Objective::Mse).unwrap();
    assert!((restored - 1.0).abs() < 1e-9);
    sim.close();
}

#[test]
fn test_trained_weights_change_simulation_output() {
    let (net, input, probe) = gain_network();
    let (inputs, targets) = data(input, probe);
    let mut sim = simulator(&net);

    let config = TrainingConfig {
        n_epochs: 40,
        learning_rate: 0.1,
        ..TrainingConfig::default()
    };
    sim.train_with_config(&inputs, &targets, &config, &Objective::Mse)
        .unwrap();

    let mut feeds = InputFeeds::new();
    feeds.insert(input, Array3::ones((2, 3, 1)));
    sim.run_steps_with(3, &RunOptions::default().with_feeds(feeds))
        .unwrap();
    let data = sim.data();
    let out = data.get(probe).unwrap();
    assert_eq!(out.shape(), &[2, 3, 1]);
    assert!(out.iter().all(|v| (v - 2.0).abs() < 1e-2));
    sim.close();
}

#[test]
fn test_custom_objective_and_bad_targets() {
    let (net, input, probe) = gain_network();
    let (inputs, targets) = data(input, probe);
    let mut sim = simulator(&net);

    let mae = Objective::custom(|out, target| {
        out.iter()
            .zip(target.iter())
            .map(|(o, t)| (o - t).abs())
            .sum::<f64>()
            / out.len() as f64
    });
    let loss = sim.loss(&inputs, &targets, &mae).unwrap();
    assert!((loss - 1.0).abs() < 1e-9);

    let mut short = TargetData::new();
    short.insert(probe, Array3::from_elem((4, 2, 1), 2.0));
    assert!(sim.loss(&inputs, &short, &Objective::Mse).is_err());

    sim.close();
}

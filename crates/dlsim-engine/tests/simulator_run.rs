// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end runs: minibatching, downsampling, unrolling and output files

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dlsim_engine::{InputFeeds, RunOptions, Simulator, SimulatorOptions, PROFILE_FILE};
use dlsim_model::{Connection, Network, NeuronType, Node, Population, Probe, ProbeTarget};
use ndarray::Array3;
use tempfile::TempDir;

fn options() -> SimulatorOptions {
    SimulatorOptions::default()
        .with_seed(0)
        .with_progress_bar(false)
}

#[test]
fn test_minibatch_feeds_are_independent() {
    let mut net = Network::new("batched");
    let input = net.add_node(Node::constant("input", vec![0.0, 0.0]));
    let probe = net
        .add_probe(Probe::new(ProbeTarget::NodeOutput(input)))
        .unwrap();

    let mut sim = Simulator::<f64>::new(&net, options().with_minibatch_size(3)).unwrap();
    let mut feeds = InputFeeds::new();
    feeds.insert(
        input,
        Array3::from_shape_fn((3, 4, 2), |(b, t, k)| (100 * b + 10 * t + k) as f64),
    );
    sim.run_steps_with(4, &RunOptions::default().with_feeds(feeds))
        .unwrap();

    let data = sim.data();
    let out = data.get(probe).unwrap();
    assert_eq!(out.shape(), &[3, 4, 2]);
    assert_eq!(out[[2, 3, 1]], 231.0);
    assert_eq!(out[[0, 1, 0]], 10.0);
    sim.close();
}

#[test]
fn test_sample_every_downsamples() {
    let mut net = Network::new("sampled");
    let clock = net.add_node(Node::time_function("clock", 1, |t| vec![t]));
    let dense = net.add_probe(Probe::new(ProbeTarget::NodeOutput(clock))).unwrap();
    let sparse = net
        .add_probe(Probe::new(ProbeTarget::NodeOutput(clock)).sample_every(0.005))
        .unwrap();

    let mut sim = Simulator::<f64>::new(&net, options()).unwrap();
    sim.run_steps(12).unwrap();
    sim.run_steps(8).unwrap();

    let data = sim.data();
    assert_eq!(data.get(dense).unwrap().shape(), &[20, 1]);
    let sparse = data.get(sparse).unwrap();
    assert_eq!(sparse.shape(), &[4, 1]);
    for (i, t) in sim.trange(Some(0.005)).iter().enumerate() {
        assert!((sparse[[i, 0]] - t).abs() < 1e-9);
    }
    sim.close();
}

#[test]
fn test_unrolled_extra_steps_execute_but_are_not_recorded() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut net = Network::new("unrolled");
    let clock = net.add_node(Node::time_function("clock", 1, move |t| {
        counter.fetch_add(1, Ordering::SeqCst);
        vec![t]
    }));
    let probe = net.add_probe(Probe::new(ProbeTarget::NodeOutput(clock))).unwrap();

    let mut sim = Simulator::<f64>::new(&net, options().with_unroll(3)).unwrap();
    sim.run_steps(7).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 9);
    assert_eq!(sim.n_steps(), 7);
    assert_eq!(sim.data().get(probe).unwrap().shape(), &[7, 1]);

    // the next run continues from the recorded step count
    sim.run_steps(3).unwrap();
    let data = sim.data();
    let clock_values = data.get(probe).unwrap();
    assert!((clock_values[[7, 0]] - 0.008).abs() < 1e-12);
    sim.close();
}

#[test]
fn test_synapse_state_survives_between_runs() {
    let mut net = Network::new("filtered");
    let input = net.add_node(Node::constant("input", vec![1.0]));
    let relay = net.add_node(Node::passthrough("relay", 1));
    net.connect(Connection::new(input, relay).with_synapse(None)).unwrap();
    let probe = net
        .add_probe(Probe::new(ProbeTarget::NodeOutput(relay)).with_synapse(0.01))
        .unwrap();

    let mut split = Simulator::<f64>::new(&net, options()).unwrap();
    split.run_steps(5).unwrap();
    split.run_steps(5).unwrap();
    let mut whole = Simulator::<f64>::new(&net, options()).unwrap();
    whole.run_steps(10).unwrap();

    let a = split.data();
    let b = whole.data();
    assert_eq!(a.get(probe), b.get(probe));
    let values = a.get(probe).unwrap();
    assert!(values[[9, 0]] > values[[0, 0]]);
    assert!(values[[9, 0]] < 1.0);
    split.close();
    whole.close();
}

#[test]
fn test_lif_population_spikes() {
    let mut net = Network::new("spiking");
    let input = net.add_node(Node::constant("input", vec![2.0]));
    let ens = net.add_population(Population::new("ens", 1, NeuronType::lif()));
    net.connect(Connection::new(input, ens).with_synapse(None)).unwrap();
    let probe = net.add_probe(Probe::new(ProbeTarget::NeuronOutput(ens))).unwrap();

    let mut sim = Simulator::<f32>::new(&net, options()).unwrap();
    sim.run(0.5).unwrap();
    let data = sim.data();
    let spikes = data.get(probe).unwrap();
    let n_spikes = spikes.iter().filter(|v| **v > 0.0).count();
    // LIF rate for J = 2 is about 63 Hz
    assert!((25..=40).contains(&n_spikes), "{} spikes", n_spikes);
    sim.close();
}

#[test]
fn test_tensorboard_and_profile_outputs() {
    let tmp = TempDir::new().unwrap();
    let mut net = Network::new("traced net");
    let input = net.add_node(Node::constant("input", vec![1.0]));
    net.add_probe(Probe::new(ProbeTarget::NodeOutput(input))).unwrap();

    let mut sim = Simulator::<f32>::new(
        &net,
        options().with_tensorboard(true).with_data_dir(tmp.path()),
    )
    .unwrap();
    sim.run_steps_with(5, &RunOptions::default().with_profile(true))
        .unwrap();
    sim.run_steps(5).unwrap();

    let run_dir = sim.summary_dir().unwrap().to_path_buf();
    assert!(run_dir.ends_with("traced_net/run_0"));
    let graph: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(run_dir.join("graph.json")).unwrap()).unwrap();
    assert_eq!(graph["dtype"], "float32");
    assert!(!graph["groups"].as_array().unwrap().is_empty());

    let events = std::fs::read_to_string(run_dir.join("events.jsonl")).unwrap();
    assert_eq!(events.lines().count(), 2);
    assert!(tmp.path().join(PROFILE_FILE).exists());

    sim.reset(None).unwrap();
    assert!(sim.summary_dir().unwrap().ends_with("traced_net/run_1"));
    sim.close();
}

// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # dlsim Engine
//!
//! Compiles a [`dlsim_model::Model`] into an executable plan and runs it.
//!
//! ## Pipeline
//! 1. **Dependency graph**: operators ordered by the set/inc/read/update phases
//! 2. **Planning**: mergeable operators grouped so each group runs as one batch
//! 3. **Signal ordering**: signals sorted so grouped reads are contiguous
//! 4. **Packing**: signals packed into base arrays of shape `(rows, row_size, batch)`
//! 5. **Execution**: unrolled step loop with probes, input feeds and minibatching
//!
//! ## Example
//!
//! ```rust,no_run
//! use dlsim_engine::{Simulator, SimulatorOptions};
//! use dlsim_model::{Network, Node, Probe, ProbeTarget};
//!
//! let mut net = Network::new("example");
//! let input = net.add_node(Node::constant("input", vec![0.0]));
//! let probe = net.add_probe(Probe::new(ProbeTarget::NodeOutput(input))).unwrap();
//!
//! let mut sim = Simulator::<f32>::new(&net, SimulatorOptions::default()).unwrap();
//! sim.run_steps(10).unwrap();
//! assert_eq!(sim.data().get(probe).unwrap().shape(), &[10, 1]);
//! sim.close();
//! ```

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod backend;
pub mod benchmarks;
pub mod dynamic;
pub mod error;
pub mod executor;
pub mod feeds;
pub mod float;
pub mod graph;
pub mod kernels;
pub mod optimizer;
pub mod params;
pub mod planner;
pub mod probes;
pub mod progress;
pub mod signal_order;
pub mod simulator;
pub mod summary;
pub mod tensor_signal;
pub mod training;

pub use backend::{select_backend, BackendDecision, BackendType};
pub use dynamic::DynamicSimulator;
pub use error::{Result, SimError};
pub use executor::{Executor, InputValues, SignalState};
pub use feeds::{check_input_feeds, generate_inputs, InputFeeds};
pub use float::SimFloat;
pub use graph::{operator_dependency_graph, OpGraph};
pub use optimizer::{optimizer_from_config, Adam, GradientDescent, Momentum, Optimizer};
pub use params::{format_params, ParamArray, ParamFile};
pub use planner::{
    greedy_planner, mergeable, noop_planner, plan_operators, transitive_planner, tree_planner,
    validate_plan, Plan,
};
pub use probes::{keep_sample, ProbeData, ProbeEntry};
pub use signal_order::{hamming_sort, noop_order_signals, order_signals};
pub use simulator::{RunOptions, Simulator, SimulatorOptions, PROFILE_FILE};
pub use tensor_signal::{create_signals, SignalLayout, TensorSignal};
pub use training::{minibatch_generator, Minibatch, Objective, TargetData};

// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # dlsim-model
//!
//! Describes networks and lowers them into the flat signal/operator form the
//! engine executes.
//!
//! ```rust
//! use dlsim_model::{build, Connection, Network, NeuronType, Node, Population, Probe, ProbeTarget};
//!
//! let mut net = Network::new("demo");
//! let stim = net.add_node(Node::constant("stim", vec![0.5]));
//! let ens = net.add_population(Population::new("ens", 1, NeuronType::rectified_linear()));
//! net.connect(Connection::new(stim, ens)).unwrap();
//! net.add_probe(Probe::new(ProbeTarget::NeuronOutput(ens))).unwrap();
//!
//! let model = build(&net, 0.001, 0).unwrap();
//! assert_eq!(model.probes.len(), 1);
//! ```

pub mod builder;
pub mod error;
pub mod ids;
pub mod model;
pub mod network;
pub mod neurons;
pub mod operator;
pub mod signal;

pub use builder::build;
pub use error::{ModelError, ModelResult};
pub use ids::{ConnectionId, NodeId, OpId, PopulationId, ProbeId, SignalId};
pub use model::{InputInfo, InputSource, Model, ProbeInfo};
pub use network::{
    Connection, Endpoint, Network, Node, NodeFunction, NodeOutput, ParamInit, Population, Probe,
    ProbeTarget, Transform, DEFAULT_SYNAPSE_TAU,
};
pub use neurons::NeuronType;
pub use operator::{Lowpass, OpKind, Operator, ProcessMode};
pub use signal::{Signal, SignalView};

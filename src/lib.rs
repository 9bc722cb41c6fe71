//! # dlsim - neural simulation on a batched tensor engine
//!
//! dlsim builds a network of populations, nodes, connections and probes into
//! a flat model of signals and operators. It then compiles that model into a
//! planned, batched execution graph and runs it.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! dlsim = "0.1"
//! ```
//!
//! ```rust,no_run
//! use dlsim::prelude::*;
//!
//! let mut net = Network::new("quickstart");
//! let input = net.add_node(Node::time_function("input", 50, |t| vec![t.sin(); 50]));
//! let ens = net.add_population(Population::new("ens", 50, NeuronType::lif()));
//! net.connect(Connection::new(input, ens))?;
//! let probe = net.add_probe(Probe::new(ProbeTarget::NeuronOutput(ens)).with_synapse(0.01))?;
//!
//! let options = SimulatorOptions::default().with_minibatch_size(4).with_unroll(10);
//! let mut sim = Simulator::<f32>::new(&net, options)?;
//! sim.run(1.0)?;
//! let spikes = sim.data();
//! assert_eq!(spikes.get(probe).unwrap().shape(), &[4, 1000, 50]);
//! sim.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Foundation: dlsim-config, dlsim-observability          │
//! │  (TOML configuration, logging, trace profiling)         │
//! └─────────────────────────────────────────────────────────┘
//!                         ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │  Model: dlsim-model                                     │
//! │  (Network description, signals, operators, builder)    │
//! └─────────────────────────────────────────────────────────┘
//!                         ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │  Engine: dlsim-engine                                   │
//! │  (Planner, signal packing, executor, simulator, train)  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Feature Flags
//!
//! - **`file-logging`**: per-run JSON log folders via `tracing-appender`
//!
//! ## License
//!
//! Apache-2.0

// Re-export foundation
pub use dlsim_config as config;
pub use dlsim_observability as observability;

// Re-export model and engine
pub use dlsim_engine as engine;
pub use dlsim_model as model;

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude - commonly used types and traits
pub mod prelude {
    pub use crate::config::{DeviceSpec, DlsimConfig, OptimizerKind, PlannerKind, Precision};
    pub use crate::engine::{
        Adam, DynamicSimulator, GradientDescent, InputFeeds, Momentum, Objective, Optimizer,
        ProbeData, RunOptions, SimError, Simulator, SimulatorOptions, TargetData,
    };
    pub use crate::model::{
        Connection, Network, NeuronType, Node, ParamInit, Population, Probe, ProbeId, ProbeTarget,
        Transform,
    };
}
